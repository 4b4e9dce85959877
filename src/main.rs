use std::ffi::CString;
use std::io::Write;
use std::ops::ControlFlow;
use std::{env, process::exit};
use tracing_subscriber::EnvFilter;

use symrez::{ContextBuilder, ImageRef};

struct Opts {
    /// Libraries to dlopen before resolving.
    load: Vec<String>,

    /// Only report exported symbols.
    exported: bool,

    /// The image to open: a path, a file name, `@main`, or `@dyld`.
    image: String,

    /// Symbols to resolve. Every symbol is listed when empty.
    symbols: Vec<String>,
}

fn main() {
    setup_logging();

    let args: Vec<String> = env::args().collect();
    let opts = match parse_opts(&args) {
        Some(opts) => opts,
        None => {
            eprintln!("usage: symrez [--load <path>]... [--exported] [<image>] [<symbol>...]");
            exit(1);
        }
    };

    for path in &opts.load {
        if let Err(e) = load_library(path) {
            eprintln!("symrez: {}", e);
            exit(1);
        }
    }

    let image = match opts.image.as_str() {
        "@main" => ImageRef::MainExecutable,
        "@dyld" => ImageRef::Dyld,
        name => ImageRef::Name(name),
    };
    let ctx = match ContextBuilder::new().open(image) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("symrez: {}: {}", opts.image, e);
            exit(1);
        }
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if opts.symbols.is_empty() {
        ctx.for_each(|name, address| {
            match writeln!(out, "0x{:016x} {}", address, String::from_utf8_lossy(name)) {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(()),
            }
        });
        return;
    }

    let mut missing = false;
    for symbol in &opts.symbols {
        let address = if opts.exported {
            ctx.resolve_exported(symbol)
        } else {
            ctx.resolve(symbol)
        };
        match address {
            Some(address) => {
                let _ = writeln!(out, "0x{:016x} {}", address, symbol);
            }
            None => {
                eprintln!("symrez: {}: not found", symbol);
                missing = true;
            }
        }
    }
    if missing {
        exit(2);
    }
}

fn load_library(path: &str) -> Result<(), String> {
    let c_path = CString::new(path).map_err(|_| format!("{}: invalid path", path))?;
    let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };
    if handle.is_null() {
        return Err(format!("{}: dlopen failed", path));
    }
    Ok(())
}

fn parse_opts(args: &[String]) -> Option<Opts> {
    let mut load = Vec::new();
    let mut exported = false;
    let mut positional: Vec<String> = Vec::new();
    let mut i = 1; // Skip program name
    while i < args.len() {
        if args[i] == "--load" {
            load.push(args.get(i + 1)?.clone());
            i += 2;
        } else if args[i] == "--exported" {
            exported = true;
            i += 1;
        } else if args[i] == "--help" || args[i] == "-h" {
            return None;
        } else {
            positional.push(args[i].clone());
            i += 1;
        }
    }
    let mut positional = positional.into_iter();
    let image = positional.next().unwrap_or_else(|| "@main".to_string());
    Some(Opts {
        load,
        exported,
        image,
        symbols: positional.collect(),
    })
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}
