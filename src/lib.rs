//! SymRez - in-process Mach-O symbol resolution.
//!
//! SymRez finds the address of any symbol in an image loaded into the current
//! process, including private symbols `dlsym` cannot see. It reads the image's
//! symbol table and export trie straight from memory, follows re-exports into
//! dependent images, and signs code pointers on arm64e.
//!
//! ```no_run
//! use symrez::{Context, ImageRef};
//!
//! let ctx = Context::open(ImageRef::Name("libsystem_kernel.dylib"))?;
//! let getpid = ctx.resolve("_getpid");
//! # Ok::<(), symrez::Error>(())
//! ```
//!
//! # Modules
//!
//! - [`registry`] - Locating loaded images
//! - [`image`] - Mach-O header and load command walking
//! - [`linkedit`] - Symbol table and export trie location
//! - [`symtab`] - `nlist_64` symbol table lookup
//! - [`exports`] - Export trie lookup and traversal
//! - [`resolve`] - Lookup order across an image and its dependencies
//! - [`iter`] - Resumable symbol enumeration
//! - [`ptrauth`] - Code pointer signing
//! - [`context`] - The public resolution context
//!
//! # Error Handling
//!
//! Opening a context reports failures through [`Error`]. Lookups themselves
//! only ever answer with an address or `None`.

pub mod context;
pub mod exports;
pub mod image;
pub mod iter;
pub mod linkedit;
pub mod macho;
pub mod ptrauth;
pub mod registry;
pub mod resolve;
pub mod symtab;
pub mod sys;
pub mod view;

/// Error type for opening images
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("no image registry is available")]
    NoRegistry,

    #[error("mach-o error: {0}")]
    Mach(#[from] MachError),
}

/// Error type for malformed images
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MachError {
    #[error("bad magic 0x{0:x}, not a 64-bit Mach-O image")]
    BadMagic(u32),

    #[error("missing {0} segment")]
    MissingSegment(&'static str),

    #[error("missing LC_SYMTAB")]
    MissingSymtab,

    #[error("truncated image")]
    Truncated,
}

pub type Result<T> = core::result::Result<T, Error>;

pub use context::{Context, ContextBuilder};
pub use iter::{OwnedSymbol, Symbol, SymbolIter};
pub use registry::{ImageRef, ImageRegistry, LoadedImage, StaticRegistry};

/// Opens `image`, resolves `symbol`, and closes it again.
///
/// Returns `None` when the image is not loaded or the symbol is not found.
pub fn resolve_once(image: ImageRef<'_>, symbol: &str) -> Option<usize> {
    match Context::open(image) {
        Ok(ctx) => ctx.resolve(symbol),
        Err(e) => {
            tracing::debug!("resolve_once: {}", e);
            None
        }
    }
}

/// Like [`resolve_once`] for the image at `header`.
///
/// # Safety
///
/// `header` must point to a mapped 64-bit Mach-O image.
pub unsafe fn resolve_once_header(header: usize, symbol: &str) -> Option<usize> {
    match unsafe { Context::from_header(header) } {
        Ok(ctx) => ctx.resolve(symbol),
        Err(e) => {
            tracing::debug!("resolve_once_header: {}", e);
            None
        }
    }
}
