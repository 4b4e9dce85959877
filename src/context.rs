//! Resolution contexts.
//!
//! A [`Context`] is opened once per image and answers any number of lookups
//! against it. Dropping it releases everything it holds.

use crate::exports::{ExportData, TrieWalker};
use crate::image::Image;
use crate::iter::SymbolIter;
use crate::linkedit::Resolution;
use crate::registry::{self, ImageRef, ImageRegistry};
use crate::resolve::{self, Visibility};
use crate::{Error, Result};
use std::ops::ControlFlow;
use tracing::debug;

/// Symbol resolution state for one loaded image.
pub struct Context<'r> {
    registry: &'r dyn ImageRegistry,
    res: Resolution,
    iter: Option<Box<SymbolIter>>,
}

impl std::fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("header", &format_args!("0x{:x}", self.res.image.header()))
            .field("slide", &self.res.slide)
            .field("symbols", &self.res.symtab.len())
            .field("exports", &self.res.exports.map(|trie| trie.len()))
            .finish()
    }
}

/// Options for opening a [`Context`].
pub struct ContextBuilder<'r> {
    registry: Option<&'r dyn ImageRegistry>,
    load_bias: Option<isize>,
}

impl Default for ContextBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'r> ContextBuilder<'r> {
    pub fn new() -> Self {
        Self {
            registry: None,
            load_bias: None,
        }
    }

    /// Resolve images against `registry` instead of the process registry.
    pub fn registry(mut self, registry: &'r dyn ImageRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace the computed load bias, e.g. when the image was mapped for
    /// static analysis rather than loaded by dyld.
    pub fn load_bias(mut self, load_bias: isize) -> Self {
        self.load_bias = Some(load_bias);
        self
    }

    fn resolve_registry(&self) -> Result<&'r dyn ImageRegistry> {
        match self.registry {
            Some(registry) => Ok(registry),
            None => registry::process_registry().ok_or(Error::NoRegistry),
        }
    }

    /// Opens the image named by `image`.
    ///
    /// Without any registry the main executable is found by probing the
    /// address space.
    pub fn open(self, image: ImageRef<'_>) -> Result<Context<'r>> {
        let registry = match self.resolve_registry() {
            Ok(registry) => registry,
            Err(Error::NoRegistry) if image == ImageRef::MainExecutable => {
                let header = registry::probe_base_address().ok_or(Error::NoRegistry)?;
                // A probed header has no registry to resolve dependencies against.
                return unsafe { self.build(&NO_IMAGES, header) };
            }
            Err(e) => return Err(e),
        };
        let header = registry::find_image(registry, image)
            .ok_or_else(|| Error::ImageNotFound(describe(image)))?;
        // Headers from a registry satisfy the image contract.
        unsafe { self.build(registry, header) }
    }

    /// Opens the image whose header is at `header`.
    ///
    /// # Safety
    ///
    /// `header` must point to a mapped 64-bit Mach-O image that stays mapped
    /// while the context is used.
    pub unsafe fn open_header(self, header: usize) -> Result<Context<'r>> {
        let registry = self.resolve_registry().unwrap_or(&NO_IMAGES);
        unsafe { self.build(registry, header) }
    }

    unsafe fn build(self, registry: &'r dyn ImageRegistry, header: usize) -> Result<Context<'r>> {
        let image = unsafe { Image::from_header(header)? };
        let mut res = Resolution::new(image)?;
        if let Some(load_bias) = self.load_bias {
            res.slide = load_bias;
        }
        debug!("opened image 0x{:x} (slide 0x{:x})", header, res.slide);
        Ok(Context {
            registry,
            res,
            iter: None,
        })
    }
}

fn describe(image: ImageRef<'_>) -> String {
    match image {
        ImageRef::MainExecutable => "main executable".to_string(),
        ImageRef::Dyld => "dyld".to_string(),
        ImageRef::Name(name) => name.to_string(),
    }
}

/// Registry used when none is available: dependencies are never found.
static NO_IMAGES: registry::StaticRegistry = registry::StaticRegistry::empty();

impl Context<'static> {
    /// Opens an image of the current process.
    pub fn open(image: ImageRef<'_>) -> Result<Context<'static>> {
        ContextBuilder::new().open(image)
    }

    /// Opens the image at `header`, resolving dependencies in the current
    /// process.
    ///
    /// # Safety
    ///
    /// See [`ContextBuilder::open_header`].
    pub unsafe fn from_header(header: usize) -> Result<Context<'static>> {
        unsafe { ContextBuilder::new().open_header(header) }
    }
}

impl<'r> Context<'r> {
    /// Address of the image's Mach-O header.
    pub fn header(&self) -> usize {
        self.res.image.header()
    }

    pub fn image(&self) -> &Image {
        &self.res.image
    }

    /// Resolves `symbol` (mangled, e.g. `_malloc`) in this image and the
    /// images it re-exports.
    pub fn resolve(&self, symbol: &str) -> Option<usize> {
        let address = resolve::resolve(self.registry, &self.res, symbol.as_bytes(), Visibility::All);
        log_result(symbol, address);
        address
    }

    /// Like [`Context::resolve`] but skips non-exported symbols, the same
    /// visibility `dlsym` has.
    pub fn resolve_exported(&self, symbol: &str) -> Option<usize> {
        let address =
            resolve::resolve(self.registry, &self.res, symbol.as_bytes(), Visibility::Exported);
        log_result(symbol, address);
        address
    }

    /// Calls `f` with every symbol table entry and then every export.
    ///
    /// Stops early when `f` returns [`ControlFlow::Break`]. Produces the same
    /// sequence as [`Context::iter`] without keeping iterator state.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&[u8], usize) -> ControlFlow<()>,
    {
        let res = &self.res;
        let skip_external = res.has_exports();
        let mut index = 0;
        while let Some((found, name, value)) = res.symtab.next_usable(index, skip_external) {
            index = found + 1;
            if f(name, (value as usize).wrapping_add_signed(res.slide)).is_break() {
                return;
            }
        }

        let Some(trie) = res.exports else {
            return;
        };
        let mut walker = TrieWalker::new(trie.0);
        while let Some(entry) = walker.next() {
            let Some((_, export)) = ExportData::parse(trie.0, entry.payload) else {
                continue;
            };
            if f(&entry.name, export.list_address(res.image.header())).is_break() {
                return;
            }
        }
    }

    /// The context's iterator, created on first use.
    ///
    /// The same iterator is returned on every call; it is not reset.
    pub fn iter(&mut self) -> &mut SymbolIter {
        let res = self.res;
        self.iter
            .get_or_insert_with(|| Box::new(SymbolIter::new(res)))
    }

    /// Overrides the load bias added to symbol table values.
    ///
    /// Export trie addresses are relative to the header and are not affected.
    /// Drops the context's iterator.
    pub fn set_load_bias(&mut self, load_bias: isize) {
        self.res.slide = load_bias;
        self.iter = None;
    }

    pub fn load_bias(&self) -> isize {
        self.res.slide
    }
}

fn log_result(symbol: &str, address: Option<usize>) {
    match address {
        Some(address) => debug!("resolved {} -> 0x{:x}", symbol, address),
        None => debug!("{} not found", symbol),
    }
}
