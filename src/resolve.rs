//! Symbol resolution order.
//!
//! A name is looked up in the image's symbol table, then its export trie,
//! then in the images it re-exports (full lookup) and its upward
//! dependencies (symbol table only), in load command order. Dependencies are
//! opened afresh for every lookup. Each (image, name) pair is searched at
//! most once per lookup, so re-export cycles and diamonds stay linear.

use crate::exports::{self, ExportData};
use crate::image::{DylibKind, Image};
use crate::linkedit::Resolution;
use crate::ptrauth;
use crate::registry::{self, ImageRegistry};
use tracing::{debug, trace, warn};

/// Maximum nesting of re-export and dependency lookups.
pub const MAX_RESOLVE_DEPTH: usize = 64;

/// Which symbols a lookup may return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visibility {
    /// Local and exported symbols.
    All,
    /// Exported symbols only, like `dlsym`.
    Exported,
}

/// A resolved address and the image that defines it.
#[derive(Clone, Copy, Debug)]
struct Found {
    address: usize,
    image: Image,
    /// Slide under which `address` lies in `image`'s sections.
    slide: isize,
    /// The address came from a resolver and may point into another image.
    foreign: bool,
}

/// Per-lookup state shared by every nested call.
struct Search<'a, 's> {
    registry: &'a dyn ImageRegistry,
    visibility: Visibility,
    visited: Vec<(usize, &'s [u8])>,
}

/// An unsigned lookup result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolved {
    pub address: usize,
    /// The address lies in a code section.
    pub code: bool,
}

/// Resolves `symbol` in `res` and its dependencies.
///
/// Code addresses are signed for the platform's pointer authentication
/// before they are returned.
pub fn resolve(
    registry: &dyn ImageRegistry,
    res: &Resolution,
    symbol: &[u8],
    visibility: Visibility,
) -> Option<usize> {
    let resolved = lookup(registry, res, symbol, visibility)?;
    if ptrauth::enabled() && resolved.code {
        let signed = ptrauth::sign_function_pointer(resolved.address);
        trace!("signed code pointer 0x{:x} -> 0x{:x}", resolved.address, signed);
        return Some(signed);
    }
    Some(resolved.address)
}

/// Like [`resolve`], without signing.
pub fn lookup(
    registry: &dyn ImageRegistry,
    res: &Resolution,
    symbol: &[u8],
    visibility: Visibility,
) -> Option<Resolved> {
    let mut search = Search {
        registry,
        visibility,
        visited: Vec::new(),
    };
    let found = search.resolve_in(res, symbol, 0)?;
    Some(Resolved {
        address: found.address,
        code: is_code(registry, &found),
    })
}

/// Whether `found` points into a code section.
///
/// Resolver results are checked against every registered image when the
/// exporting image does not contain them.
fn is_code(registry: &dyn ImageRegistry, found: &Found) -> bool {
    if found.image.is_code_address(found.address, found.slide) {
        return true;
    }
    found.foreign && is_code_in_registry(registry, found.address)
}

fn is_code_in_registry(registry: &dyn ImageRegistry, address: usize) -> bool {
    registry.images().any(|loaded| {
        // Registry implementations vouch for the headers they return.
        let Ok(image) = (unsafe { Image::from_header(loaded.header) }) else {
            return false;
        };
        image
            .slide()
            .is_ok_and(|slide| image.is_code_address(address, slide))
    })
}

impl<'s> Search<'_, 's> {
    fn resolve_in(&mut self, res: &Resolution, symbol: &'s [u8], depth: usize) -> Option<Found> {
        if depth > MAX_RESOLVE_DEPTH {
            warn!(
                "giving up on {} after {} nested images",
                String::from_utf8_lossy(symbol),
                MAX_RESOLVE_DEPTH
            );
            return None;
        }
        let key = (res.image.header(), symbol);
        if self.visited.contains(&key) {
            trace!(
                "{} already searched in 0x{:x}",
                String::from_utf8_lossy(symbol),
                key.0
            );
            return None;
        }
        self.visited.push(key);

        if self.visibility == Visibility::All
            && let Some(address) = resolve_local(res, symbol)
        {
            trace!(
                "{} found in symbol table of 0x{:x}",
                String::from_utf8_lossy(symbol),
                res.image.header()
            );
            return Some(Found {
                address,
                image: res.image,
                slide: res.slide,
                foreign: false,
            });
        }

        if let Some(found) = self.resolve_exported(res, symbol, depth) {
            return Some(found);
        }

        self.resolve_dependent(res, symbol, depth)
    }

    fn resolve_exported(
        &mut self,
        res: &Resolution,
        symbol: &'s [u8],
        depth: usize,
    ) -> Option<Found> {
        let trie = res.exports?.0;
        let payload = exports::walk(trie, symbol)?;
        let Some((_, export)) = ExportData::parse(trie, payload) else {
            trace!("undecodable export payload for {}", String::from_utf8_lossy(symbol));
            return None;
        };
        let header = res.image.header();
        // Trie offsets are relative to the header, whatever load bias was set.
        let found = |address, foreign| Found {
            address,
            image: res.image,
            slide: res.image.slide().unwrap_or(res.slide),
            foreign,
        };

        match export {
            ExportData::Regular { offset } => {
                Some(found(header.wrapping_add(offset as usize), false))
            }
            ExportData::Absolute { address } => Some(found(address as usize, false)),
            ExportData::Reexport {
                ordinal,
                import_name,
            } => {
                let name = if import_name.is_empty() {
                    symbol
                } else {
                    import_name
                };
                let dylib = res.image.dylib_for_ordinal(ordinal)?;
                trace!(
                    "{} re-exported from {} as {}",
                    String::from_utf8_lossy(symbol),
                    String::from_utf8_lossy(dylib),
                    String::from_utf8_lossy(name)
                );
                let dependency = open_dependency(self.registry, dylib)?;
                self.resolve_in(&dependency, name, depth + 1)
            }
            ExportData::StubAndResolver {
                resolver_offset, ..
            } => {
                let resolver = header.wrapping_add(resolver_offset as usize);
                trace!(
                    "calling resolver at 0x{:x} for {}",
                    resolver,
                    String::from_utf8_lossy(symbol)
                );
                // The trie of a loaded image points at its own resolver function.
                let address = unsafe { ptrauth::call_resolver(resolver) };
                (address != 0).then(|| found(address, true))
            }
            ExportData::ThreadLocal { .. } => {
                trace!(
                    "{} is thread-local, no static address",
                    String::from_utf8_lossy(symbol)
                );
                None
            }
        }
    }

    fn resolve_dependent(
        &mut self,
        res: &Resolution,
        symbol: &'s [u8],
        depth: usize,
    ) -> Option<Found> {
        for dylib in res.image.dependencies() {
            let upward = match dylib.kind {
                DylibKind::Reexport => false,
                DylibKind::Upward if self.visibility == Visibility::All => true,
                _ => continue,
            };
            let Some(dependency) = open_dependency(self.registry, dylib.name) else {
                continue;
            };
            let result = if upward {
                resolve_local(&dependency, symbol).map(|address| Found {
                    address,
                    image: dependency.image,
                    slide: dependency.slide,
                    foreign: false,
                })
            } else {
                self.resolve_in(&dependency, symbol, depth + 1)
            };
            if result.is_some() {
                return result;
            }
        }
        None
    }
}

/// Symbol table lookup. Exported entries are left to the trie when the image
/// has one.
fn resolve_local(res: &Resolution, symbol: &[u8]) -> Option<usize> {
    res.symtab.lookup(symbol, res.slide, res.has_exports())
}

/// Opens a dependency by install name. Missing or malformed images count as
/// not found.
fn open_dependency(registry: &dyn ImageRegistry, name: &[u8]) -> Option<Resolution> {
    let header = registry::locate(registry, name)?;
    // Registry implementations vouch for the headers they return.
    let image = match unsafe { Image::from_header(header) } {
        Ok(image) => image,
        Err(e) => {
            debug!("skipping {}: {}", String::from_utf8_lossy(name), e);
            return None;
        }
    };
    match Resolution::new(image) {
        Ok(res) => Some(res),
        Err(e) => {
            debug!("skipping {}: {}", String::from_utf8_lossy(name), e);
            None
        }
    }
}
