//! Symbol table lookup.

use crate::macho::{self, N_EXT, N_STAB};
use crate::view::Bytes;
use tracing::trace;

/// An image's `nlist_64` array and string table.
#[derive(Clone, Copy, Debug, Default)]
pub struct SymbolTable {
    symbols: Bytes<'static>,
    strings: Bytes<'static>,
}

/// One decoded `nlist_64` entry.
#[derive(Clone, Copy, Debug)]
pub struct Nlist {
    pub strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_value: u64,
}

impl Nlist {
    /// Defined, non-debug, named, and (when `skip_external`) not exported.
    fn is_usable(&self, skip_external: bool) -> bool {
        self.n_type & N_STAB == 0
            && self.n_sect != 0
            && self.strx != 0
            && !(skip_external && self.n_type & N_EXT != 0)
    }
}

impl SymbolTable {
    pub fn new(symbols: Bytes<'static>, strings: Bytes<'static>) -> Self {
        SymbolTable { symbols, strings }
    }

    pub fn len(&self) -> usize {
        self.symbols.len() / macho::nlist::SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Nlist> {
        let entry = self
            .symbols
            .sub(index.checked_mul(macho::nlist::SIZE)?, macho::nlist::SIZE)?;
        Some(Nlist {
            strx: entry.read_u32(macho::nlist::STRX)?,
            n_type: entry.read_u8(macho::nlist::TYPE)?,
            n_sect: entry.read_u8(macho::nlist::SECT)?,
            n_value: entry.read_u64(macho::nlist::VALUE)?,
        })
    }

    /// Name of an entry, without its terminator.
    pub fn name(&self, entry: &Nlist) -> Option<&'static [u8]> {
        self.strings.read_cstr(entry.strx as usize)
    }

    /// Finds the next usable entry at or after `index`.
    ///
    /// Returns the entry's index, name and value.
    pub fn next_usable(
        &self,
        mut index: usize,
        skip_external: bool,
    ) -> Option<(usize, &'static [u8], u64)> {
        while index < self.len() {
            let current = index;
            index += 1;
            let Some(entry) = self.get(current) else {
                break;
            };
            if !entry.is_usable(skip_external) {
                continue;
            }
            if let Some(name) = self.name(&entry) {
                return Some((current, name, entry.n_value));
            }
        }
        None
    }

    /// Exact-name lookup. Returns the first matching entry with a non-zero
    /// value, plus `slide`.
    pub fn lookup(&self, symbol: &[u8], slide: isize, skip_external: bool) -> Option<usize> {
        if symbol.is_empty() {
            return None;
        }
        let prefix = &symbol[..symbol.len().min(4)];
        for index in 0..self.len() {
            let Some(entry) = self.get(index) else {
                break;
            };
            if !entry.is_usable(skip_external) {
                continue;
            }
            let strx = entry.strx as usize;
            if self.strings.get(strx, prefix.len()) != Some(prefix) {
                continue;
            }
            if self.strings.read_cstr(strx) != Some(symbol) {
                continue;
            }
            if entry.n_value == 0 {
                trace!(
                    "symbol {} at index {} has no value, continuing",
                    String::from_utf8_lossy(symbol),
                    index
                );
                continue;
            }
            return Some((entry.n_value as usize).wrapping_add_signed(slide));
        }
        None
    }
}
