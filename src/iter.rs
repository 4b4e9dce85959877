//! Resumable symbol enumeration.
//!
//! [`SymbolIter`] walks the symbol table first and the export trie second,
//! producing one symbol per call to [`SymbolIter::next`]. Only the latest
//! symbol is kept; copy it out with [`Symbol::to_owned`] to hold on to it.

use crate::exports::{ExportData, TrieWalker};
use crate::linkedit::Resolution;
use std::borrow::Cow;

/// A symbol produced by enumeration.
///
/// Addresses are not signed and re-exports are not followed. Re-exported and
/// thread-local exports are listed with address 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Symbol<'a> {
    pub name: &'a [u8],
    pub address: usize,
}

impl Symbol<'_> {
    pub fn name_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.name)
    }

    pub fn to_owned(&self) -> OwnedSymbol {
        OwnedSymbol {
            name: self.name.to_vec(),
            address: self.address,
        }
    }
}

/// A copied-out [`Symbol`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OwnedSymbol {
    pub name: Vec<u8>,
    pub address: usize,
}

#[derive(Debug)]
enum Phase {
    SymbolTable { index: usize },
    ExportTrie,
    Done,
}

/// Enumeration cursor over one image.
#[derive(Debug)]
pub struct SymbolIter {
    res: Resolution,
    phase: Phase,
    trie: TrieWalker<'static>,
    name: Vec<u8>,
    address: usize,
    has_current: bool,
}

impl SymbolIter {
    pub(crate) fn new(res: Resolution) -> Self {
        let trie = res.exports.map(|trie| trie.0).unwrap_or_default();
        SymbolIter {
            res,
            phase: Phase::SymbolTable { index: 0 },
            trie: TrieWalker::new(trie),
            name: Vec::new(),
            address: 0,
            has_current: false,
        }
    }

    /// Advances to the next symbol, or returns `None` once both the symbol
    /// table and the export trie are exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Symbol<'_>> {
        loop {
            match self.phase {
                Phase::SymbolTable { index } => {
                    let symtab = self.res.symtab;
                    match symtab.next_usable(index, self.res.has_exports()) {
                        Some((found, name, value)) => {
                            self.phase = Phase::SymbolTable { index: found + 1 };
                            self.name.clear();
                            self.name.extend_from_slice(name);
                            self.address = (value as usize).wrapping_add_signed(self.res.slide);
                            break;
                        }
                        None => self.phase = Phase::ExportTrie,
                    }
                }
                Phase::ExportTrie => {
                    let Some(entry) = self.trie.next() else {
                        self.phase = Phase::Done;
                        continue;
                    };
                    let trie = self.res.exports.unwrap_or_default().0;
                    let Some((_, export)) = ExportData::parse(trie, entry.payload) else {
                        continue;
                    };
                    self.name = entry.name;
                    self.address = export.list_address(self.res.image.header());
                    break;
                }
                Phase::Done => {
                    self.has_current = false;
                    return None;
                }
            }
        }
        self.has_current = true;
        self.current()
    }

    /// The symbol returned by the last call to [`SymbolIter::next`].
    pub fn current(&self) -> Option<Symbol<'_>> {
        self.has_current.then_some(Symbol {
            name: &self.name,
            address: self.address,
        })
    }

    /// Advances and returns only the name.
    pub fn next_name(&mut self) -> Option<&[u8]> {
        self.next().map(|symbol| symbol.name)
    }

    /// Restarts enumeration from the first symbol table entry.
    pub fn reset(&mut self) {
        self.phase = Phase::SymbolTable { index: 0 };
        self.trie.reset();
        self.name.clear();
        self.address = 0;
        self.has_current = false;
    }
}
