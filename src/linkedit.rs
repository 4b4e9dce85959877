//! Linkedit location.
//!
//! Builds the per-image [`Resolution`]: where the symbol table, string table
//! and export trie of a loaded image live in memory.
//!
//! Linkedit data is addressed as
//! `(linkedit.vmaddr + slide) + (dataoff - linkedit.fileoff)`: the segment's
//! runtime address plus the data's offset into the segment.

use crate::image::Image;
use crate::macho::{self, *};
use crate::symtab::SymbolTable;
use crate::view::Bytes;
use crate::MachError;
use tracing::debug;

/// Everything needed to resolve symbols in one image.
#[derive(Clone, Copy, Debug)]
pub struct Resolution {
    pub image: Image,
    pub slide: isize,
    pub symtab: SymbolTable,
    /// Export trie, `None` when the image exports nothing.
    pub exports: Option<Bytes<'static>>,
}

impl Resolution {
    /// Locates the linkedit data of `image`.
    ///
    /// `__LINKEDIT` and `LC_SYMTAB` are required. The export trie is read from
    /// `LC_DYLD_EXPORTS_TRIE`, else `LC_DYLD_INFO_ONLY`, else `LC_DYLD_INFO`.
    pub fn new(image: Image) -> Result<Resolution, MachError> {
        let slide = image.slide()?;
        let linkedit = image
            .find_segment(SEG_LINKEDIT)
            .ok_or(MachError::MissingSegment("__LINKEDIT"))?;
        let symtab_cmd = image.find_command(LC_SYMTAB).ok_or(MachError::MissingSymtab)?;

        let base = (linkedit.vmaddr.wrapping_sub(linkedit.fileoff) as usize)
            .wrapping_add_signed(slide);
        let field = |offset| symtab_cmd.data.read_u32(offset).ok_or(MachError::Truncated);
        let symoff = field(macho::symtab::SYMOFF)? as usize;
        let nsyms = field(macho::symtab::NSYMS)?;
        let stroff = field(macho::symtab::STROFF)? as usize;
        let strsize = field(macho::symtab::STRSIZE)? as usize;

        // The image contract covers its linkedit segment.
        let symbols = unsafe {
            Bytes::from_raw(
                base.wrapping_add(symoff),
                nsyms as usize * macho::nlist::SIZE,
            )
        };
        let strings = unsafe { Bytes::from_raw(base.wrapping_add(stroff), strsize) };

        let exports = export_trie_location(&image).map(|(dataoff, datasize)| unsafe {
            Bytes::from_raw(base.wrapping_add(dataoff), datasize)
        });

        debug!(
            "image 0x{:x}: slide 0x{:x}, {} symbols at 0x{:x}, exports {:?}",
            image.header(),
            slide,
            nsyms,
            symbols.addr(),
            exports.map(|trie| (trie.addr(), trie.len()))
        );

        Ok(Resolution {
            image,
            slide,
            symtab: SymbolTable::new(symbols, strings),
            exports,
        })
    }

    pub fn has_exports(&self) -> bool {
        self.exports.is_some()
    }
}

/// Offset and size of the export trie, if the image has a non-empty one.
fn export_trie_location(image: &Image) -> Option<(usize, usize)> {
    if let Some(cmd) = image.find_command(LC_DYLD_EXPORTS_TRIE) {
        let dataoff = cmd.data.read_u32(macho::linkedit_data::DATAOFF)?;
        let datasize = cmd.data.read_u32(macho::linkedit_data::DATASIZE)?;
        return (datasize != 0).then_some((dataoff as usize, datasize as usize));
    }
    let cmd = image
        .find_command(LC_DYLD_INFO_ONLY)
        .or_else(|| image.find_command(LC_DYLD_INFO))?;
    let export_off = cmd.data.read_u32(macho::dyld_info::EXPORT_OFF)?;
    let export_size = cmd.data.read_u32(macho::dyld_info::EXPORT_SIZE)?;
    (export_size != 0).then_some((export_off as usize, export_size as usize))
}
