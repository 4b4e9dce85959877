//! Mach-O binary format constants.
//!
//! The structures these offsets describe are fixed by the OS headers
//! (`mach-o/loader.h`, `mach-o/nlist.h`). They are never overlaid as Rust
//! structs; [`crate::view::Bytes`] decodes individual fields at the offsets
//! below so every read is bounds-checked.

// Mach-O magic numbers
pub const MH_MAGIC_64: u32 = 0xfeedfacf; // 64-bit Mach-O, native byte order

// Load command types
pub const LC_REQ_DYLD: u32 = 0x80000000;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_LOAD_DYLIB: u32 = 0xc;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
pub const LC_REEXPORT_DYLIB: u32 = 0x1f | LC_REQ_DYLD;
pub const LC_DYLD_INFO: u32 = 0x22;
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;

// Segment names
pub const SEG_TEXT: &[u8] = b"__TEXT";
pub const SEG_LINKEDIT: &[u8] = b"__LINKEDIT";

// Section attributes
pub const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x80000000;
pub const S_ATTR_SOME_INSTRUCTIONS: u32 = 0x00000400;

// nlist_64 n_type bits
pub const N_STAB: u8 = 0xe0;
pub const N_EXT: u8 = 0x01;

// Export symbol flags from Apple's MachOTrie.hpp
pub const EXPORT_SYMBOL_FLAGS_KIND_MASK: u64 = 0x03;
pub const EXPORT_SYMBOL_FLAGS_KIND_REGULAR: u64 = 0x00;
pub const EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL: u64 = 0x01;
pub const EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE: u64 = 0x02;
pub const EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION: u64 = 0x04;
pub const EXPORT_SYMBOL_FLAGS_REEXPORT: u64 = 0x08;
pub const EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER: u64 = 0x10;

/// `mach_header_64` layout.
pub mod header {
    pub const SIZE: usize = 32;
    pub const MAGIC: usize = 0;
    pub const NCMDS: usize = 16;
    pub const SIZEOFCMDS: usize = 20;
}

/// `load_command` layout, shared by every command.
pub mod load_command {
    pub const SIZE: usize = 8;
    pub const CMD: usize = 0;
    pub const CMDSIZE: usize = 4;
}

/// `segment_command_64` layout. Sections follow the command directly.
pub mod segment {
    pub const SIZE: usize = 72;
    pub const SEGNAME: usize = 8;
    pub const VMADDR: usize = 24;
    pub const VMSIZE: usize = 32;
    pub const FILEOFF: usize = 40;
    pub const NSECTS: usize = 64;
}

/// `section_64` layout.
pub mod section {
    pub const SIZE: usize = 80;
    pub const SECTNAME: usize = 0;
    pub const ADDR: usize = 32;
    pub const SECTSIZE: usize = 40;
    pub const FLAGS: usize = 64;
}

/// `symtab_command` layout.
pub mod symtab {
    pub const SYMOFF: usize = 8;
    pub const NSYMS: usize = 12;
    pub const STROFF: usize = 16;
    pub const STRSIZE: usize = 20;
}

/// `nlist_64` layout.
pub mod nlist {
    pub const SIZE: usize = 16;
    pub const STRX: usize = 0;
    pub const TYPE: usize = 4;
    pub const SECT: usize = 5;
    pub const VALUE: usize = 8;
}

/// `dylib_command` layout; the install name offset is relative to the command.
pub mod dylib {
    pub const NAME_OFFSET: usize = 8;
}

/// `linkedit_data_command` layout (LC_DYLD_EXPORTS_TRIE).
pub mod linkedit_data {
    pub const DATAOFF: usize = 8;
    pub const DATASIZE: usize = 12;
}

/// `dyld_info_command` layout (LC_DYLD_INFO, LC_DYLD_INFO_ONLY).
pub mod dyld_info {
    pub const EXPORT_OFF: usize = 40;
    pub const EXPORT_SIZE: usize = 44;
}

/// Copies a fixed 16-byte name field up to its first NUL.
pub fn fixed_name(raw: &[u8]) -> &[u8] {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    &raw[..end]
}
