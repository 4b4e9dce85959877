//! Synthetic Mach-O images for integration tests.
//!
//! Images are laid out with `__TEXT` at vmaddr 0, so the load bias of a built
//! image is its buffer address and every file offset is also a vm offset.

#![allow(dead_code)]

use symrez::macho::*;
use symrez::StaticRegistry;

/// Start of the `__text` section.
pub const TEXT_OFFSET: u64 = 0x1000;
pub const TEXT_SIZE: u64 = 0x400;
/// Start of the `__data` section.
pub const DATA_OFFSET: u64 = 0x2000;
pub const DATA_SIZE: u64 = 0x400;
pub const LINKEDIT_OFFSET: u64 = 0x3000;

const CPU_TYPE_ARM64: u32 = 0x0100_000c;
const MH_DYLIB: u32 = 6;
const N_SECT: u8 = 0x0e;
const N_UNDF: u8 = 0x00;

/// An export trie entry.
#[derive(Clone, Debug)]
pub enum Export {
    Regular(u64),
    Weak(u64),
    ThreadLocal(u64),
    Absolute(u64),
    Reexport {
        ordinal: u64,
        name: Option<&'static str>,
    },
    /// `resolver` is an absolute address; it is stored relative to the
    /// image once the image is placed.
    Resolver {
        stub: u64,
        resolver: usize,
    },
}

/// Which load command carries the export trie.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrieCommand {
    ExportsTrie,
    DyldInfoOnly,
    DyldInfo,
}

#[derive(Clone, Debug)]
struct SymbolDef {
    name: String,
    n_type: u8,
    n_sect: u8,
    value: u64,
}

#[derive(Clone, Debug)]
pub struct ImageBuilder {
    symbols: Vec<SymbolDef>,
    exports: Vec<(String, Export)>,
    dylibs: Vec<(u32, String)>,
    trie_command: TrieCommand,
    magic: u32,
    text: bool,
    linkedit: bool,
    symtab: bool,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    pub fn new() -> Self {
        ImageBuilder {
            symbols: Vec::new(),
            exports: Vec::new(),
            dylibs: Vec::new(),
            trie_command: TrieCommand::ExportsTrie,
            magic: MH_MAGIC_64,
            text: true,
            linkedit: true,
            symtab: true,
        }
    }

    /// A non-external symbol defined in `__text`.
    pub fn local(mut self, name: &str, value: u64) -> Self {
        self.push_symbol(name, N_SECT, 1, value);
        self
    }

    /// An external symbol defined in `__text`.
    pub fn external(mut self, name: &str, value: u64) -> Self {
        self.push_symbol(name, N_SECT | N_EXT, 1, value);
        self
    }

    /// A non-external symbol defined in `__data`.
    pub fn data(mut self, name: &str, value: u64) -> Self {
        self.push_symbol(name, N_SECT, 2, value);
        self
    }

    /// An undefined (imported) symbol.
    pub fn undefined(mut self, name: &str) -> Self {
        self.push_symbol(name, N_UNDF | N_EXT, 0, 0);
        self
    }

    /// A debugging entry.
    pub fn stab(mut self, name: &str, value: u64) -> Self {
        self.push_symbol(name, 0x24, 1, value);
        self
    }

    fn push_symbol(&mut self, name: &str, n_type: u8, n_sect: u8, value: u64) {
        self.symbols.push(SymbolDef {
            name: name.to_string(),
            n_type,
            n_sect,
            value,
        });
    }

    pub fn export(mut self, name: &str, export: Export) -> Self {
        self.exports.push((name.to_string(), export));
        self
    }

    /// Adds a dependency command (`LC_LOAD_DYLIB` and friends). Ordinals
    /// follow call order starting at 1.
    pub fn dylib(mut self, cmd: u32, name: &str) -> Self {
        self.dylibs.push((cmd, name.to_string()));
        self
    }

    pub fn trie_command(mut self, command: TrieCommand) -> Self {
        self.trie_command = command;
        self
    }

    pub fn magic(mut self, magic: u32) -> Self {
        self.magic = magic;
        self
    }

    pub fn without_text(mut self) -> Self {
        self.text = false;
        self
    }

    pub fn without_linkedit(mut self) -> Self {
        self.linkedit = false;
        self
    }

    pub fn without_symtab(mut self) -> Self {
        self.symtab = false;
        self
    }

    pub fn build(&self) -> MachImage {
        // Linkedit contents: nlist entries, string table, export trie.
        let mut strings = vec![0u8];
        let mut nlists = Vec::new();
        for sym in &self.symbols {
            let strx = strings.len() as u32;
            strings.extend_from_slice(sym.name.as_bytes());
            strings.push(0);
            nlists.extend_from_slice(&strx.to_ne_bytes());
            nlists.push(sym.n_type);
            nlists.push(sym.n_sect);
            nlists.extend_from_slice(&0u16.to_ne_bytes());
            nlists.extend_from_slice(&sym.value.to_ne_bytes());
        }
        while strings.len() % 8 != 0 {
            strings.push(0);
        }
        let trie = (!self.exports.is_empty()).then(|| TrieBuilder::from_exports(&self.exports).build());

        let symoff = LINKEDIT_OFFSET;
        let stroff = symoff + nlists.len() as u64;
        let trie_off = stroff + strings.len() as u64;
        let trie_len = trie.as_ref().map_or(0, |t| t.bytes.len() as u64);
        let linkedit_size = trie_off + trie_len - LINKEDIT_OFFSET;
        let total = (LINKEDIT_OFFSET + linkedit_size) as usize;

        let mut cmds: Vec<Vec<u8>> = Vec::new();
        if self.text {
            cmds.push(segment_command(
                b"__TEXT",
                0,
                DATA_OFFSET,
                5,
                &[SectionDef {
                    name: b"__text",
                    segment: b"__TEXT",
                    addr: TEXT_OFFSET,
                    size: TEXT_SIZE,
                    flags: S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
                }],
            ));
        }
        cmds.push(segment_command(
            b"__DATA",
            DATA_OFFSET,
            LINKEDIT_OFFSET - DATA_OFFSET,
            3,
            &[SectionDef {
                name: b"__data",
                segment: b"__DATA",
                addr: DATA_OFFSET,
                size: DATA_SIZE,
                flags: 0,
            }],
        ));
        if self.linkedit {
            cmds.push(segment_command(
                b"__LINKEDIT",
                LINKEDIT_OFFSET,
                linkedit_size,
                1,
                &[],
            ));
        }
        if self.symtab {
            let mut cmd = Vec::new();
            put_u32(&mut cmd, LC_SYMTAB);
            put_u32(&mut cmd, 24);
            put_u32(&mut cmd, symoff as u32);
            put_u32(&mut cmd, self.symbols.len() as u32);
            put_u32(&mut cmd, stroff as u32);
            put_u32(&mut cmd, strings.len() as u32);
            cmds.push(cmd);
        }
        if trie.is_some() {
            let mut cmd = Vec::new();
            match self.trie_command {
                TrieCommand::ExportsTrie => {
                    put_u32(&mut cmd, LC_DYLD_EXPORTS_TRIE);
                    put_u32(&mut cmd, 16);
                    put_u32(&mut cmd, trie_off as u32);
                    put_u32(&mut cmd, trie_len as u32);
                }
                TrieCommand::DyldInfoOnly | TrieCommand::DyldInfo => {
                    let id = if self.trie_command == TrieCommand::DyldInfoOnly {
                        LC_DYLD_INFO_ONLY
                    } else {
                        LC_DYLD_INFO
                    };
                    put_u32(&mut cmd, id);
                    put_u32(&mut cmd, 48);
                    for _ in 0..8 {
                        put_u32(&mut cmd, 0);
                    }
                    put_u32(&mut cmd, trie_off as u32);
                    put_u32(&mut cmd, trie_len as u32);
                }
            }
            cmds.push(cmd);
        }
        for (id, name) in &self.dylibs {
            let cmdsize = (24 + name.len() + 1).next_multiple_of(8);
            let mut cmd = Vec::new();
            put_u32(&mut cmd, *id);
            put_u32(&mut cmd, cmdsize as u32);
            put_u32(&mut cmd, 24);
            put_u32(&mut cmd, 2);
            put_u32(&mut cmd, 0x10000);
            put_u32(&mut cmd, 0x10000);
            cmd.extend_from_slice(name.as_bytes());
            cmd.resize(cmdsize, 0);
            cmds.push(cmd);
        }

        let sizeofcmds: usize = cmds.iter().map(Vec::len).sum();
        assert!(32 + sizeofcmds <= TEXT_OFFSET as usize, "too many load commands");

        let mut bytes = vec![0u8; total];
        let mut header = Vec::new();
        put_u32(&mut header, self.magic);
        put_u32(&mut header, CPU_TYPE_ARM64);
        put_u32(&mut header, 0);
        put_u32(&mut header, MH_DYLIB);
        put_u32(&mut header, cmds.len() as u32);
        put_u32(&mut header, sizeofcmds as u32);
        put_u32(&mut header, 0);
        put_u32(&mut header, 0);
        bytes[..32].copy_from_slice(&header);
        let mut pos = 32;
        for cmd in &cmds {
            bytes[pos..pos + cmd.len()].copy_from_slice(cmd);
            pos += cmd.len();
        }
        // ret, so stray calls into __text come straight back.
        for chunk in bytes[TEXT_OFFSET as usize..(TEXT_OFFSET + TEXT_SIZE) as usize].chunks_mut(4) {
            chunk.copy_from_slice(&0xd65f03c0u32.to_le_bytes());
        }
        let symoff = symoff as usize;
        bytes[symoff..symoff + nlists.len()].copy_from_slice(&nlists);
        let stroff = stroff as usize;
        bytes[stroff..stroff + strings.len()].copy_from_slice(&strings);

        let mut bytes = bytes.into_boxed_slice();
        if let Some(trie) = trie {
            let trie_off = trie_off as usize;
            bytes[trie_off..trie_off + trie.bytes.len()].copy_from_slice(&trie.bytes);
            let base = bytes.as_ptr() as usize;
            for (offset, resolver) in trie.patches {
                let at = trie_off + offset;
                bytes[at..at + 10].copy_from_slice(&uleb128_fixed(resolver.wrapping_sub(base) as u64));
            }
        }
        MachImage { bytes }
    }
}

/// A built image. The buffer never moves, so its header address is stable.
pub struct MachImage {
    bytes: Box<[u8]>,
}

impl MachImage {
    pub fn header(&self) -> usize {
        self.bytes.as_ptr() as usize
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Runtime address of vm offset `offset`.
    pub fn addr(&self, offset: u64) -> usize {
        self.header() + offset as usize
    }
}

/// Registers `images` under their paths.
pub fn registry(images: &[(&str, &MachImage)]) -> StaticRegistry {
    let mut registry = StaticRegistry::new();
    for (path, image) in images {
        // The images outlive every test that uses this registry.
        unsafe {
            registry.insert(*path, image.header());
        }
    }
    registry
}

struct SectionDef {
    name: &'static [u8],
    segment: &'static [u8],
    addr: u64,
    size: u64,
    flags: u32,
}

fn segment_command(name: &[u8], vmaddr: u64, size: u64, prot: u32, sections: &[SectionDef]) -> Vec<u8> {
    let mut cmd = Vec::new();
    put_u32(&mut cmd, LC_SEGMENT_64);
    put_u32(&mut cmd, (72 + 80 * sections.len()) as u32);
    put_name(&mut cmd, name);
    put_u64(&mut cmd, vmaddr);
    put_u64(&mut cmd, size);
    put_u64(&mut cmd, vmaddr);
    put_u64(&mut cmd, size);
    put_u32(&mut cmd, prot);
    put_u32(&mut cmd, prot);
    put_u32(&mut cmd, sections.len() as u32);
    put_u32(&mut cmd, 0);
    for sect in sections {
        put_name(&mut cmd, sect.name);
        put_name(&mut cmd, sect.segment);
        put_u64(&mut cmd, sect.addr);
        put_u64(&mut cmd, sect.size);
        put_u32(&mut cmd, sect.addr as u32);
        put_u32(&mut cmd, 4);
        put_u32(&mut cmd, 0);
        put_u32(&mut cmd, 0);
        put_u32(&mut cmd, sect.flags);
        put_u32(&mut cmd, 0);
        put_u32(&mut cmd, 0);
        put_u32(&mut cmd, 0);
    }
    cmd
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_ne_bytes());
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_ne_bytes());
}

fn put_name(out: &mut Vec<u8>, name: &[u8]) {
    let mut raw = [0u8; 16];
    raw[..name.len()].copy_from_slice(name);
    out.extend_from_slice(&raw);
}

pub fn uleb128(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn uleb128_len(value: u64) -> usize {
    let mut out = Vec::new();
    uleb128(value, &mut out);
    out.len()
}

/// Ten-byte ULEB128 encoding, wide enough for any `u64`.
fn uleb128_fixed(value: u64) -> [u8; 10] {
    let mut out = [0u8; 10];
    for (i, byte) in out.iter_mut().enumerate().take(9) {
        *byte = ((value >> (7 * i)) & 0x7f) as u8 | 0x80;
    }
    out[9] = ((value >> 63) & 1) as u8;
    out
}

#[derive(Default)]
struct Payload {
    bytes: Vec<u8>,
    /// Offset of a ten-byte resolver field and the resolver's address.
    patch: Option<(usize, usize)>,
}

fn encode_payload(export: &Export) -> Payload {
    let mut bytes = Vec::new();
    let mut patch = None;
    match export {
        Export::Regular(offset) => {
            uleb128(EXPORT_SYMBOL_FLAGS_KIND_REGULAR, &mut bytes);
            uleb128(*offset, &mut bytes);
        }
        Export::Weak(offset) => {
            uleb128(EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION, &mut bytes);
            uleb128(*offset, &mut bytes);
        }
        Export::ThreadLocal(offset) => {
            uleb128(EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL, &mut bytes);
            uleb128(*offset, &mut bytes);
        }
        Export::Absolute(address) => {
            uleb128(EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE, &mut bytes);
            uleb128(*address, &mut bytes);
        }
        Export::Reexport { ordinal, name } => {
            uleb128(EXPORT_SYMBOL_FLAGS_REEXPORT, &mut bytes);
            uleb128(*ordinal, &mut bytes);
            bytes.extend_from_slice(name.unwrap_or("").as_bytes());
            bytes.push(0);
        }
        Export::Resolver { stub, resolver } => {
            uleb128(EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER, &mut bytes);
            uleb128(*stub, &mut bytes);
            patch = Some((bytes.len(), *resolver));
            bytes.extend_from_slice(&[0u8; 10]);
        }
    }
    Payload { bytes, patch }
}

#[derive(Default)]
struct Node {
    payload: Option<Payload>,
    children: Vec<(Vec<u8>, Node)>,
}

/// Builds a prefix-compressed export trie.
#[derive(Default)]
pub struct TrieBuilder {
    root: Node,
}

/// Encoded trie and the resolver fields still to be patched.
pub struct Trie {
    pub bytes: Vec<u8>,
    patches: Vec<(usize, usize)>,
}

impl TrieBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_exports(exports: &[(String, Export)]) -> Self {
        let mut builder = TrieBuilder::new();
        for (name, export) in exports {
            builder.insert(name.as_bytes(), export);
        }
        builder
    }

    pub fn insert(&mut self, name: &[u8], export: &Export) {
        let mut node = &mut self.root;
        for &b in name {
            let index = match node.children.iter().position(|(edge, _)| edge[0] == b) {
                Some(index) => index,
                None => {
                    node.children.push((vec![b], Node::default()));
                    node.children.len() - 1
                }
            };
            node = &mut node.children[index].1;
        }
        node.payload = Some(encode_payload(export));
    }

    pub fn build(self) -> Trie {
        let root = compress(self.root);

        // Preorder flattening: (payload, [(edge, child index)]).
        let mut flat: Vec<(Option<Payload>, Vec<(Vec<u8>, usize)>)> = Vec::new();
        flatten(root, &mut flat);

        // Offsets depend on ULEB widths of other offsets; iterate to a fixpoint.
        let mut offsets = vec![0usize; flat.len()];
        loop {
            let mut changed = false;
            let mut offset = 0;
            for (i, (payload, children)) in flat.iter().enumerate() {
                if offsets[i] != offset {
                    offsets[i] = offset;
                    changed = true;
                }
                offset += node_size(payload, children, &offsets);
            }
            if !changed {
                break;
            }
        }

        let mut bytes = Vec::new();
        let mut patches = Vec::new();
        for (payload, children) in &flat {
            match payload {
                Some(payload) => {
                    uleb128(payload.bytes.len() as u64, &mut bytes);
                    if let Some((at, resolver)) = payload.patch {
                        patches.push((bytes.len() + at, resolver));
                    }
                    bytes.extend_from_slice(&payload.bytes);
                }
                None => bytes.push(0),
            }
            bytes.push(children.len() as u8);
            for (edge, child) in children {
                bytes.extend_from_slice(edge);
                bytes.push(0);
                uleb128(offsets[*child] as u64, &mut bytes);
            }
        }
        Trie { bytes, patches }
    }
}

fn compress(mut node: Node) -> Node {
    node.children = node
        .children
        .into_iter()
        .map(|(mut edge, mut child)| {
            while child.payload.is_none() && child.children.len() == 1 {
                let (rest, grandchild) = child.children.pop().unwrap();
                edge.extend_from_slice(&rest);
                child = grandchild;
            }
            (edge, compress(child))
        })
        .collect();
    node
}

type FlatNode = (Option<Payload>, Vec<(Vec<u8>, usize)>);

fn flatten(node: Node, flat: &mut Vec<FlatNode>) -> usize {
    let index = flat.len();
    flat.push((node.payload, Vec::new()));
    let mut children = Vec::new();
    for (edge, child) in node.children {
        let child_index = flatten(child, flat);
        children.push((edge, child_index));
    }
    flat[index].1 = children;
    index
}

fn node_size(payload: &Option<Payload>, children: &[(Vec<u8>, usize)], offsets: &[usize]) -> usize {
    let terminal = match payload {
        Some(payload) => uleb128_len(payload.bytes.len() as u64) + payload.bytes.len(),
        None => 1,
    };
    let edges: usize = children
        .iter()
        .map(|(edge, child)| edge.len() + 1 + uleb128_len(offsets[*child] as u64))
        .sum();
    terminal + 1 + edges
}
