//! Exports Trie Parsing
//!
//! Point lookup ([`walk`]), terminal payload decoding ([`ExportData`]) and
//! full preorder traversal ([`TrieWalker`]) of a Mach-O export trie.
//!
//! Each node is laid out as:
//!
//! ```text
//! terminal_size: uleb128
//! payload:       [u8; terminal_size]   // absent when terminal_size == 0
//! child_count:   u8
//! edges:         [(cstr prefix, uleb128 child_offset); child_count]
//! ```
//!
//! Child offsets are relative to the start of the trie. Trie depth is data
//! from the image, so traversal uses an explicit, capped frame stack rather
//! than recursion.

use crate::macho::*;
use crate::view::{Bytes, read_uleb128};
use tracing::trace;

/// Maximum number of pending frames during a full traversal.
///
/// Exceeding it panics in debug builds and ends the traversal in release
/// builds; tries that need more must raise this constant.
pub const TRIE_STACK_DEPTH: usize = 1024;

/// Names longer than this are not descended into.
pub const MAX_SYMBOL_LEN: usize = 4096;

/// Looks up `symbol`, returning the offset of its terminal payload.
pub fn walk(trie: &[u8], symbol: &[u8]) -> Option<usize> {
    let mut node = 0usize;
    let mut rest = symbol;
    loop {
        let (terminal_size, payload) = read_terminal_size(trie, node)?;
        if rest.is_empty() && terminal_size != 0 {
            return Some(payload);
        }

        let children = payload.checked_add(terminal_size)?;
        let child_count = *trie.get(children)?;
        let mut pos = children + 1;
        let mut next = None;
        for _ in 0..child_count {
            let edge = Bytes(trie).read_cstr(pos)?;
            pos += edge.len() + 1;
            let (child_offset, len) = read_uleb128(trie, pos).ok()?;
            pos += len;
            if !edge.is_empty() && rest.starts_with(edge) {
                next = Some((child_offset, edge.len()));
                break;
            }
        }

        let (child_offset, consumed) = next?;
        let child = usize::try_from(child_offset).ok()?;
        if child == 0 || child >= trie.len() {
            trace!("export trie child offset 0x{:x} out of range", child_offset);
            return None;
        }
        rest = &rest[consumed..];
        node = child;
    }
}

/// Terminal size of the node at `node`, and the offset just past it.
fn read_terminal_size(trie: &[u8], node: usize) -> Option<(usize, usize)> {
    let first = *trie.get(node)?;
    if first <= 127 {
        return Some((first as usize, node + 1));
    }
    let (size, len) = read_uleb128(trie, node).ok()?;
    Some((usize::try_from(size).ok()?, node + len))
}

/// Terminal data for an exports trie node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportData<'data> {
    /// Offset from the image header.
    Regular { offset: u64 },
    /// Offset of a thread-local variable descriptor.
    ThreadLocal { offset: u64 },
    /// An address independent of where the image is loaded.
    Absolute { address: u64 },
    /// Defined by the dependency at `ordinal`, under `import_name` (empty means
    /// the same name).
    Reexport {
        ordinal: u64,
        import_name: &'data [u8],
    },
    /// The real address is returned by calling the resolver.
    StubAndResolver {
        stub_offset: u64,
        resolver_offset: u64,
    },
}

impl<'data> ExportData<'data> {
    /// Decodes the payload at `offset`, returning the flags and the data.
    ///
    /// The variant is chosen from the flags before any other field is read.
    pub fn parse(trie: &'data [u8], offset: usize) -> Option<(u64, ExportData<'data>)> {
        let data = Bytes(trie);
        let (flags, len) = data.read_uleb128(offset)?;
        let mut pos = offset + len;
        let mut uleb = || {
            let (value, len) = data.read_uleb128(pos)?;
            pos += len;
            Some(value)
        };

        if flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
            let ordinal = uleb()?;
            let import_name = data.read_cstr(pos)?;
            return Some((
                flags,
                ExportData::Reexport {
                    ordinal,
                    import_name,
                },
            ));
        }
        if flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER != 0 {
            let stub_offset = uleb()?;
            let resolver_offset = uleb()?;
            return Some((
                flags,
                ExportData::StubAndResolver {
                    stub_offset,
                    resolver_offset,
                },
            ));
        }
        let export = match flags & EXPORT_SYMBOL_FLAGS_KIND_MASK {
            EXPORT_SYMBOL_FLAGS_KIND_REGULAR => ExportData::Regular { offset: uleb()? },
            EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL => ExportData::ThreadLocal { offset: uleb()? },
            EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE => ExportData::Absolute { address: uleb()? },
            kind => {
                trace!("unknown export kind {}", kind);
                return None;
            }
        };
        Some((flags, export))
    }

    /// Address reported when listing symbols, without following re-exports or
    /// calling resolvers. Re-exports and thread-locals have no address here.
    pub fn list_address(&self, header: usize) -> usize {
        match *self {
            ExportData::Regular { offset } => header.wrapping_add(offset as usize),
            ExportData::Absolute { address } => address as usize,
            ExportData::StubAndResolver { stub_offset, .. } => {
                header.wrapping_add(stub_offset as usize)
            }
            ExportData::Reexport { .. } | ExportData::ThreadLocal { .. } => 0,
        }
    }
}

/// Whether `flags` mark a weak definition.
pub fn is_weak(flags: u64) -> bool {
    flags & EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION != 0
}

/// An exported name and the offset of its terminal payload.
#[derive(Debug)]
pub struct TrieEntry {
    pub name: Vec<u8>,
    pub payload: usize,
}

#[derive(Debug)]
struct Frame {
    node: usize,
    name: Vec<u8>,
}

/// Resumable preorder traversal of an export trie.
///
/// Every node with a terminal payload is yielded, before its children.
/// Children are visited in the order their edges appear.
#[derive(Debug)]
pub struct TrieWalker<'data> {
    trie: &'data [u8],
    stack: Vec<Frame>,
    started: bool,
}

impl<'data> TrieWalker<'data> {
    pub fn new(trie: &'data [u8]) -> Self {
        TrieWalker {
            trie,
            stack: Vec::new(),
            started: false,
        }
    }

    /// Restarts the traversal from the root.
    pub fn reset(&mut self) {
        self.stack.clear();
        self.started = false;
    }

    /// Returns the next exported name, or `None` once the trie is exhausted.
    pub fn next(&mut self) -> Option<TrieEntry> {
        if !self.started {
            self.started = true;
            if !self.trie.is_empty() {
                self.stack.push(Frame {
                    node: 0,
                    name: Vec::new(),
                });
            }
        }

        while let Some(frame) = self.stack.pop() {
            let Some((terminal_size, payload)) = read_terminal_size(self.trie, frame.node)
            else {
                trace!("truncated export trie node at 0x{:x}", frame.node);
                continue;
            };
            let Some(edges) = payload
                .checked_add(terminal_size)
                .and_then(|children| self.edges(children))
            else {
                trace!("malformed edges in export trie node at 0x{:x}", frame.node);
                continue;
            };

            for &(edge, child) in edges.iter().rev() {
                if edge.is_empty() || child == 0 || child >= self.trie.len() {
                    continue;
                }
                if frame.name.len() + edge.len() > MAX_SYMBOL_LEN {
                    trace!("export trie name exceeds {} bytes, not descending", MAX_SYMBOL_LEN);
                    continue;
                }
                if self.stack.len() >= TRIE_STACK_DEPTH {
                    return self.overflow();
                }
                let mut name = Vec::with_capacity(frame.name.len() + edge.len());
                name.extend_from_slice(&frame.name);
                name.extend_from_slice(edge);
                self.stack.push(Frame { node: child, name });
            }

            if terminal_size != 0 {
                return Some(TrieEntry {
                    name: frame.name,
                    payload,
                });
            }
        }
        None
    }

    /// Edges of the node whose child count is at `children`.
    fn edges(&self, children: usize) -> Option<Vec<(&'data [u8], usize)>> {
        let trie = Bytes(self.trie);
        let count = trie.read_u8(children)?;
        let mut pos = children + 1;
        let mut edges = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let edge = trie.read_cstr(pos)?;
            pos += edge.len() + 1;
            let (child, len) = trie.read_uleb128(pos)?;
            pos += len;
            edges.push((edge, usize::try_from(child).unwrap_or(usize::MAX)));
        }
        Some(edges)
    }

    fn overflow(&mut self) -> Option<TrieEntry> {
        if cfg!(debug_assertions) {
            panic!(
                "export trie traversal needs more than {} frames; raise TRIE_STACK_DEPTH",
                TRIE_STACK_DEPTH
            );
        }
        self.stack.clear();
        None
    }
}
