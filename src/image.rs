//! Loaded image handles and the load-command walker.
//!
//! An [`Image`] is a view of a `mach_header_64` and the load commands that
//! follow it. Nothing is cached: every query walks the command list again.

use crate::macho::{self, *};
use crate::view::Bytes;
use crate::MachError;
use tracing::{trace, warn};

/// A Mach-O image mapped in the current process.
///
/// The memory is owned by the loader. Handles are not invalidated when the
/// image is unloaded; holding one past that point is the caller's problem.
#[derive(Clone, Copy, Debug)]
pub struct Image {
    header: usize,
    commands: Bytes<'static>,
    ncmds: u32,
}

/// A single load command: its type, offset from the header, and bytes.
#[derive(Clone, Copy, Debug)]
pub struct LoadCommand {
    pub cmd: u32,
    pub offset: usize,
    pub data: Bytes<'static>,
}

/// A `segment_command_64` decoded from a load command.
#[derive(Clone, Copy, Debug)]
pub struct Segment {
    pub name: &'static [u8],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    command: LoadCommand,
}

/// A `section_64` within a segment.
#[derive(Clone, Copy, Debug)]
pub struct Section {
    pub name: &'static [u8],
    pub addr: u64,
    pub size: u64,
    pub flags: u32,
}

/// How a dependency is linked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DylibKind {
    Load,
    Weak,
    Reexport,
    Upward,
}

/// A dependency load command and its install name.
#[derive(Clone, Copy, Debug)]
pub struct Dylib {
    pub kind: DylibKind,
    pub name: &'static [u8],
}

impl Image {
    /// Builds a handle for the image whose header lives at `header`.
    ///
    /// # Safety
    ///
    /// `header` must point to a readable `mach_header_64` followed by
    /// `sizeofcmds` bytes of load commands, mapped for the rest of the
    /// process lifetime (or for as long as the handle and anything derived
    /// from it is used).
    pub unsafe fn from_header(header: usize) -> Result<Image, MachError> {
        if header == 0 {
            return Err(MachError::Truncated);
        }
        let fixed = unsafe { Bytes::from_raw(header, macho::header::SIZE) };
        let magic = fixed.read_u32(macho::header::MAGIC).ok_or(MachError::Truncated)?;
        if magic != MH_MAGIC_64 {
            warn!("invalid Mach-O magic 0x{:x} at 0x{:x}", magic, header);
            return Err(MachError::BadMagic(magic));
        }
        let ncmds = fixed.read_u32(macho::header::NCMDS).ok_or(MachError::Truncated)?;
        let sizeofcmds = fixed
            .read_u32(macho::header::SIZEOFCMDS)
            .ok_or(MachError::Truncated)? as usize;
        let commands =
            unsafe { Bytes::from_raw(header + macho::header::SIZE, sizeofcmds) };
        Ok(Image {
            header,
            commands,
            ncmds,
        })
    }

    /// Address of the image's `mach_header_64`.
    pub fn header(&self) -> usize {
        self.header
    }

    /// Iterates the load commands in file order.
    pub fn load_commands(&self) -> LoadCommands {
        LoadCommands {
            commands: self.commands,
            remaining: self.ncmds,
            offset: 0,
        }
    }

    /// Returns the first load command of type `cmd`.
    pub fn find_command(&self, cmd: u32) -> Option<LoadCommand> {
        self.load_commands().find(|lc| lc.cmd == cmd)
    }

    pub fn segments(&self) -> impl Iterator<Item = Segment> + use<> {
        self.load_commands()
            .filter(|lc| lc.cmd == LC_SEGMENT_64)
            .filter_map(Segment::parse)
    }

    /// Returns the first segment called `name`.
    pub fn find_segment(&self, name: &[u8]) -> Option<Segment> {
        self.segments().find(|seg| seg.name == name)
    }

    /// Dependency commands in file order.
    pub fn dependencies(&self) -> impl Iterator<Item = Dylib> + use<> {
        self.load_commands().filter_map(|lc| {
            let kind = match lc.cmd {
                LC_LOAD_DYLIB => DylibKind::Load,
                LC_LOAD_WEAK_DYLIB => DylibKind::Weak,
                LC_REEXPORT_DYLIB => DylibKind::Reexport,
                LC_LOAD_UPWARD_DYLIB => DylibKind::Upward,
                _ => return None,
            };
            let name_offset = lc.data.read_u32(macho::dylib::NAME_OFFSET)? as usize;
            let name = lc.data.read_cstr(name_offset)?;
            Some(Dylib { kind, name })
        })
    }

    /// Install name of the dependency with the given 1-based ordinal.
    ///
    /// Ordinals come from export trie payloads of this same image. Zero or
    /// out-of-range ordinals yield `None`.
    pub fn dylib_for_ordinal(&self, ordinal: u64) -> Option<&'static [u8]> {
        let index = usize::try_from(ordinal.checked_sub(1)?).ok()?;
        let dylib = self.dependencies().nth(index);
        if dylib.is_none() {
            trace!("dylib ordinal {} out of range in image 0x{:x}", ordinal, self.header);
        }
        dylib.map(|d| d.name)
    }

    /// Load bias: the header address minus the `__TEXT` vmaddr.
    pub fn slide(&self) -> Result<isize, MachError> {
        let text = self
            .find_segment(SEG_TEXT)
            .ok_or(MachError::MissingSegment("__TEXT"))?;
        Ok(self.header.wrapping_sub(text.vmaddr as usize) as isize)
    }

    /// Finds the section whose runtime range contains `addr`.
    pub fn section_containing(&self, addr: usize, slide: isize) -> Option<Section> {
        self.segments()
            .flat_map(|seg| seg.sections())
            .find(|sect| {
                let start = (sect.addr as usize).wrapping_add_signed(slide);
                addr >= start && addr - start < sect.size as usize
            })
    }

    /// Whether `addr` falls inside a section that contains instructions.
    pub fn is_code_address(&self, addr: usize, slide: isize) -> bool {
        self.section_containing(addr, slide).is_some_and(|sect| {
            sect.flags & (S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS) != 0
        })
    }
}

/// Iterator over an image's load commands.
#[derive(Clone, Debug)]
pub struct LoadCommands {
    commands: Bytes<'static>,
    remaining: u32,
    offset: usize,
}

impl Iterator for LoadCommands {
    type Item = LoadCommand;

    fn next(&mut self) -> Option<LoadCommand> {
        if self.remaining == 0 {
            return None;
        }
        let cmd = self.commands.read_u32(self.offset + macho::load_command::CMD);
        let cmdsize = self.commands.read_u32(self.offset + macho::load_command::CMDSIZE);
        let (Some(cmd), Some(cmdsize)) = (cmd, cmdsize) else {
            self.remaining = 0;
            return None;
        };
        let cmdsize = cmdsize as usize;
        let Some(data) = (cmdsize >= macho::load_command::SIZE)
            .then(|| self.commands.sub(self.offset, cmdsize))
            .flatten()
        else {
            warn!(
                "malformed load command 0x{:x} (size {}) at offset 0x{:x}",
                cmd, cmdsize, self.offset
            );
            self.remaining = 0;
            return None;
        };
        let offset = self.offset;
        self.offset += cmdsize;
        self.remaining -= 1;
        Some(LoadCommand {
            cmd,
            offset: offset + macho::header::SIZE,
            data,
        })
    }
}

impl Segment {
    fn parse(command: LoadCommand) -> Option<Segment> {
        let data = command.data;
        Some(Segment {
            name: macho::fixed_name(data.get(macho::segment::SEGNAME, 16)?),
            vmaddr: data.read_u64(macho::segment::VMADDR)?,
            vmsize: data.read_u64(macho::segment::VMSIZE)?,
            fileoff: data.read_u64(macho::segment::FILEOFF)?,
            command,
        })
    }

    /// Sections of this segment, bounded by the command size.
    pub fn sections(&self) -> impl Iterator<Item = Section> + use<> {
        let data = self.command.data;
        let nsects = data.read_u32(macho::segment::NSECTS).unwrap_or(0) as usize;
        (0..nsects).map_while(move |i| {
            let sect = data.sub(
                macho::segment::SIZE + i * macho::section::SIZE,
                macho::section::SIZE,
            )?;
            Some(Section {
                name: macho::fixed_name(sect.get(macho::section::SECTNAME, 16)?),
                addr: sect.read_u64(macho::section::ADDR)?,
                size: sect.read_u64(macho::section::SECTSIZE)?,
                flags: sect.read_u32(macho::section::FLAGS)?,
            })
        })
    }
}
