//! dyld image list of the current process.
//!
//! The kernel reports the address of dyld's `dyld_all_image_infos` through
//! `task_info(TASK_DYLD_INFO)`. That address is fixed for the life of the
//! process, so it is looked up once and kept. The image array it points to is
//! re-read on every query because dyld updates it as images load.

use crate::macho::MH_MAGIC_64;
use crate::registry::{ImageRegistry, LoadedImage};
use crate::view::Bytes;
use mach2::kern_return::KERN_SUCCESS;
use mach2::message::mach_msg_type_number_t;
use mach2::port::{MACH_PORT_NULL, mach_port_t};
use mach2::task::task_info;
use mach2::task_info::{TASK_DYLD_INFO, task_dyld_info};
use mach2::traps::mach_task_self;
use mach2::vm::mach_vm_region;
use mach2::vm_prot::VM_PROT_READ;
use mach2::vm_region::{VM_REGION_BASIC_INFO_64, vm_region_basic_info_64, vm_region_info_t};
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};
use std::sync::OnceLock;
use tracing::{debug, trace, warn};

// dyld_all_image_infos field offsets (64-bit)
const INFO_ARRAY_COUNT: usize = 4;
const INFO_ARRAY: usize = 8;
const DYLD_IMAGE_LOAD_ADDRESS: usize = 32;
const ALL_IMAGE_INFOS_MIN_SIZE: usize = 40;

// dyld_image_info layout
const IMAGE_INFO_SIZE: usize = 24;
const IMAGE_LOAD_ADDRESS: usize = 0;
const IMAGE_FILE_PATH: usize = 8;

// Longest path read from dyld's image list (PATH_MAX), terminator included.
const MAX_PATH: usize = 1024;

// First address scanned by the base address probe.
const PROBE_START: mach_vm_address_t = 0x1_0000_0000;
const PROBE_MAX_REGIONS: usize = 4096;

/// The current process's `dyld_all_image_infos`.
#[derive(Debug)]
pub struct DyldRegistry {
    all_image_infos: Bytes<'static>,
}

static ALL_IMAGE_INFOS: OnceLock<Option<DyldRegistry>> = OnceLock::new();

/// Returns the process registry, querying the kernel on first use.
pub fn registry() -> Option<&'static DyldRegistry> {
    ALL_IMAGE_INFOS.get_or_init(query_all_image_infos).as_ref()
}

fn query_all_image_infos() -> Option<DyldRegistry> {
    let mut info: task_dyld_info = unsafe { std::mem::zeroed() };
    let mut count = (std::mem::size_of::<task_dyld_info>() / std::mem::size_of::<u32>())
        as mach_msg_type_number_t;
    let kr = unsafe {
        task_info(
            mach_task_self(),
            TASK_DYLD_INFO,
            &mut info as *mut task_dyld_info as *mut _,
            &mut count,
        )
    };
    if kr != KERN_SUCCESS {
        warn!("task_info(TASK_DYLD_INFO) failed: {}", kr);
        return None;
    }
    let addr = info.all_image_info_addr as usize;
    let size = (info.all_image_info_size as usize).max(ALL_IMAGE_INFOS_MIN_SIZE);
    debug!("dyld_all_image_infos at 0x{:x} ({} bytes)", addr, size);
    if addr == 0 {
        return None;
    }
    Some(DyldRegistry {
        all_image_infos: unsafe { Bytes::from_raw(addr, size) },
    })
}

impl DyldRegistry {
    fn info_array(&self) -> Bytes<'static> {
        let count = self
            .all_image_infos
            .read_u32(INFO_ARRAY_COUNT)
            .unwrap_or(0) as usize;
        let array = self.all_image_infos.read_u64(INFO_ARRAY).unwrap_or(0) as usize;
        // dyld clears the array pointer while it is being rewritten.
        if array == 0 {
            trace!("dyld image array is being updated");
            return Bytes::default();
        }
        unsafe { Bytes::from_raw(array, count * IMAGE_INFO_SIZE) }
    }
}

/// Reads an image path of at most [`MAX_PATH`] bytes.
///
/// Paths without a terminator in that range are reported as empty so they
/// never match a query.
fn read_path(addr: usize) -> &'static [u8] {
    if addr == 0 {
        return &[];
    }
    // dyld keeps image paths alive for as long as the image is loaded.
    let len = unsafe { libc::strnlen(addr as *const libc::c_char, MAX_PATH) };
    if len == MAX_PATH {
        warn!("image path at 0x{:x} exceeds {} bytes", addr, MAX_PATH);
        return &[];
    }
    unsafe { Bytes::from_raw(addr, len) }.0
}

unsafe impl ImageRegistry for DyldRegistry {
    fn images(&self) -> Box<dyn Iterator<Item = LoadedImage<'_>> + '_> {
        let array = self.info_array();
        let count = array.len() / IMAGE_INFO_SIZE;
        Box::new((0..count).filter_map(move |i| {
            let entry = array.sub(i * IMAGE_INFO_SIZE, IMAGE_INFO_SIZE)?;
            let header = entry.read_u64(IMAGE_LOAD_ADDRESS)? as usize;
            let path = read_path(entry.read_u64(IMAGE_FILE_PATH)? as usize);
            (header != 0).then_some(LoadedImage { path, header })
        }))
    }

    fn dyld(&self) -> Option<usize> {
        self.all_image_infos
            .read_u64(DYLD_IMAGE_LOAD_ADDRESS)
            .map(|addr| addr as usize)
            .filter(|&addr| addr != 0)
    }
}

/// Scans upward from [`PROBE_START`] for the first readable region that
/// starts with a 64-bit Mach-O header.
pub fn probe_base_address() -> Option<usize> {
    let mut address: mach_vm_address_t = PROBE_START;
    for _ in 0..PROBE_MAX_REGIONS {
        let mut size: mach_vm_size_t = 0;
        let mut info: vm_region_basic_info_64 = unsafe { std::mem::zeroed() };
        let mut count = (std::mem::size_of::<vm_region_basic_info_64>()
            / std::mem::size_of::<i32>()) as mach_msg_type_number_t;
        let mut object_name: mach_port_t = MACH_PORT_NULL;
        let kr = unsafe {
            mach_vm_region(
                mach_task_self(),
                &mut address,
                &mut size,
                VM_REGION_BASIC_INFO_64,
                &mut info as *mut vm_region_basic_info_64 as vm_region_info_t,
                &mut count,
                &mut object_name,
            )
        };
        if kr != KERN_SUCCESS {
            debug!("no mapped region above 0x{:x}", address);
            return None;
        }
        if info.protection & VM_PROT_READ != 0 {
            let magic = unsafe { Bytes::from_raw(address as usize, 4) }.read_u32(0);
            if magic == Some(MH_MAGIC_64) {
                debug!("probed base address 0x{:x}", address);
                return Some(address as usize);
            }
        }
        address = address.checked_add(size.max(1))?;
    }
    warn!("base address probe gave up after {} regions", PROBE_MAX_REGIONS);
    None
}
