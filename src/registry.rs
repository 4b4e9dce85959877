//! Image location.
//!
//! The loader's list of mapped images is consumed through [`ImageRegistry`].
//! [`process_registry`] gives the current process's list where the platform
//! exposes one; [`StaticRegistry`] is a fixed list supplied by the caller
//! (images mapped by hand, test fixtures, or static analysis).

use tracing::trace;

/// A loaded image as reported by the registry.
#[derive(Clone, Copy, Debug)]
pub struct LoadedImage<'a> {
    /// Full path (or install name) of the image.
    pub path: &'a [u8],
    /// Address of the image's `mach_header_64`.
    pub header: usize,
}

/// Source of the images loaded in the address space being resolved against.
///
/// # Safety
///
/// Every header address an implementation returns must point to a readable,
/// mapped 64-bit Mach-O image whose header, load commands, and linkedit data
/// stay mapped for as long as the registry is used.
pub unsafe trait ImageRegistry: Sync {
    /// Images in load order.
    fn images(&self) -> Box<dyn Iterator<Item = LoadedImage<'_>> + '_>;

    /// Header of the main executable. Defaults to the first image.
    fn main_executable(&self) -> Option<usize> {
        self.images().next().map(|image| image.header)
    }

    /// Header of the dynamic loader's own image, if known.
    fn dyld(&self) -> Option<usize> {
        None
    }
}

/// Which image to open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageRef<'a> {
    /// The process's main executable.
    MainExecutable,
    /// The dynamic loader itself.
    Dyld,
    /// A full path (starting with `/`) or a file name.
    Name(&'a str),
}

impl<'a> From<&'a str> for ImageRef<'a> {
    fn from(name: &'a str) -> Self {
        ImageRef::Name(name)
    }
}

/// Resolves an [`ImageRef`] to a header address.
pub fn find_image(registry: &dyn ImageRegistry, image: ImageRef<'_>) -> Option<usize> {
    match image {
        ImageRef::MainExecutable => registry.main_executable(),
        ImageRef::Dyld => registry.dyld(),
        ImageRef::Name(name) => locate(registry, name.as_bytes()),
    }
}

/// Finds a loaded image by path or by file name.
///
/// Queries starting with `/` must equal a registered path. Anything else is
/// compared by its final path component against the final component of each
/// registered path, so `libz.1.dylib` and `@rpath/libz.1.dylib` both match
/// `/usr/lib/libz.1.dylib`.
pub fn locate(registry: &dyn ImageRegistry, query: &[u8]) -> Option<usize> {
    if query.is_empty() {
        return None;
    }
    let found = if query[0] == b'/' {
        registry.images().find(|image| image.path == query)
    } else {
        let name = file_name(query);
        registry.images().find(|image| file_name(image.path) == name)
    };
    match found {
        Some(image) => {
            trace!(
                "located {} at 0x{:x}",
                String::from_utf8_lossy(query),
                image.header
            );
            Some(image.header)
        }
        None => {
            trace!("image {} is not loaded", String::from_utf8_lossy(query));
            None
        }
    }
}

fn file_name(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|&b| b == b'/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// A fixed list of images.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    images: Vec<(String, usize)>,
    main: Option<usize>,
    dyld: Option<usize>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn empty() -> Self {
        StaticRegistry {
            images: Vec::new(),
            main: None,
            dyld: None,
        }
    }

    /// Registers an image under `path`.
    ///
    /// # Safety
    ///
    /// `header` must satisfy the [`ImageRegistry`] contract for as long as
    /// this registry is used.
    pub unsafe fn insert(&mut self, path: impl Into<String>, header: usize) -> &mut Self {
        self.images.push((path.into(), header));
        self
    }

    /// Overrides which registered header is the main executable.
    ///
    /// # Safety
    ///
    /// Same contract as [`StaticRegistry::insert`].
    pub unsafe fn set_main_executable(&mut self, header: usize) -> &mut Self {
        self.main = Some(header);
        self
    }

    /// Sets the header reported for the dynamic loader.
    ///
    /// # Safety
    ///
    /// Same contract as [`StaticRegistry::insert`].
    pub unsafe fn set_dyld(&mut self, header: usize) -> &mut Self {
        self.dyld = Some(header);
        self
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

unsafe impl ImageRegistry for StaticRegistry {
    fn images(&self) -> Box<dyn Iterator<Item = LoadedImage<'_>> + '_> {
        Box::new(self.images.iter().map(|(path, header)| LoadedImage {
            path: path.as_bytes(),
            header: *header,
        }))
    }

    fn main_executable(&self) -> Option<usize> {
        self.main
            .or_else(|| self.images.first().map(|(_, header)| *header))
    }

    fn dyld(&self) -> Option<usize> {
        self.dyld
    }
}

/// The registry of the current process, if the platform has one.
pub fn process_registry() -> Option<&'static dyn ImageRegistry> {
    #[cfg(target_os = "macos")]
    {
        crate::sys::darwin::registry().map(|r| r as &'static dyn ImageRegistry)
    }
    #[cfg(not(target_os = "macos"))]
    {
        None
    }
}

/// Header of the main executable found without a registry.
///
/// Last resort for when the loader's image list is unavailable.
pub fn probe_base_address() -> Option<usize> {
    #[cfg(target_os = "macos")]
    {
        crate::sys::darwin::probe_base_address()
    }
    #[cfg(not(target_os = "macos"))]
    {
        None
    }
}
