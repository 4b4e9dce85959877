//! Platform-specific system interfaces.
//!
//! Only Darwin exposes a loaded-image list this crate can read. On other
//! targets callers supply images through [`crate::StaticRegistry`].

#[cfg(target_os = "macos")]
pub mod darwin;
