//! Pointer authentication for returned code addresses.
//!
//! On arm64e every function pointer the program calls through must carry a
//! signature made with the IA key and a zero discriminator. With the `ptrauth`
//! feature on AArch64 the hint-space instructions `pacia1716` and `xpaclri`
//! do the signing and stripping; elsewhere both are the identity.

/// Whether pointers are actually signed on this build.
pub const fn enabled() -> bool {
    cfg!(all(feature = "ptrauth", target_arch = "aarch64"))
}

#[cfg(all(feature = "ptrauth", target_arch = "aarch64"))]
pub fn sign_function_pointer(addr: usize) -> usize {
    let mut ptr = addr;
    unsafe {
        std::arch::asm!(
            "pacia1716",
            inout("x17") ptr,
            in("x16") 0usize,
            options(nomem, nostack, preserves_flags)
        );
    }
    ptr
}

#[cfg(all(feature = "ptrauth", target_arch = "aarch64"))]
pub fn strip(addr: usize) -> usize {
    let mut ptr = addr;
    unsafe {
        std::arch::asm!(
            "xpaclri",
            inout("lr") ptr,
            options(nomem, nostack, preserves_flags)
        );
    }
    ptr
}

#[cfg(not(all(feature = "ptrauth", target_arch = "aarch64")))]
pub fn sign_function_pointer(addr: usize) -> usize {
    addr
}

#[cfg(not(all(feature = "ptrauth", target_arch = "aarch64")))]
pub fn strip(addr: usize) -> usize {
    addr
}

/// Calls a resolver function of a stub-and-resolver export.
///
/// # Safety
///
/// `resolver` must be the entry point of a function with the signature
/// `extern "C" fn() -> usize`.
pub unsafe fn call_resolver(resolver: usize) -> usize {
    let resolver: extern "C" fn() -> usize =
        unsafe { std::mem::transmute(sign_function_pointer(resolver)) };
    strip(resolver())
}
