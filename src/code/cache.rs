//! Instruction cache synchronisation
//!
//! Changing page protections is not guaranteed to discard stale instructions, so every write to
//! live code is followed by an explicit [`flush_icache`].

#[cfg(target_os = "macos")]
extern "C" {
    fn sys_icache_invalidate(start: *mut core::ffi::c_void, len: usize);
}

#[cfg(all(target_arch = "aarch64", not(target_os = "macos"), not(windows)))]
extern "C" {
    fn __clear_cache(start: *mut core::ffi::c_char, end: *mut core::ffi::c_char);
}

/// Makes `len` freshly written bytes at `addr` visible to instruction fetch.
///
/// x86 keeps its instruction cache coherent with stores to the same address, so only a fence is
/// issued there. AArch64 needs the data cache cleaned and the instruction cache invalidated.
///
/// # Safety
///
/// `addr` must point to `len` bytes of mapped memory
pub unsafe fn flush_icache(addr: *const u8, len: usize) {
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);

    #[cfg(target_os = "macos")]
    sys_icache_invalidate(addr as *mut _, len);

    #[cfg(all(target_arch = "aarch64", not(target_os = "macos"), not(windows)))]
    __clear_cache(addr as *mut _, addr.add(len) as *mut _);

    #[cfg(not(any(target_os = "macos", all(target_arch = "aarch64", not(windows)))))]
    let _ = (addr, len);
}
