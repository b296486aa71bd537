//! Instruction cache maintenance

/// Flushes the data cache and invalidates the instruction cache for `address..address + len`.
///
/// On AArch64 the instruction cache is not coherent with data writes, so freshly written code must be cleaned to the
/// point of unification before it can be executed. Other architectures need nothing.
///
/// # Safety
///
/// `address` must point to at least `len` bytes of mapped memory.
#[inline]
pub unsafe fn invalidate_icache(address: usize, len: usize) {
    #[cfg(target_arch = "aarch64")]
    {
        extern "C" {
            fn __clear_cache(beg: *mut core::ffi::c_void, end: *mut core::ffi::c_void);
        }
        __clear_cache(address as *mut _, address.wrapping_add(len) as *mut _);
    }

    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = (address, len);
    }
}
