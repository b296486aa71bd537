//! This module contains a text patcher for code mapped in the current process.
//! It adjusts memory permissions to patch read-only code.

use std::sync::atomic::{AtomicU32, Ordering};

use region::Protection;

use super::cache::invalidate_icache;
use super::{TextError, TextPatcher};
use crate::code::arm64::INSN_SIZE;

/// Patches code of the running process.
///
/// Writing changes the page protection to read-write-execute for the duration of the store and restores it
/// afterwards.
///
/// # Safety
///
/// As always, casting a `&T` to an address for use with `ProcessText` can result in undefined behavior because rust
/// assumes `&T` will never change. The address **MUST** be memory not tracked by Rust, such as the code of a function.
#[derive(Debug, Default)]
pub struct ProcessText;

impl ProcessText {
    /// Creates a new [`ProcessText`]
    pub fn new() -> Self {
        Self
    }

    /// Checks that `address` can hold an instruction word
    fn check(address: usize) -> Result<(), TextError> {
        if address % INSN_SIZE != 0 {
            return Err(TextError::Misaligned(address));
        }
        if address == 0 {
            return Err(TextError::Unmapped(address));
        }
        Ok(())
    }
}

unsafe impl TextPatcher for ProcessText {
    unsafe fn read_insn(&self, address: usize) -> Result<u32, TextError> {
        Self::check(address)?;
        // Safety: caller guarantees `address` is readable, alignment was checked above
        Ok((*(address as *const AtomicU32)).load(Ordering::Acquire))
    }

    unsafe fn write_insn(&self, address: usize, insn: u32) -> Result<(), TextError> {
        Self::check(address)?;
        let _guard =
            region::protect_with_handle(address as *const u8, INSN_SIZE, Protection::all())?;
        // Safety: the page is writable while `_guard` lives, and a single aligned store can't be observed torn
        (*(address as *const AtomicU32)).store(insn, Ordering::Release);
        invalidate_icache(address, INSN_SIZE);
        Ok(())
    }

    fn flush_icache(&self, address: usize, len: usize) {
        // Safety: only called on code the engine just generated
        unsafe { invalidate_icache(address, len) }
    }
}
