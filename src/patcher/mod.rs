//! # Patcher
//!
//! This module covers text patchers, which read and overwrite single instruction words in executable memory

pub mod cache;
pub mod mem;

use thiserror::Error;

/// Errors while accessing instruction words
#[derive(Debug, Error)]
pub enum TextError {
    /// Instruction words have to be 4-byte aligned
    #[error("{0:#x} is not instruction aligned")]
    Misaligned(usize),
    /// Nothing is mapped at the address
    #[error("{0:#x} is not mapped")]
    Unmapped(usize),
    /// Error when setting memory protections
    #[error("Error setting memory protections")]
    ProtectionError(#[from] region::Error),
}

/// Reads and writes instruction words of live code
///
/// # Safety
///
/// Implementors must write each word with a single aligned store, so that a concurrent caller executing the patched
/// location sees either the old or the new word and never a mix of both.
pub unsafe trait TextPatcher: Send + Sync {
    /// Reads the instruction word at `address`
    ///
    /// # Safety
    ///
    /// `address` must be [https://doc.rust-lang.org/stable/std/ptr/index.html#safety](valid) for reads of 4 bytes
    unsafe fn read_insn(&self, address: usize) -> Result<u32, TextError>;

    /// Replaces the instruction word at `address` and makes the new word visible to instruction fetch
    ///
    /// # Safety
    ///
    /// `address` must be an instruction in code that is safe to redirect, and anything the new word branches to must
    /// be fully written and flushed already
    unsafe fn write_insn(&self, address: usize, insn: u32) -> Result<(), TextError>;

    /// Makes freshly written code in `address..address + len` visible to instruction fetch
    fn flush_icache(&self, address: usize, len: usize);
}
