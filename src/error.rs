//! # Error
//!
//! Errors returned by the engine

use thiserror::Error;

use crate::code::arm64::relocator::RelocateError;
use crate::insn::AllocError;
use crate::patcher::TextError;

/// Errors while creating or tearing down a hook
#[derive(Debug, Error)]
pub enum HookError {
    /// The caller's description is malformed or points outside its memory
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The symbol doesn't resolve to exactly one function
    #[error("could not find {name}, {count} matches")]
    NotFound {
        /// Symbol name
        name: String,
        /// Number of symbols that matched
        count: usize,
    },
    /// The target already starts with a branch
    #[error("{address:#x} already hooked")]
    AlreadyHooked {
        /// Target address
        address: usize,
    },
    /// No memory for the trampoline
    #[error("{0}")]
    ResourceExhausted(#[from] AllocError),
    /// The named module isn't loaded
    #[error("could not find module {0}")]
    ModuleUnavailable(String),
    /// The entry instruction can't run from the trampoline
    #[error("{0}")]
    Unpatchable(#[from] RelocateError),
    /// No jump could be encoded from the target to the trampoline
    #[error("could not encode jump {from:#x} -> {to:#x}")]
    JumpSynthesis {
        /// Target address
        from: usize,
        /// Jump destination
        to: usize,
    },
    /// Reading or writing the target failed
    #[error("{0}")]
    Text(#[from] TextError),
    /// The target no longer holds the hook's jump
    #[error("{address:#x} holds {found:#010x} instead of the hook jump")]
    TargetChanged {
        /// Target address
        address: usize,
        /// Word found at the target
        found: u32,
    },
}
