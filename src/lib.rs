#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod alloc;
pub mod code;
pub mod config;
pub mod entry;
pub mod error;
pub mod insn;
pub mod logger;
pub mod module;
pub mod patch;
pub mod patcher;
pub mod symbol;
pub mod trampoline;
pub mod user;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use entry::{DestroyError, EntryState, HookEngine, PatchEntry, TextSession};
pub use error::HookError;
pub use patch::{Collaborators, PatchDesc, PatchKind, FUNC_POST_OPS, FUNC_PRE_OPS};
#[cfg(feature = "replacement")]
pub use patch::FUNC_REP_OPS;
pub use user::{PatchOwner, UserPatchSpec};
