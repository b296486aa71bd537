//! # Patch
//!
//! The closed set of patch variants. Each variant is described by a static [`PatchDesc`] whose operations
//! create, inspect and tear down the kernel-side state of one hook.

pub mod func;

use std::fmt;
use std::mem::size_of;
use std::sync::Arc;

use crate::insn::{InsnAllocator, InsnFlags};
use crate::module::ModuleRefs;
use crate::patcher::TextPatcher;
use crate::symbol::SymbolResolver;
use crate::trampoline::{Template, FUNC_TEMPLATE};
use crate::user::UserPatchSpec;

use self::func::FuncPatch;

/// Services a patch needs from its environment
#[derive(Clone)]
pub struct Collaborators {
    /// Symbol lookup
    pub symbols: Arc<dyn SymbolResolver>,
    /// Module reference counting
    pub modules: Arc<dyn ModuleRefs>,
    /// Trampoline memory
    pub allocator: Arc<dyn InsnAllocator>,
    /// Access to the code being hooked
    pub text: Arc<dyn TextPatcher>,
}

impl Collaborators {
    /// Collaborators for hooking code of the current process
    pub fn in_process(symbols: Arc<dyn SymbolResolver>, modules: Arc<dyn ModuleRefs>) -> Self {
        Self {
            symbols,
            modules,
            allocator: Arc::new(crate::alloc::NearAllocator::new()),
            text: Arc::new(crate::patcher::mem::ProcessText::new()),
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Patch variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchKind {
    /// Handler runs before the function and may block the call
    FuncPre,
    /// Handler runs in place of the function entry and calls the original itself
    FuncPost,
    /// Handler replaces the function
    #[cfg(feature = "replacement")]
    FuncRep,
}

impl PatchKind {
    /// Static description of the variant
    pub fn desc(self) -> &'static PatchDesc {
        match self {
            Self::FuncPre => &FUNC_PRE_OPS,
            Self::FuncPost => &FUNC_POST_OPS,
            #[cfg(feature = "replacement")]
            Self::FuncRep => &FUNC_REP_OPS,
        }
    }
}

impl fmt::Display for PatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.desc().name)
    }
}

/// Static description of a patch variant.
///
/// The operations themselves live in [`func`]; they only differ between variants in the allocation flags and the
/// trampoline template, which are data here.
#[derive(Debug)]
pub struct PatchDesc {
    /// Variant
    pub kind: PatchKind,
    /// Name used in status output
    pub name: &'static str,
    /// Size of the engine-side state
    pub size: usize,
    /// Size of the caller-submitted description
    pub user_size: usize,
    /// Flags passed to the trampoline allocator
    pub flags: InsnFlags,
    /// Trampoline template, `None` when the jump goes straight to the handler
    pub template: Option<&'static Template>,
}

/// Pre-call function hook
pub static FUNC_PRE_OPS: PatchDesc = PatchDesc {
    kind: PatchKind::FuncPre,
    name: "func_pre",
    size: size_of::<FuncPatch>(),
    user_size: size_of::<UserPatchSpec>(),
    flags: InsnFlags::empty(),
    template: Some(&FUNC_TEMPLATE),
};

/// Post-call function hook. Shares the pre-call template; the handler decides when the original runs.
pub static FUNC_POST_OPS: PatchDesc = PatchDesc {
    kind: PatchKind::FuncPost,
    name: "func_post",
    size: size_of::<FuncPatch>(),
    user_size: size_of::<UserPatchSpec>(),
    flags: InsnFlags::empty(),
    template: Some(&FUNC_TEMPLATE),
};

/// Function replacement
#[cfg(feature = "replacement")]
pub static FUNC_REP_OPS: PatchDesc = PatchDesc {
    kind: PatchKind::FuncRep,
    name: "func_rep",
    size: size_of::<FuncPatch>(),
    user_size: size_of::<UserPatchSpec>(),
    flags: InsnFlags::NO_IC,
    template: None,
};
