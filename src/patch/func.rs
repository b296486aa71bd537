//! # Function patches
//!
//! Operations shared by the function hook variants. A function patch has exactly one insertion point: the first
//! instruction of the function, which is displaced by a branch to the trampoline (or straight to the handler for
//! replacements).

use std::fmt;
use std::num::NonZeroU32;

use log::{debug, error};

use super::{Collaborators, PatchDesc};
use crate::code::arm64::relocator::{insn_kind, InsnKind, RelocateError};
use crate::code::arm64::{is_insn_b, make_jump_insn, veneer, INSN_SIZE};
use crate::config::EngineConfig;
use crate::error::HookError;
use crate::insn::{Insn, InsnFlags};
use crate::logger::attack_logger_address;
use crate::module::ModuleRef;
use crate::trampoline::{self, SlotKind, SlotValues};
use crate::user::{PatchOwner, UserPatchSpec};

/// Engine-side state of one function hook
#[derive(Debug)]
pub struct FuncPatch {
    /// Function name
    name: String,
    /// Name of the module defining the function, `None` for the core image
    module_name: Option<String>,
    /// Reference keeping that module loaded
    module: Option<ModuleRef>,
    /// The insertion point
    insn: Insn,
}

impl FuncPatch {
    /// Function name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Module defining the function, `None` for the core image
    pub fn module_name(&self) -> Option<&str> {
        self.module_name.as_deref()
    }

    /// Returns true while a module reference is held
    pub fn holds_module(&self) -> bool {
        self.module.is_some()
    }

    /// The insertion point
    pub fn insn(&self) -> &Insn {
        &self.insn
    }

    /// Mutable insertion point, for building its code
    pub(crate) fn insn_mut(&mut self) -> &mut Insn {
        &mut self.insn
    }
}

impl PatchDesc {
    /// Name of the hooked function
    pub fn get_name<'a>(&self, patch: &'a FuncPatch) -> &'a str {
        patch.name()
    }

    /// Number of insertion points
    pub fn get_count(&self, _patch: &FuncPatch) -> usize {
        1
    }

    /// Writes the status line `"<module> <name>"`, naming the core image `core_name`
    pub fn show_info(
        &self,
        patch: &FuncPatch,
        core_name: &str,
        out: &mut dyn fmt::Write,
    ) -> fmt::Result {
        writeln!(
            out,
            "{} {}",
            patch.module_name().unwrap_or(core_name),
            patch.name()
        )
    }

    /// Calls `callback` on every insertion point
    pub fn with_each_insn<E>(
        &self,
        patch: &FuncPatch,
        mut callback: impl FnMut(&Insn) -> Result<(), E>,
    ) -> Result<(), E> {
        callback(&patch.insn)
    }

    /// Validates a caller's request and prepares a patch for it.
    ///
    /// On success the target is resolved, its module referenced and its trampoline allocated, but nothing has been
    /// written yet. On failure nothing is held.
    pub fn create(
        &self,
        env: &Collaborators,
        config: &EngineConfig,
        owner: &PatchOwner,
        spec: *const UserPatchSpec,
    ) -> Result<FuncPatch, HookError> {
        let request = owner.read_spec(spec).map_err(|e| {
            error!("{}: rejected patch spec: {}", owner.name(), e);
            e
        })?;
        config.check_name(&request.name).map_err(|reason| {
            error!("{}: {}", owner.name(), reason);
            HookError::InvalidArgument(reason)
        })?;

        let name = request.name;
        let module_name = request.module;
        let symbol = match env.symbols.resolve(&name, module_name.as_deref()) {
            Some(symbol) if symbol.count == 1 => symbol,
            other => {
                let count = other.map_or(0, |symbol| symbol.count);
                error!("could not find {}, {}", name, count);
                return Err(HookError::NotFound { name, count });
            }
        };

        let address = symbol.address;
        if symbol.size < INSN_SIZE || address % INSN_SIZE != 0 {
            error!("{} at {:#x} can't be patched", name, address);
            return Err(RelocateError::Misplaced {
                pc: address as u64,
                size: symbol.size,
            }
            .into());
        }

        // Safety: the resolver reported live code at `address`
        let origin = unsafe { env.text.read_insn(address) }?;
        // in case a live patching layer got here first
        if is_insn_b(origin) {
            error!("{:#x} already hooked", address);
            return Err(HookError::AlreadyHooked { address });
        }
        if self.template.is_some() && insn_kind(origin) == InsnKind::Unsupported {
            error!("{:#x} starts with {:#010x}, which can't be relocated", address, origin);
            return Err(RelocateError::Unsupported {
                insn: origin,
                pc: address as u64,
            }
            .into());
        }

        let module = match module_name.as_deref() {
            Some(module_name) => Some(env.modules.acquire(module_name).ok_or_else(|| {
                error!("could not find module {}", module_name);
                HookError::ModuleUnavailable(module_name.to_string())
            })?),
            None => None,
        };

        let slot = match env.allocator.allocate(address, module.as_ref(), self.flags) {
            Ok(slot) => slot,
            Err(e) => {
                error!("no trampoline for {}: {}", name, e);
                if let Some(module) = module {
                    env.modules.release(module);
                }
                return Err(e.into());
            }
        };

        let destination = match self.template {
            Some(_) => slot.trampoline.address(),
            None => request.handler,
        };
        debug!(
            "{} {} at {:#x}: trampoline {:#x}, plt {:?}",
            self.name,
            name,
            address,
            slot.trampoline.address(),
            slot.plt.as_ref().map(|plt| plt.address())
        );

        Ok(FuncPatch {
            name,
            module_name,
            module,
            insn: Insn {
                address,
                handler: request.handler,
                destination,
                origin,
                flags: self.flags,
                slot,
            },
        })
    }

    /// Frees the patch's trampoline and releases its module reference.
    ///
    /// The jump must no longer be installed.
    pub fn destroy(&self, env: &Collaborators, patch: FuncPatch) {
        let FuncPatch {
            name, module, insn, ..
        } = patch;
        debug!("{} {}: freeing trampoline {:#x}", self.name, name, insn.trampoline());
        env.allocator.free(insn.slot, module.as_ref());
        if let Some(module) = module {
            env.modules.release(module);
        }
    }

    /// Encodes the jump written over the insertion point. `None` if no jump can reach the destination.
    pub fn setup_jump(&self, insn: &Insn) -> Option<NonZeroU32> {
        make_jump_insn(insn.address, insn.destination, insn.plt())
            .ok()
            .and_then(NonZeroU32::new)
    }

    /// Generates the trampoline and veneer of `insn` and makes them visible to instruction fetch
    pub fn setup_trampoline(
        &self,
        env: &Collaborators,
        insn: &mut Insn,
        owner: &PatchOwner,
    ) -> Result<(), HookError> {
        if let Some(template) = self.template {
            let values = SlotValues {
                handler: insn.handler,
                resume: insn.address + INSN_SIZE,
                owner: owner as *const PatchOwner as usize,
                logger: attack_logger_address(),
            };
            let tail = trampoline::build(
                template,
                &mut insn.slot.trampoline,
                &values,
                insn.origin,
                insn.address,
            )?;
            debug!(
                "trampoline {:#x} built, displaced {:#010x} at +{:?}, {} tail bytes",
                insn.trampoline(),
                insn.origin,
                template.offset_of(SlotKind::Displaced),
                tail
            );
        }
        if !insn.flags.contains(InsnFlags::NO_IC) {
            let code = &insn.slot.trampoline;
            env.text.flush_icache(code.address(), code.len());
        }

        if let Some(plt) = insn.slot.plt.as_mut() {
            trampoline::write_raw(plt, &veneer(insn.destination))
                .map_err(RelocateError::from)?;
            env.text.flush_icache(plt.address(), plt.len());
        }
        Ok(())
    }

    /// Entry point that runs the original function: the displaced instruction inside the trampoline
    pub fn original(&self, insn: &Insn) -> Option<usize> {
        self.template?
            .offset_of(SlotKind::Displaced)
            .map(|offset| insn.trampoline() + offset)
    }
}
