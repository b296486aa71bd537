//! # Entry
//!
//! Lifecycle of hooks. A [`HookEngine`] owns the collaborators and the text lock; a [`TextSession`] is the held lock,
//! and every operation that writes code goes through one. A [`PatchEntry`] is one installed hook.
//!
//! ```text
//!  create ──> Installed ──uninstall──> Removed ──destroy──> Destroyed
//!                 └──────────────destroy──────────────────────┘
//! ```

use std::fmt;
use std::mem::ManuallyDrop;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use log::{debug, error};
use thiserror::Error;

use crate::config::EngineConfig;
use crate::error::HookError;
use crate::insn::Insn;
use crate::patch::func::FuncPatch;
use crate::patch::{Collaborators, PatchDesc, PatchKind};
use crate::user::{PatchOwner, UserPatchSpec};

/// Engine state shared with the entries it created
#[derive(Debug)]
struct Shared {
    /// Settings
    config: EngineConfig,
    /// Collaborators
    env: Collaborators,
    /// Serializes every write to hooked code
    text_lock: Mutex<()>,
}

/// Creates and tears down hooks
#[derive(Debug, Clone)]
pub struct HookEngine {
    /// State shared with entries
    shared: Arc<Shared>,
}

impl HookEngine {
    /// Creates an engine using `env`
    pub fn new(config: EngineConfig, env: Collaborators) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                env,
                text_lock: Mutex::new(()),
            }),
        }
    }

    /// Settings
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Takes the text lock. Blocks while another session is open.
    pub fn lock(&self) -> TextSession<'_> {
        TextSession {
            shared: &self.shared,
            _guard: self
                .shared
                .text_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// Exclusive access to hooked code.
///
/// Entries dropped while their engine's session is open can't take the lock and leak their trampoline. Destroy them
/// through the session instead.
pub struct TextSession<'a> {
    /// Engine state
    shared: &'a Arc<Shared>,
    /// The held text lock
    _guard: MutexGuard<'a, ()>,
}

impl fmt::Debug for TextSession<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextSession").finish_non_exhaustive()
    }
}

impl TextSession<'_> {
    /// Hooks the function `spec` describes with variant `desc`, on behalf of `owner`.
    ///
    /// The returned entry is installed: the function's first instruction already branches to the hook. Any failure
    /// leaves the target untouched and releases everything acquired on the way.
    pub fn create(
        &self,
        desc: &'static PatchDesc,
        owner: &Arc<PatchOwner>,
        spec: *const UserPatchSpec,
    ) -> Result<PatchEntry, HookError> {
        let env = &self.shared.env;
        let mut patch = desc.create(env, &self.shared.config, owner, spec)?;

        if let Err(e) = desc.setup_trampoline(env, patch.insn_mut(), owner) {
            error!("{}: trampoline for {} failed: {}", owner.name(), patch.name(), e);
            desc.destroy(env, patch);
            return Err(e);
        }

        let insn = patch.insn();
        let Some(jump) = desc.setup_jump(insn) else {
            let e = HookError::JumpSynthesis {
                from: insn.address(),
                to: insn.destination(),
            };
            error!("{}: {}", owner.name(), e);
            desc.destroy(env, patch);
            return Err(e);
        };

        if let Err(e) = install(env, insn, jump) {
            error!("{}: installing {} failed: {}", owner.name(), patch.name(), e);
            desc.destroy(env, patch);
            return Err(e);
        }
        debug!(
            "{}: {} {} installed at {:#x}",
            owner.name(),
            desc.name,
            patch.name(),
            patch.insn().address()
        );

        Ok(PatchEntry {
            desc,
            owner: owner.clone(),
            patch: ManuallyDrop::new(patch),
            jump,
            state: EntryState::Installed,
            shared: self.shared.clone(),
        })
    }

    /// Restores the function's original first instruction. Removed entries are left alone.
    pub fn uninstall(&self, entry: &mut PatchEntry) -> Result<(), HookError> {
        self.check_engine(entry)?;
        entry.remove()
    }

    /// Uninstalls `entry` if needed and frees everything it holds.
    ///
    /// On failure the entry is handed back untouched, so the caller can retry once the target is restored.
    pub fn destroy(&self, mut entry: PatchEntry) -> Result<(), DestroyError> {
        match self.check_engine(&entry).and_then(|()| entry.teardown()) {
            Ok(()) => Ok(()),
            Err(error) => Err(DestroyError { error, entry }),
        }
    }

    /// Refuses entries of another engine, which this session doesn't lock for
    fn check_engine(&self, entry: &PatchEntry) -> Result<(), HookError> {
        if Arc::ptr_eq(self.shared, &entry.shared) {
            Ok(())
        } else {
            Err(HookError::InvalidArgument(
                "entry belongs to another engine".to_string(),
            ))
        }
    }
}

/// Failed [`TextSession::destroy`], holding the entry that could not be destroyed
#[derive(Debug, Error)]
#[error("{error}")]
pub struct DestroyError {
    /// Why the entry is still alive
    error: HookError,
    /// The entry, unchanged apart from a possibly completed uninstall
    entry: PatchEntry,
}

impl DestroyError {
    /// Why the destroy failed
    pub fn error(&self) -> &HookError {
        &self.error
    }

    /// Takes the entry back
    pub fn into_entry(self) -> PatchEntry {
        self.entry
    }
}

/// Writes `jump` over the insertion point if it still holds the saved instruction
fn install(env: &Collaborators, insn: &Insn, jump: NonZeroU32) -> Result<(), HookError> {
    // Safety: the address was resolved to code when the patch was created
    let found = unsafe { env.text.read_insn(insn.address()) }?;
    if found != insn.origin() {
        return Err(HookError::TargetChanged {
            address: insn.address(),
            found,
        });
    }
    // Safety: the trampoline and veneer are complete and flushed
    unsafe { env.text.write_insn(insn.address(), jump.get()) }?;
    Ok(())
}

/// Lifecycle state of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// The function branches to the hook
    Installed,
    /// The original instruction is back, the trampoline is still held
    Removed,
    /// Everything is released
    Destroyed,
}

/// One hook
pub struct PatchEntry {
    /// Variant
    desc: &'static PatchDesc,
    /// Owner, embedded in the trampoline
    owner: Arc<PatchOwner>,
    /// Patch state, taken when the entry is destroyed
    patch: ManuallyDrop<FuncPatch>,
    /// Jump written over the function entry
    jump: NonZeroU32,
    /// Lifecycle state
    state: EntryState,
    /// Engine the entry belongs to
    shared: Arc<Shared>,
}

impl PatchEntry {
    /// Name of the hooked function
    pub fn name(&self) -> &str {
        self.desc.get_name(&self.patch)
    }

    /// Module defining the hooked function, `None` for the core image
    pub fn module(&self) -> Option<&str> {
        self.patch.module_name()
    }

    /// Variant
    pub fn kind(&self) -> PatchKind {
        self.desc.kind
    }

    /// Variant description
    pub fn desc(&self) -> &'static PatchDesc {
        self.desc
    }

    /// Owner the hook was created for
    pub fn owner(&self) -> &Arc<PatchOwner> {
        &self.owner
    }

    /// Lifecycle state
    pub fn state(&self) -> EntryState {
        self.state
    }

    /// Hooked address
    pub fn target(&self) -> usize {
        self.patch.insn().address()
    }

    /// Trampoline address
    pub fn trampoline(&self) -> usize {
        self.patch.insn().trampoline()
    }

    /// Handler address
    pub fn handler(&self) -> usize {
        self.patch.insn().handler()
    }

    /// Jump written over the function entry
    pub fn jump(&self) -> u32 {
        self.jump.get()
    }

    /// Address that runs the unhooked function, for handlers that call the original themselves.
    ///
    /// `None` for replacements, whose trampoline holds no code.
    pub fn original(&self) -> Option<usize> {
        self.desc.original(self.patch.insn())
    }

    /// Number of insertion points
    pub fn count(&self) -> usize {
        self.desc.get_count(&self.patch)
    }

    /// Writes the status line of the hook
    pub fn show_info(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        self.desc
            .show_info(&self.patch, &self.shared.config.core_name, out)
    }

    /// Calls `callback` on every insertion point
    pub fn for_each_insn<E>(&self, callback: impl FnMut(&Insn) -> Result<(), E>) -> Result<(), E> {
        self.desc.with_each_insn(&self.patch, callback)
    }

    /// Restores the original instruction. The text lock must be held.
    fn remove(&mut self) -> Result<(), HookError> {
        if self.state != EntryState::Installed {
            return Ok(());
        }
        let env = &self.shared.env;
        let insn = self.patch.insn();
        // Safety: the address held our jump when it was installed
        let found = unsafe { env.text.read_insn(insn.address()) }?;
        if found != self.jump.get() {
            error!(
                "{}: {:#x} was changed to {:#010x}, leaving it",
                self.owner.name(),
                insn.address(),
                found
            );
            return Err(HookError::TargetChanged {
                address: insn.address(),
                found,
            });
        }
        // Safety: restoring the word that was there before the hook
        unsafe { env.text.write_insn(insn.address(), insn.origin()) }?;
        debug!("{}: {} removed", self.owner.name(), self.name());
        self.state = EntryState::Removed;
        Ok(())
    }

    /// Removes the hook if needed and releases the patch. The text lock must be held.
    fn teardown(&mut self) -> Result<(), HookError> {
        self.remove()?;
        if self.state == EntryState::Removed {
            // Safety: the state moves to Destroyed right away, so the patch is never touched again
            let patch = unsafe { ManuallyDrop::take(&mut self.patch) };
            self.state = EntryState::Destroyed;
            self.desc.destroy(&self.shared.env, patch);
        }
        Ok(())
    }

    /// Pins the owner for good. A trampoline left in place still hands its address to the attack logger.
    fn leak_owner(&self) {
        std::mem::forget(Arc::clone(&self.owner));
    }
}

impl fmt::Debug for PatchEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("PatchEntry");
        debug
            .field("kind", &self.desc.kind)
            .field("state", &self.state);
        if self.state != EntryState::Destroyed {
            debug
                .field("name", &self.name())
                .field("target", &format_args!("{:#x}", self.target()));
        }
        debug.finish()
    }
}

impl Drop for PatchEntry {
    fn drop(&mut self) {
        if self.state == EntryState::Destroyed {
            return;
        }
        let shared = self.shared.clone();
        let _guard = match shared.text_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                // The patch stays in its ManuallyDrop, so the trampoline is never freed under a live jump
                error!(
                    "{}: text locked while dropping {}, leaking its trampoline",
                    self.owner.name(),
                    self.name()
                );
                self.leak_owner();
                return;
            }
        };
        if let Err(e) = self.teardown() {
            error!(
                "{}: could not tear down {}, leaking its trampoline: {}",
                self.owner.name(),
                self.name(),
                e
            );
            self.leak_owner();
        }
    }
}
