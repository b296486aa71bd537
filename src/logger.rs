//! # Logger
//!
//! Sink for calls blocked by a handler. Trampolines call it directly, so only its address leaves this module.

use log::warn;

use crate::user::PatchOwner;

/// Reports a call blocked by one of `owner`'s handlers with `verdict`.
///
/// Called from generated code with the owner pointer embedded in the trampoline.
pub extern "C" fn attack_logger(owner: *const PatchOwner, verdict: i64) {
    // Safety: trampolines embed the owner of a live entry, and entries keep their owner alive
    match unsafe { owner.as_ref() } {
        Some(owner) => {
            let total = owner.record_attack();
            warn!(
                "{}: blocked call, verdict {} ({} blocked)",
                owner.name(),
                verdict,
                total
            );
        }
        None => warn!("blocked call without owner, verdict {}", verdict),
    }
}

/// Address embedded in trampolines to reach [`attack_logger`]
pub fn attack_logger_address() -> usize {
    attack_logger as usize
}
