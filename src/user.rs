//! # User
//!
//! Caller-submitted hook descriptions and the identity of the caller that submitted them.
//!
//! A [`UserPatchSpec`] comes from code the engine doesn't trust, so every pointer in it is checked against the memory
//! its [`PatchOwner`] declared before anything is dereferenced.

use std::ffi::{c_char, CStr};
use std::mem::{align_of, size_of};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::code::arm64::INSN_SIZE;
use crate::error::HookError;

/// A hook request in caller memory
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UserPatchSpec {
    /// NUL-terminated name of the function to hook
    pub name: *const c_char,
    /// NUL-terminated name of the module defining the function, null for the core image
    pub module: *const c_char,
    /// Address of the handler
    pub handler: usize,
}

impl UserPatchSpec {
    /// Describes a hook on `name` in `module` (`None` for the core image)
    pub fn new(name: &CStr, module: Option<&CStr>, handler: usize) -> Self {
        Self {
            name: name.as_ptr(),
            module: module.map_or(std::ptr::null(), CStr::as_ptr),
            handler,
        }
    }
}

/// A validated copy of a [`UserPatchSpec`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRequest {
    /// Function name
    pub name: String,
    /// Module name, `None` for the core image
    pub module: Option<String>,
    /// Handler address
    pub handler: usize,
}

/// The party hooks are created for.
///
/// Trampolines carry a pointer to their owner and hand it to the attack logger, so an owner has to outlive every hook
/// created for it. Entries hold it in an [`Arc`](std::sync::Arc) for that reason.
#[derive(Debug)]
pub struct PatchOwner {
    /// Name used in reports
    name: String,
    /// Memory the owner may reference in hook requests
    regions: Vec<Range<usize>>,
    /// Calls blocked by this owner's handlers
    attacks: AtomicU64,
}

impl PatchOwner {
    /// Creates an owner that may reference `regions`.
    ///
    /// # Safety
    ///
    /// Every range in `regions` must be readable for as long as the owner is used to validate requests
    pub unsafe fn new(name: impl Into<String>, regions: Vec<Range<usize>>) -> Self {
        Self {
            name: name.into(),
            regions,
            attacks: AtomicU64::new(0),
        }
    }

    /// Name used in reports
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Memory the owner declared readable
    pub fn regions(&self) -> &[Range<usize>] {
        &self.regions
    }

    /// Number of calls blocked so far
    pub fn attacks(&self) -> u64 {
        self.attacks.load(Ordering::Relaxed)
    }

    /// Counts a blocked call and returns the new total
    pub(crate) fn record_attack(&self) -> u64 {
        self.attacks.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the declared region containing all of `address..address + len`
    fn region(&self, address: usize, len: usize) -> Option<&Range<usize>> {
        let end = address.checked_add(len)?;
        self.regions
            .iter()
            .find(|region| region.start <= address && end <= region.end)
    }

    /// Returns true if `address..address + len` lies inside memory the owner declared
    pub fn contains(&self, address: usize, len: usize) -> bool {
        address != 0 && self.region(address, len).is_some()
    }

    /// Reads a NUL-terminated string that has to end inside the region it starts in
    fn read_str(&self, ptr: *const c_char, what: &str) -> Result<String, HookError> {
        let address = ptr as usize;
        let region = self
            .region(address, 1)
            .filter(|_| address != 0)
            .ok_or_else(|| HookError::InvalidArgument(format!("{what} at {address:#x} not accessible")))?;

        // Safety: the region was declared readable when the owner was created
        let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, region.end - address) };
        let nul = bytes
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| HookError::InvalidArgument(format!("{what} is not terminated")))?;
        std::str::from_utf8(&bytes[..nul])
            .map(str::to_string)
            .map_err(|_| HookError::InvalidArgument(format!("{what} is not valid UTF-8")))
    }

    /// Validates and copies a request.
    ///
    /// Nothing is read unless it lies in the owner's memory.
    pub fn read_spec(&self, spec: *const UserPatchSpec) -> Result<PatchRequest, HookError> {
        let address = spec as usize;
        if !self.contains(address, size_of::<UserPatchSpec>()) {
            return Err(HookError::InvalidArgument(format!(
                "patch spec at {address:#x} not accessible"
            )));
        }
        if address % align_of::<UserPatchSpec>() != 0 {
            return Err(HookError::InvalidArgument(format!(
                "patch spec at {address:#x} is misaligned"
            )));
        }
        // Safety: checked to be in readable, aligned owner memory above
        let spec = unsafe { spec.read() };

        if !self.contains(spec.handler, INSN_SIZE) || spec.handler % INSN_SIZE != 0 {
            return Err(HookError::InvalidArgument(format!(
                "handler {:#x} not accessible",
                spec.handler
            )));
        }
        let name = self.read_str(spec.name, "name")?;
        let module = if spec.module.is_null() {
            None
        } else {
            Some(self.read_str(spec.module, "module")?)
        };

        Ok(PatchRequest {
            name,
            module,
            handler: spec.handler,
        })
    }
}
