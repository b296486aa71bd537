//! # Insn
//!
//! A single patch point: the hooked address, the code generated for it, and what is needed to undo the patch.

use std::fmt;
use std::ops::DerefMut;

use bitflags::bitflags;
use thiserror::Error;

use crate::module::ModuleRef;

bitflags! {
    /// Behavior flags of a patch point, passed to the [`InsnAllocator`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InsnFlags: u32 {
        /// The trampoline never runs original code, so its instruction cache lines are not flushed
        const NO_IC = 0x1;
    }
}

/// Errors while allocating memory for a patch point
#[derive(Debug, Error)]
pub enum AllocError {
    /// No memory left that the target can reach
    #[error("no memory available near {target:#x}")]
    OutOfMemory {
        /// Address the memory had to be close to
        target: usize,
    },
    /// The underlying mapping failed
    #[error("{0}")]
    ProximityError(#[from] crate::alloc::proximity::ProximityError),
}

/// A block of generated code.
///
/// `address` is where the code executes, which is the buffer's own address for memory mapped in this process.
pub struct CodeSlot {
    /// Runtime address of the first byte
    address: usize,
    /// Backing memory
    memory: Box<dyn DerefMut<Target = [u8]>>,
}

impl CodeSlot {
    /// Wraps memory that executes at its own address
    pub fn new<M: DerefMut<Target = [u8]> + 'static>(memory: M) -> Self {
        let address = memory.as_ptr() as usize;
        Self::with_address(address, memory)
    }

    /// Wraps memory that will execute at `address`
    pub fn with_address<M: DerefMut<Target = [u8]> + 'static>(address: usize, memory: M) -> Self {
        Self {
            address,
            memory: Box::new(memory),
        }
    }

    /// Runtime address of the slot
    pub fn address(&self) -> usize {
        self.address
    }

    /// Size of the slot in bytes
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    /// Returns true if the slot has no room for code
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// Contents of the slot
    pub fn bytes(&self) -> &[u8] {
        &self.memory
    }

    /// Mutable contents of the slot
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }
}

impl fmt::Debug for CodeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeSlot")
            .field("address", &format_args!("{:#x}", self.address))
            .field("len", &self.len())
            .finish()
    }
}

/// Memory handed out for one patch point
#[derive(Debug)]
pub struct InsnSlot {
    /// Trampoline memory
    pub trampoline: CodeSlot,
    /// Veneer slot within branch range of the target, present when the trampoline is not
    pub plt: Option<CodeSlot>,
}

/// Allocator for patch point memory
pub trait InsnAllocator: Send + Sync {
    /// Allocates a trampoline for a hook at `target`, owned by `module` (`None` for the core image)
    fn allocate(
        &self,
        target: usize,
        module: Option<&ModuleRef>,
        flags: InsnFlags,
    ) -> Result<InsnSlot, AllocError>;

    /// Returns the memory of a patch point. Must only be called once nothing can branch into it anymore.
    fn free(&self, slot: InsnSlot, module: Option<&ModuleRef>);
}

/// One patch point
#[derive(Debug)]
pub struct Insn {
    /// Hooked address
    pub(crate) address: usize,
    /// Handler address
    pub(crate) handler: usize,
    /// Where the jump written at `address` leads
    pub(crate) destination: usize,
    /// Instruction word that was at `address` before patching
    pub(crate) origin: u32,
    /// Behavior flags
    pub(crate) flags: InsnFlags,
    /// Generated code
    pub(crate) slot: InsnSlot,
}

impl Insn {
    /// Hooked address
    pub fn address(&self) -> usize {
        self.address
    }

    /// Handler address
    pub fn handler(&self) -> usize {
        self.handler
    }

    /// Trampoline address
    pub fn trampoline(&self) -> usize {
        self.slot.trampoline.address()
    }

    /// Veneer address, if one was needed
    pub fn plt(&self) -> Option<usize> {
        self.slot.plt.as_ref().map(CodeSlot::address)
    }

    /// Where the hook jump leads, before going through the veneer
    pub fn destination(&self) -> usize {
        self.destination
    }

    /// The saved original instruction word
    pub fn origin(&self) -> u32 {
        self.origin
    }

    /// Behavior flags
    pub fn flags(&self) -> InsnFlags {
        self.flags
    }

    /// Generated trampoline code
    pub fn trampoline_code(&self) -> &[u8] {
        self.slot.trampoline.bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Slots report their own buffer address unless told otherwise
    fn test_code_slot_address() {
        let slot = CodeSlot::new(vec![0u8; 16]);
        assert_eq!(slot.address(), slot.bytes().as_ptr() as usize);
        assert_eq!(slot.len(), 16);

        let mut slot = CodeSlot::with_address(0x1000, vec![0u8; 8]);
        slot.bytes_mut()[0] = 0xAA;
        assert_eq!(slot.address(), 0x1000);
        assert_eq!(slot.bytes()[0], 0xAA);
        assert!(!slot.is_empty());
    }
}
