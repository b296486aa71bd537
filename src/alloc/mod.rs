//! # Alloc
//!
//! Executable memory for trampolines and veneers, placed within branch range of the hooked address
//!
//! Pool management is derived from detour-rs: https://github.com/darfink/detour-rs

// detour-rs - A cross-platform detour library written in Rust
// Copyright (C) 2017 Elliott Linder.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
//
// ===============================================================================
//
// minhook-rs - A minimalist x86/x86-64 hooking library for Rust
// Copyright (C) 2015 Jascha Neutelings.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use lazy_static::lazy_static;
use log::debug;

use self::proximity::ProximityError;
use crate::code::arm64::{BRANCH_RANGE, VENEER_SIZE};
use crate::insn::{AllocError, CodeSlot, InsnAllocator, InsnFlags, InsnSlot};
use crate::module::ModuleRef;
use crate::trampoline::TRAMPOLINE_SIZE;

pub mod proximity;
pub mod search;

/// A thread-safe memory pool for allocating chunks close to addresses.
#[derive(Clone)]
pub struct ThreadAllocator(Arc<Mutex<proximity::ProximityAllocator>>);

impl ThreadAllocator {
    /// Creates a new proximity memory allocator.
    pub fn new(max_distance: usize) -> Self {
        ThreadAllocator(Arc::new(Mutex::new(proximity::ProximityAllocator::new(
            max_distance,
        ))))
    }

    /// Allocates read-, write- & executable memory close to `origin`.
    pub fn allocate(&self, origin: usize, size: usize) -> Result<ExecutableMemory, ProximityError> {
        let mut allocator = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        allocator
            .allocate(origin, size)
            .map(|data| ExecutableMemory {
                allocator: self.0.clone(),
                data: Some(data),
            })
    }

    /// Number of memory maps currently backing allocations
    pub fn pool_count(&self) -> usize {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pool_count()
    }
}

/// A handle for allocated proximity memory.
pub struct ExecutableMemory {
    /// Proximity allocator for the executable code to reside
    allocator: Arc<Mutex<proximity::ProximityAllocator>>,
    /// Actual allocation where the executable code resides, taken on drop
    data: Option<proximity::Allocation>,
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            // Release the associated memory map (if this was its last allocation)
            self.allocator
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .release(data);
        }
    }
}

impl Deref for ExecutableMemory {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for ExecutableMemory {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

lazy_static! {
    /// Pools reachable with a single branch from the hooked address
    static ref NEAR_POOL: ThreadAllocator = ThreadAllocator::new(BRANCH_RANGE);
    /// Pools anywhere in the address space, reached through a veneer
    static ref FAR_POOL: ThreadAllocator = ThreadAllocator::new(usize::MAX);
}

/// Trampoline allocator for code mapped in the current process.
///
/// Trampolines are placed within [`BRANCH_RANGE`] of the target so the hook jump reaches them directly. When nothing
/// near the target is free for a whole trampoline, the trampoline is mapped anywhere and only a [`VENEER_SIZE`] byte
/// PLT slot is taken near the target.
#[derive(Clone)]
pub struct NearAllocator {
    /// Pools within branch range
    near: ThreadAllocator,
    /// Pools anywhere
    far: ThreadAllocator,
}

impl NearAllocator {
    /// Creates an allocator sharing the process-wide pools
    pub fn new() -> Self {
        Self {
            near: NEAR_POOL.clone(),
            far: FAR_POOL.clone(),
        }
    }

    /// Creates an allocator with its own pools
    pub fn with_pools(near: ThreadAllocator, far: ThreadAllocator) -> Self {
        Self { near, far }
    }

    /// Allocates a trampoline anywhere plus a PLT slot near `target`
    fn allocate_far(&self, target: usize) -> Result<InsnSlot, AllocError> {
        let plt = self.near.allocate(target, VENEER_SIZE).map_err(|e| match e {
            ProximityError::OutOfMemory => AllocError::OutOfMemory { target },
            e => e.into(),
        })?;
        let trampoline = self.far.allocate(target, TRAMPOLINE_SIZE)?;
        debug!(
            "far trampoline at {:#x} for {:#x}, plt at {:#x}",
            trampoline.as_ptr() as usize,
            target,
            plt.as_ptr() as usize
        );
        Ok(InsnSlot {
            trampoline: CodeSlot::new(trampoline),
            plt: Some(CodeSlot::new(plt)),
        })
    }
}

impl Default for NearAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl InsnAllocator for NearAllocator {
    fn allocate(
        &self,
        target: usize,
        module: Option<&ModuleRef>,
        _flags: InsnFlags,
    ) -> Result<InsnSlot, AllocError> {
        match self.near.allocate(target, TRAMPOLINE_SIZE) {
            Ok(trampoline) => {
                debug!(
                    "trampoline at {:#x} for {:#x} ({})",
                    trampoline.as_ptr() as usize,
                    target,
                    module.map_or("core", ModuleRef::name)
                );
                Ok(InsnSlot {
                    trampoline: CodeSlot::new(trampoline),
                    plt: None,
                })
            }
            Err(ProximityError::OutOfMemory) => self.allocate_far(target),
            Err(e) => Err(e.into()),
        }
    }

    fn free(&self, slot: InsnSlot, _module: Option<&ModuleRef>) {
        // Pools are released once their last chunk drops
        drop(slot);
    }
}
