//! Proximity allocator
//!
//! Hands out chunks of RWX pools mapped within a maximum distance of an origin address.
//! Derived from detour-rs: https://github.com/darfink/detour-rs

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

use std::ops::Range;
use std::slice;

use log::debug;
use slice_pool::sync::{SliceBox, SlicePool};
use thiserror::Error;

use super::search as region_search;

/// Defines the allocation type.
pub type Allocation = SliceBox<u8>;

/// Errors that occur while creating proximity allocations
#[derive(Debug, Error)]
pub enum ProximityError {
    /// Ran out of memory within an acceptable proximity to the allocation location
    #[error("Ran out of memory within an acceptable proximity to the allocation location")]
    OutOfMemory,
    /// Error while memmapping a region
    #[error("{0}")]
    MmapError(mmap::MapError),
    /// Error while querying a memory region
    #[error("{0}")]
    RegionError(#[from] region::Error),
}

/// A memory map and the number of allocations handed out from it
struct Pool {
    /// Sub-allocating pool over the memory map
    memory: SlicePool<u8>,
    /// Allocations that haven't been released yet
    live: usize,
}

impl Pool {
    /// Address range covered by the pool
    fn range(&self) -> Range<usize> {
        let lower = self.memory.as_ptr() as usize;
        lower..lower + self.memory.len()
    }
}

/// Shared instance containing all pools
pub struct ProximityAllocator {
    /// Max distance away from the origin that the pool can be
    max_distance: usize,
    /// Memory pools used for allocations
    pools: Vec<Pool>,
}

impl ProximityAllocator {
    /// Creates an allocator without any pools
    pub fn new(max_distance: usize) -> Self {
        Self {
            max_distance,
            pools: Vec::new(),
        }
    }

    /// Number of memory maps currently held
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Allocates a slice in an eligible memory map.
    pub fn allocate(&mut self, origin: usize, size: usize) -> Result<Allocation, ProximityError> {
        let memory_range =
            (origin.saturating_sub(self.max_distance))..(origin.saturating_add(self.max_distance));

        // Check if an existing pool can handle the allocation request
        if let Some(allocation) = self.allocate_memory(&memory_range, size) {
            return Ok(allocation);
        }

        // ... otherwise allocate a pool within the memory range
        let memory = self.allocate_pool(&memory_range, origin, size)?;
        let allocation = memory.alloc(size).ok_or(ProximityError::OutOfMemory)?;
        debug!(
            "mapped pool at {:#x} ({} bytes) for {:#x}",
            memory.as_ptr() as usize,
            memory.len(),
            origin
        );
        self.pools.push(Pool { memory, live: 1 });
        Ok(allocation)
    }

    /// Returns an allocation and unmaps its pool if nothing else lives in it.
    pub fn release(&mut self, value: Allocation) {
        let address = value.as_ptr() as usize;
        // the chunk goes back to its pool before the pool itself may be dropped
        drop(value);

        let Some(index) = self
            .pools
            .iter()
            .position(|pool| pool.range().contains(&address))
        else {
            debug!("released {:#x} from an unknown pool", address);
            return;
        };

        let pool = &mut self.pools[index];
        pool.live = pool.live.saturating_sub(1);
        if pool.live == 0 {
            let pool = self.pools.remove(index);
            debug!("unmapped pool at {:#x}", pool.range().start);
        }
    }

    /// Allocates a chunk using any of the existing pools.
    fn allocate_memory(&mut self, range: &Range<usize>, size: usize) -> Option<Allocation> {
        // Tries to allocate a slice within any eligible pool
        self.pools.iter_mut().find_map(|pool| {
            let pool_range = pool.range();
            // Only pools entirely within the range are eligible
            if !range.contains(&pool_range.start) || !range.contains(&(pool_range.end - 1)) {
                return None;
            }
            let allocation = pool.memory.alloc(size)?;
            pool.live += 1;
            Some(allocation)
        })
    }

    /// Allocates a new pool close to `origin`.
    fn allocate_pool(
        &mut self,
        range: &Range<usize>,
        origin: usize,
        size: usize,
    ) -> Result<SlicePool<u8>, ProximityError> {
        let page_size = region::page::size();
        // Pools are at least a page so later allocations can share them
        let pool_size = size.max(1).div_ceil(page_size) * page_size;
        // Keep the whole pool in range, not just its first byte
        let search_range = range.start..range.end.saturating_sub(pool_size);
        let origin = origin & !(page_size - 1);

        let before = region_search::before(origin, Some(search_range.clone()));
        let after = region_search::after(origin, Some(search_range));

        // Try to allocate after the specified address first (mostly because
        // macOS cannot allocate memory before the process's address).
        after
            .chain(before)
            .find_map(|result| match result {
                Ok(address) => Self::allocate_fixed_pool(address, pool_size).ok().map(Ok),
                Err(error) => Some(Err(ProximityError::RegionError(error))),
            })
            .unwrap_or(Err(ProximityError::OutOfMemory))
    }

    /// Tries to allocate fixed memory at the specified address.
    fn allocate_fixed_pool(
        address: *const (),
        size: usize,
    ) -> Result<SlicePool<u8>, ProximityError> {
        // Try to allocate memory at the specified address
        mmap::MemoryMap::new(
            size,
            &[
                mmap::MapOption::MapReadable,
                mmap::MapOption::MapWritable,
                mmap::MapOption::MapExecutable,
                mmap::MapOption::MapAddr(address as *const _),
            ],
        )
        .map_err(|e| match e {
            mmap::MapError::ErrNoMem => ProximityError::OutOfMemory,
            e => ProximityError::MmapError(e),
        })
        .map(SliceableMemoryMap)
        .map(SlicePool::new)
    }
}

/// A wrapper for making a memory map compatible with `SlicePool`.
struct SliceableMemoryMap(mmap::MemoryMap);

impl SliceableMemoryMap {
    /// Get a slice of the memory map
    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.0.data(), self.0.len()) }
    }

    /// Get a mutable slice of the memory map
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.0.data(), self.0.len()) }
    }
}

impl AsRef<[u8]> for SliceableMemoryMap {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for SliceableMemoryMap {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

// Safety: the mapping is only reached through the pool, which serializes access
unsafe impl Send for SliceableMemoryMap {}
unsafe impl Sync for SliceableMemoryMap {}
