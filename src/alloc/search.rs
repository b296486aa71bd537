//! Searches memory for free pages close to a specified address
//!
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

/// Returns an iterator over free pages at or after `origin`, nearest first.
pub fn after(
    origin: usize,
    range: Option<Range<usize>>,
) -> impl Iterator<Item = Result<*const (), region::Error>> {
    FreeRegionIter::new(origin, range, SearchDirection::After)
}

/// Returns an iterator over free pages before `origin`, nearest first.
pub fn before(
    origin: usize,
    range: Option<Range<usize>>,
) -> impl Iterator<Item = Result<*const (), region::Error>> {
    FreeRegionIter::new(origin, range, SearchDirection::Before)
}

/// Direction for the region search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchDirection {
    /// Towards lower addresses
    Before,
    /// Towards higher addresses
    After,
}

/// An iterator searching for free regions.
struct FreeRegionIter {
    /// Range we're iterating over
    range: Range<usize>,
    /// Direction we're searching
    search: SearchDirection,
    /// Current location in the search, always page aligned
    current: usize,
    /// Size of a page
    page_size: usize,
}

impl FreeRegionIter {
    /// Creates a new iterator for free regions.
    fn new(origin: usize, range: Option<Range<usize>>, search: SearchDirection) -> Self {
        let page_size = region::page::size();
        FreeRegionIter {
            range: range.unwrap_or(0..usize::MAX),
            current: origin & !(page_size - 1),
            search,
            page_size,
        }
    }

    /// Moves one page in the search direction, ending the search on overflow
    fn step(&mut self, from: usize) {
        self.current = match self.search {
            SearchDirection::Before => from.saturating_sub(self.page_size),
            SearchDirection::After => from.checked_add(self.page_size).unwrap_or(0),
        };
    }
}

impl Iterator for FreeRegionIter {
    type Item = Result<*const (), region::Error>;

    /// Returns the closest free region for the current address.
    fn next(&mut self) -> Option<Self::Item> {
        while self.current > 0 && self.range.contains(&self.current) {
            match region::query(self.current as *const ()) {
                // Skip over the whole mapped region
                Ok(region) => match self.search {
                    SearchDirection::Before => self.step(region.as_range().start),
                    SearchDirection::After => self.current = region.as_range().end,
                },
                Err(region::Error::UnmappedRegion) => {
                    let free = self.current;
                    self.step(free);
                    return Some(Ok(free as *const ()));
                }
                Err(error) => {
                    let current = self.current;
                    self.step(current);
                    return Some(Err(error));
                }
            }
        }

        None
    }
}
