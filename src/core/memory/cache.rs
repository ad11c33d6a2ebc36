// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 itsakeyfut
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Code-page tracking for instruction cache coherency
//!
//! The CPU marks the physical pages it decodes instructions from. A write
//! that lands in a marked page is queued as a (start, length) range in
//! canonical physical addresses. The CPU drains the queue after every
//! instruction and invalidates overlapping cache entries, so a store into
//! the instruction stream is seen by the next fetch.

use super::Memory;

impl Memory {
    /// Granularity of code tracking
    pub const CODE_PAGE_SIZE: usize = 4096;

    /// Mark the pages covering `[addr, addr + len)` as holding code
    ///
    /// # Arguments
    ///
    /// * `addr` - Canonical physical address of the first code byte
    /// * `len` - Number of bytes
    pub fn mark_code(&mut self, addr: u32, len: u32) {
        if len == 0 {
            return;
        }
        let first = addr as usize / Self::CODE_PAGE_SIZE;
        let last = (addr as usize + len as usize - 1) / Self::CODE_PAGE_SIZE;
        for page in first..=last {
            if let Some(word) = self.code_pages.get_mut(page / 64) {
                *word |= 1 << (page % 64);
            }
        }
    }

    /// Whether any page covering `[addr, addr + len)` holds code
    pub fn is_code(&self, addr: u32, len: u32) -> bool {
        if len == 0 {
            return false;
        }
        let first = addr as usize / Self::CODE_PAGE_SIZE;
        let last = (addr as usize + len as usize - 1) / Self::CODE_PAGE_SIZE;
        (first..=last).any(|page| {
            self.code_pages
                .get(page / 64)
                .is_some_and(|word| word & (1 << (page % 64)) != 0)
        })
    }

    /// Forget all code marks
    ///
    /// Called when the instruction cache is flushed as a whole.
    pub fn clear_code_marks(&mut self) {
        self.code_pages.fill(0);
        self.code_writes.clear();
    }

    /// Drain the queue of writes that hit code pages
    ///
    /// Returns all queued (start, length) ranges and clears the queue.
    pub fn drain_code_writes(&mut self) -> Vec<(u32, u32)> {
        self.code_writes.drain(..).collect()
    }

    /// Queue a write for invalidation if it touches a code page
    pub(super) fn note_code_write(&mut self, addr: u32, len: u32) {
        if self.is_code(addr, len) {
            log::trace!("code write at 0x{:05X} ({} bytes)", addr, len);
            self.code_writes.push((addr, len));
        }
    }
}
