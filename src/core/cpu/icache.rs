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

//! Decoded-instruction cache
//!
//! Instructions are decoded once and cached by the canonical physical
//! address of their first byte. Keying on the physical address means two
//! CS:IP pairs that reach the same byte share one entry, and the BIOS seen
//! through the high alias shares entries with the copy below 1 MiB.
//!
//! Entries are also tagged with the code segment's default operand/address
//! size, since the same bytes decode differently in 16- and 32-bit code.
//!
//! # Example
//!
//! ```
//! use pcx::core::cpu::decode::decode;
//! use pcx::core::cpu::icache::InstructionCache;
//!
//! let bytes: &[u8] = &[0x90];
//! let nop = decode(&mut &bytes[..], 0, false, false).unwrap();
//!
//! let mut cache = InstructionCache::new();
//! cache.store(0x7C00, false, nop);
//! assert!(cache.fetch(0x7C00, false).is_some());
//!
//! // A write over the instruction's bytes evicts it
//! cache.invalidate_range(0x7C00, 1);
//! assert!(cache.fetch(0x7C00, false).is_none());
//! ```

use super::decode::MAX_INSTRUCTION_LEN;
use super::instruction::Instruction;
use std::collections::BTreeMap;

/// A cached decode
#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    instruction: Instruction,
    /// Code segment default size the bytes were decoded under
    default_big: bool,
}

/// Cache of decoded instructions keyed by physical address
#[derive(Debug, Default)]
pub struct InstructionCache {
    entries: BTreeMap<u32, CacheEntry>,
    hits: u64,
    misses: u64,
}

impl InstructionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the instruction starting at `addr`
    ///
    /// # Arguments
    ///
    /// * `addr` - Canonical physical address of the first byte
    /// * `default_big` - D bit of the current code segment
    ///
    /// # Returns
    ///
    /// - `Some(instruction)` on a hit
    /// - `None` on a miss, or if the entry was decoded for the other code size
    #[inline]
    pub fn fetch(&mut self, addr: u32, default_big: bool) -> Option<Instruction> {
        match self.entries.get(&addr) {
            Some(entry) if entry.default_big == default_big => {
                self.hits += 1;
                Some(entry.instruction)
            }
            _ => {
                self.misses += 1;
                None
            }
        }
    }

    /// Cache a freshly decoded instruction, replacing any previous entry
    #[inline]
    pub fn store(&mut self, addr: u32, default_big: bool, instruction: Instruction) {
        self.entries.insert(
            addr,
            CacheEntry {
                instruction,
                default_big,
            },
        );
    }

    /// Evict the entry starting at `addr`
    pub fn invalidate(&mut self, addr: u32) {
        self.entries.remove(&addr);
    }

    /// Evict every entry whose bytes overlap `[start, start + len)`
    ///
    /// Returns the number of evicted entries.
    pub fn invalidate_range(&mut self, start: u32, len: u32) -> usize {
        if len == 0 {
            return 0;
        }
        let end = start.saturating_add(len);
        let first = start.saturating_sub(MAX_INSTRUCTION_LEN - 1);

        let stale: Vec<u32> = self
            .entries
            .range(first..end)
            .filter(|(addr, entry)| addr.saturating_add(entry.instruction.len as u32) > start)
            .map(|(addr, _)| *addr)
            .collect();

        for addr in &stale {
            self.entries.remove(addr);
        }
        if !stale.is_empty() {
            log::debug!(
                "icache: evicted {} entries overlapping 0x{:05X}+{}",
                stale.len(),
                start,
                len
            );
        }
        stale.len()
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            log::debug!("icache: flushed {} entries", self.entries.len());
        }
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of cached instructions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// (hits, misses) since creation
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}
