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

//! Physical address classification
//!
//! Every physical access goes through `map_physical`, which applies the A20
//! gate and then decides which backing store serves the address.

use super::Memory;
use crate::core::error::{EmulatorError, Result};

/// Where a physical address is served from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicalMapping {
    /// Offset into the DRAM buffer
    Dram { offset: usize },
    /// Offset into the ROM buffer
    Rom { offset: usize },
    /// Memory-mapped device window, with the address after A20 masking
    Mmio {
        device: &'static str,
        address: u32,
    },
}

impl Memory {
    /// Classify a physical address
    ///
    /// With A20 disabled bit 20 is cleared first, so 0x100000 aliases 0x00000.
    /// The VGA window and the ROM window shadow DRAM; the top 256 KiB of the
    /// 4 GiB space alias the ROM buffer. Those addresses all have bit 20 set,
    /// so the alias is only reachable with A20 enabled.
    ///
    /// # Arguments
    ///
    /// * `addr` - Physical address
    ///
    /// # Returns
    ///
    /// The backing store and offset, or `OutOfBounds` for unbacked addresses
    ///
    /// # Example
    ///
    /// ```
    /// use pcx::core::memory::{Memory, PhysicalMapping};
    ///
    /// let mut memory = Memory::new(2 * 1024 * 1024);
    ///
    /// assert_eq!(memory.map_physical(0x500).unwrap(), PhysicalMapping::Dram { offset: 0x500 });
    /// assert_eq!(memory.map_physical(0xFFFF0).unwrap(), PhysicalMapping::Rom { offset: 0x3FFF0 });
    /// // A20 is disabled at power-on
    /// assert_eq!(memory.map_physical(0x100010).unwrap(), PhysicalMapping::Dram { offset: 0x10 });
    /// assert!(memory.map_physical(0xFFFFFFF0).is_err());
    /// assert!(memory.map_physical(0x8000_0000).is_err());
    ///
    /// memory.set_a20(true);
    /// assert_eq!(memory.map_physical(0xFFFFFFF0).unwrap(), PhysicalMapping::Rom { offset: 0x3FFF0 });
    /// ```
    #[inline(always)]
    pub fn map_physical(&self, addr: u32) -> Result<PhysicalMapping> {
        let mask = if self.a20_enabled {
            u32::MAX
        } else {
            !Self::A20_BIT
        };
        let addr = addr & mask;

        if (Self::VGA_START..=Self::VGA_END).contains(&addr) {
            Ok(PhysicalMapping::Mmio {
                device: Self::VGA_DEVICE,
                address: addr,
            })
        } else if (Self::ROM_START..=Self::ROM_END).contains(&addr) {
            Ok(PhysicalMapping::Rom {
                offset: (addr - Self::ROM_START) as usize,
            })
        } else if (addr as usize) < self.dram.len() {
            Ok(PhysicalMapping::Dram {
                offset: addr as usize,
            })
        } else if addr >= Self::BIOS_ALIAS_START {
            Ok(PhysicalMapping::Rom {
                offset: (addr as usize) & (Self::ROM_SIZE - 1),
            })
        } else {
            Err(EmulatorError::OutOfBounds { address: addr })
        }
    }

    /// Canonical physical address of a buffer-backed location
    ///
    /// Both views of the BIOS (below 1 MiB and at the top of the space) share
    /// one canonical address in the 0xC0000-0xFFFFF window. MMIO has none.
    pub fn canonical_address(&self, addr: u32) -> Result<Option<u32>> {
        Ok(match self.map_physical(addr)? {
            PhysicalMapping::Dram { offset } => Some(offset as u32),
            PhysicalMapping::Rom { offset } => Some(Self::ROM_START + offset as u32),
            PhysicalMapping::Mmio { .. } => None,
        })
    }
}
