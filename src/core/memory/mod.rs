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

//! Physical memory subsystem for the PC emulator
//!
//! `Memory` owns the physical address space: the DRAM buffer, the ROM buffer
//! backing the expansion/BIOS window, memory-mapped I/O handlers, and the A20
//! gate. Segmentation lives in the CPU; this module only sees linear and
//! physical addresses.
//!
//! # Memory Map
//!
//! | Physical Address Range  | Region              | Backing            |
//! |-------------------------|---------------------|--------------------|
//! | 0x00000000-DRAM end     | DRAM                | `dram` buffer      |
//! | 0x000A0000-0x000BFFFF   | VGA window          | registered handler |
//! | 0x000C0000-0x000FFFFF   | Expansion/BIOS ROM  | `rom` buffer       |
//! | 0xFFFC0000-0xFFFFFFFF   | BIOS alias          | `rom` buffer       |
//!
//! The VGA and ROM windows take precedence over DRAM.
//!
//! # Example
//!
//! ```
//! use pcx::core::memory::Memory;
//!
//! let mut memory = Memory::new(1024 * 1024);
//! memory.write_physical(0x1234, 0xBEEF, 2).unwrap();
//! assert_eq!(memory.read_physical(0x1234, 2).unwrap(), 0xBEEF);
//! assert_eq!(memory.read_physical(0x1234, 1).unwrap(), 0xEF);
//! ```

mod cache;
mod io_device;
mod region;

#[cfg(test)]
mod tests;

pub use io_device::MmioHandler;
pub use region::PhysicalMapping;

use crate::core::cpu::segment::DescriptorTableRegister;
use crate::core::error::{EmulatorError, ExceptionVector, Result};
use crate::core::save_state::{MemoryState, StateSave};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// A fixed MMIO window and the device serving it
struct MmioWindow {
    begin: u32,
    end: u32,
    handler: Box<dyn MmioHandler>,
}

/// Physical memory of the emulated PC
pub struct Memory {
    /// Main DRAM
    dram: Vec<u8>,

    /// ROM buffer for 0xC0000-0xFFFFF, also seen through the top-of-space alias
    rom: Vec<u8>,

    /// A20 gate; when disabled bit 20 of every physical address is forced to 0
    a20_enabled: bool,

    /// A20 state restored by `reset()`
    a20_at_reset: bool,

    /// Mirrors CR0.PG
    paging_enabled: bool,

    /// Registered MMIO windows by device name
    handlers: HashMap<&'static str, MmioWindow>,

    /// One bit per 4 KiB page that holds decoded code
    code_pages: Vec<u64>,

    /// Writes that landed in code pages since the last drain
    code_writes: Vec<(u32, u32)>,
}

impl Memory {
    /// ROM window physical address range
    pub const ROM_START: u32 = 0x000C_0000;
    pub const ROM_END: u32 = 0x000F_FFFF;

    /// ROM buffer size (expansion ROMs + system BIOS)
    pub const ROM_SIZE: usize = (Self::ROM_END - Self::ROM_START + 1) as usize;

    /// VGA MMIO window
    pub const VGA_START: u32 = 0x000A_0000;
    pub const VGA_END: u32 = 0x000B_FFFF;

    /// Top-of-space BIOS alias
    pub const BIOS_ALIAS_START: u32 = 0xFFFC_0000;

    /// Device name accepted by `register_memory_handlers`
    pub const VGA_DEVICE: &'static str = "vga";

    /// Address bit cleared while the A20 gate is disabled
    const A20_BIT: u32 = 1 << 20;

    /// Create memory with `dram_size` bytes of DRAM, all zero
    ///
    /// The A20 gate starts disabled, as on a real PC at power-on.
    pub fn new(dram_size: usize) -> Self {
        let tracked = dram_size.max(Self::ROM_END as usize + 1);
        let page_count = tracked.div_ceil(Self::CODE_PAGE_SIZE);
        Self {
            dram: vec![0u8; dram_size],
            rom: vec![0u8; Self::ROM_SIZE],
            a20_enabled: false,
            a20_at_reset: false,
            paging_enabled: false,
            handlers: HashMap::new(),
            code_pages: vec![0u64; page_count.div_ceil(64)],
            code_writes: Vec::new(),
        }
    }

    /// Create memory with the given A20 state at power-on and reset
    pub fn with_a20(dram_size: usize, a20_enabled: bool) -> Self {
        let mut memory = Self::new(dram_size);
        memory.a20_enabled = a20_enabled;
        memory.a20_at_reset = a20_enabled;
        memory
    }

    /// Reset volatile state
    ///
    /// DRAM is cleared; ROM contents and MMIO registrations are preserved.
    pub fn reset(&mut self) {
        self.dram.fill(0);
        self.a20_enabled = self.a20_at_reset;
        self.paging_enabled = false;
        self.code_pages.fill(0);
        self.code_writes.clear();
    }

    /// DRAM size in bytes
    pub fn dram_size(&self) -> usize {
        self.dram.len()
    }

    /// Raw DRAM contents
    pub fn dram(&self) -> &[u8] {
        &self.dram
    }

    /// Replace DRAM contents (save state restore)
    pub fn restore_dram(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != self.dram.len() {
            return Err(EmulatorError::SaveState(format!(
                "DRAM size mismatch: state has {} bytes, machine has {}",
                data.len(),
                self.dram.len()
            )));
        }
        self.dram.copy_from_slice(data);
        self.code_pages.fill(0);
        self.code_writes.clear();
        Ok(())
    }

    /// Current A20 gate state
    pub fn a20_enabled(&self) -> bool {
        self.a20_enabled
    }

    /// Open or close the A20 gate
    pub fn set_a20(&mut self, enabled: bool) {
        if self.a20_enabled != enabled {
            log::debug!("A20 gate {}", if enabled { "enabled" } else { "disabled" });
        }
        self.a20_enabled = enabled;
    }

    /// Track CR0.PG
    pub fn set_paging(&mut self, enabled: bool) {
        self.paging_enabled = enabled;
    }

    /// Install a fixed MMIO window
    ///
    /// Only the VGA device at 0xA0000-0xBFFFF is supported; anything else is
    /// a configuration error.
    ///
    /// # Example
    ///
    /// ```
    /// use pcx::core::memory::{Memory, MmioHandler};
    ///
    /// struct Null;
    /// impl MmioHandler for Null {
    ///     fn read(&mut self, _addr: u32, _size: u8) -> u32 { 0 }
    ///     fn write(&mut self, _addr: u32, _value: u32, _size: u8) {}
    /// }
    ///
    /// let mut memory = Memory::new(1024 * 1024);
    /// assert!(memory
    ///     .register_memory_handlers(0xA0000, 0xBFFFF, "vga", Box::new(Null))
    ///     .is_ok());
    /// assert!(memory
    ///     .register_memory_handlers(0xD0000, 0xDFFFF, "nic", Box::new(Null))
    ///     .is_err());
    /// ```
    pub fn register_memory_handlers(
        &mut self,
        begin: u32,
        end: u32,
        device: &str,
        handler: Box<dyn MmioHandler>,
    ) -> Result<()> {
        if device != Self::VGA_DEVICE {
            return Err(EmulatorError::Configuration(format!(
                "unsupported MMIO device '{}'",
                device
            )));
        }
        if begin != Self::VGA_START || end != Self::VGA_END {
            return Err(EmulatorError::Configuration(format!(
                "VGA window must be 0x{:05X}-0x{:05X}, got 0x{:05X}-0x{:05X}",
                Self::VGA_START,
                Self::VGA_END,
                begin,
                end
            )));
        }

        log::info!(
            "MMIO: '{}' registered at 0x{:05X}-0x{:05X}",
            device,
            begin,
            end
        );
        self.handlers.insert(
            Self::VGA_DEVICE,
            MmioWindow {
                begin,
                end,
                handler,
            },
        );
        Ok(())
    }

    /// Read 1, 2 or 4 bytes from a physical address (little-endian)
    ///
    /// An access that straddles two backing stores (DRAM into the VGA
    /// window, the ROM top into wrapped DRAM) is split into byte accesses,
    /// each classified on its own.
    pub fn read_physical(&mut self, addr: u32, size: u8) -> Result<u32> {
        let mapping = self.map_physical(addr)?;
        if size > 1 && !self.is_contiguous(mapping, addr, size) {
            let mut value = 0;
            for i in 0..size as u32 {
                value |= (self.read_physical(addr.wrapping_add(i), 1)? & 0xFF) << (8 * i);
            }
            return Ok(value);
        }
        match mapping {
            PhysicalMapping::Dram { offset } => read_le(&self.dram, offset, size, addr),
            PhysicalMapping::Rom { offset } => read_le(&self.rom, offset, size, addr),
            PhysicalMapping::Mmio { device, address } => {
                let window = self
                    .handlers
                    .get_mut(device)
                    .ok_or(EmulatorError::OutOfBounds { address })?;
                debug_assert!(address >= window.begin && address <= window.end);
                Ok(window.handler.read(address, size))
            }
        }
    }

    /// Write 1, 2 or 4 bytes to a physical address (little-endian)
    ///
    /// Writes that land in pages holding decoded instructions are queued for
    /// instruction-cache invalidation. Straddling writes are split the same
    /// way as reads.
    pub fn write_physical(&mut self, addr: u32, value: u32, size: u8) -> Result<()> {
        let mapping = self.map_physical(addr)?;
        if size > 1 && !self.is_contiguous(mapping, addr, size) {
            for i in 0..size as u32 {
                self.write_physical(addr.wrapping_add(i), (value >> (8 * i)) & 0xFF, 1)?;
            }
            return Ok(());
        }
        match mapping {
            PhysicalMapping::Dram { offset } => {
                write_le(&mut self.dram, offset, value, size, addr)?;
                self.note_code_write(offset as u32, size as u32);
            }
            PhysicalMapping::Rom { offset } => {
                write_le(&mut self.rom, offset, value, size, addr)?;
                self.note_code_write(Self::ROM_START + offset as u32, size as u32);
            }
            PhysicalMapping::Mmio { device, address } => {
                let window = self
                    .handlers
                    .get_mut(device)
                    .ok_or(EmulatorError::OutOfBounds { address })?;
                window.handler.write(address, value, size);
            }
        }
        Ok(())
    }

    /// Whether every byte of a multi-byte access lands in the same store
    /// at consecutive offsets
    fn is_contiguous(&self, first: PhysicalMapping, addr: u32, size: u8) -> bool {
        let span = size as u32 - 1;
        let Ok(last) = self.map_physical(addr.wrapping_add(span)) else {
            return false;
        };
        match (first, last) {
            (PhysicalMapping::Dram { offset: a }, PhysicalMapping::Dram { offset: b })
            | (PhysicalMapping::Rom { offset: a }, PhysicalMapping::Rom { offset: b }) => {
                b == a + span as usize
            }
            (
                PhysicalMapping::Mmio {
                    device: d1,
                    address: a,
                },
                PhysicalMapping::Mmio {
                    device: d2,
                    address: b,
                },
            ) => d1 == d2 && b == a.wrapping_add(span),
            _ => false,
        }
    }

    /// Translate a linear address to a physical address
    ///
    /// Identity while paging is off. Page-table translation is not
    /// implemented and fails loudly.
    #[inline(always)]
    pub fn linear_to_physical(&self, linear: u32) -> Result<u32> {
        if self.paging_enabled {
            return Err(EmulatorError::Unimplemented("paging"));
        }
        Ok(linear)
    }

    /// Read from a linear address
    #[inline]
    pub fn read_linear(&mut self, linear: u32, size: u8) -> Result<u32> {
        let physical = self.linear_to_physical(linear)?;
        self.read_physical(physical, size)
    }

    /// Write to a linear address
    #[inline]
    pub fn write_linear(&mut self, linear: u32, value: u32, size: u8) -> Result<()> {
        let physical = self.linear_to_physical(linear)?;
        self.write_physical(physical, value, size)
    }

    /// Read the raw 8-byte descriptor named by `selector`
    ///
    /// The table indicator picks the GDT or the LDT. A selector whose
    /// descriptor lies beyond the table limit raises `exception` with the
    /// selector (RPL cleared) as error code.
    pub fn fetch_raw_descriptor(
        &mut self,
        selector: u16,
        gdtr: &DescriptorTableRegister,
        ldtr: &DescriptorTableRegister,
        exception: ExceptionVector,
    ) -> Result<u64> {
        let table = if selector & 0x4 != 0 { ldtr } else { gdtr };
        let offset = (selector & 0xFFF8) as u32;

        if offset + 7 > table.limit {
            return Err(EmulatorError::exception(
                exception,
                Some(selector & 0xFFFC),
            ));
        }

        let addr = table.base.wrapping_add(offset);
        let low = self.read_linear(addr, 4)? as u64;
        let high = self.read_linear(addr.wrapping_add(4), 4)? as u64;
        Ok(low | (high << 32))
    }

    /// Copy a firmware image into the ROM window at `physical`
    pub fn load_rom_image(&mut self, physical: u32, image: &[u8]) -> Result<()> {
        let end = physical as usize + image.len();
        if physical < Self::ROM_START || end > Self::ROM_END as usize + 1 {
            return Err(EmulatorError::Configuration(format!(
                "ROM image of {} bytes does not fit at 0x{:05X}",
                image.len(),
                physical
            )));
        }
        let offset = (physical - Self::ROM_START) as usize;
        self.rom[offset..offset + image.len()].copy_from_slice(image);
        self.note_code_write(physical, image.len() as u32);
        Ok(())
    }

    /// Load a BIOS image from file so that it ends at 0xFFFFF
    ///
    /// The reset vector at F000:FFF0 then lands in the last 16 bytes of the
    /// image.
    pub fn load_bios<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let mut file = File::open(path)?;
        let mut image = Vec::new();
        file.read_to_end(&mut image)?;

        if image.is_empty() || image.len() > Self::ROM_SIZE {
            return Err(EmulatorError::InvalidBiosSize {
                expected: Self::ROM_SIZE,
                got: image.len(),
            });
        }

        let start = Self::ROM_END + 1 - image.len() as u32;
        log::info!(
            "BIOS: {} bytes loaded at 0x{:05X}-0x{:05X}",
            image.len(),
            start,
            Self::ROM_END
        );
        self.load_rom_image(start, &image)
    }
}

impl StateSave for Memory {
    type State = MemoryState;

    fn to_state(&self) -> MemoryState {
        MemoryState {
            dram: self.dram.clone(),
            a20_enabled: self.a20_enabled,
        }
    }

    fn restore_from_state(&mut self, state: &MemoryState) -> Result<()> {
        self.restore_dram(&state.dram)?;
        self.set_a20(state.a20_enabled);
        Ok(())
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new(16 * 1024 * 1024)
    }
}

#[inline(always)]
fn read_le(buffer: &[u8], offset: usize, size: u8, addr: u32) -> Result<u32> {
    let bytes = buffer
        .get(offset..offset + size as usize)
        .ok_or(EmulatorError::OutOfBounds { address: addr })?;
    Ok(match size {
        1 => bytes[0] as u32,
        2 => u16::from_le_bytes([bytes[0], bytes[1]]) as u32,
        4 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        _ => return Err(EmulatorError::OutOfBounds { address: addr }),
    })
}

#[inline(always)]
fn write_le(buffer: &mut [u8], offset: usize, value: u32, size: u8, addr: u32) -> Result<()> {
    let bytes = buffer
        .get_mut(offset..offset + size as usize)
        .ok_or(EmulatorError::OutOfBounds { address: addr })?;
    match size {
        1 | 2 | 4 => {
            bytes.copy_from_slice(&value.to_le_bytes()[..size as usize]);
            Ok(())
        }
        _ => Err(EmulatorError::OutOfBounds { address: addr }),
    }
}
