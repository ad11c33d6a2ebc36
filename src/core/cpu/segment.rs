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

//! Segment registers and the descriptor cache
//!
//! A segment register holds the visible 16-bit selector and a cached copy of
//! the descriptor it was loaded from. All address checks use the cache, so
//! modifying a descriptor in memory has no effect until the register is
//! reloaded.
//!
//! In real and virtual-8086 mode a load only sets `base = selector << 4`;
//! the limit and access rights keep whatever they held before, which is
//! what makes "unreal mode" work.

use super::registers::SegReg;
use crate::core::error::{EmulatorError, ExceptionVector, Result};
use crate::core::memory::Memory;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Base and limit of the GDT, IDT or current LDT
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorTableRegister {
    pub base: u32,
    pub limit: u32,
}

/// Processor operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuMode {
    Real,
    Protected,
    Virtual8086,
}

impl CpuMode {
    /// Whether segment loads go through descriptor tables
    pub fn uses_descriptors(self) -> bool {
        self == CpuMode::Protected
    }
}

/// Descriptor table selected by a selector's TI bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DescriptorTable {
    #[default]
    Gdt,
    Ldt,
}

/// Decoded selector fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Selector {
    pub index: u16,
    pub table: DescriptorTable,
    pub rpl: u8,
}

impl Selector {
    /// Null selectors are index 0 in the GDT, whatever the RPL
    pub fn is_null(&self) -> bool {
        self.index == 0 && self.table == DescriptorTable::Gdt
    }
}

impl From<u16> for Selector {
    fn from(value: u16) -> Self {
        Self {
            index: value >> 3,
            table: if value & 0x4 != 0 {
                DescriptorTable::Ldt
            } else {
                DescriptorTable::Gdt
            },
            rpl: (value & 0x3) as u8,
        }
    }
}

bitflags! {
    /// Access byte of a segment descriptor
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessRights: u8 {
        const ACCESSED = 1 << 0;
        /// Readable (code) or writable (data)
        const READ_WRITE = 1 << 1;
        /// Conforming (code) or expand-down (data)
        const CONFORMING_EXPAND_DOWN = 1 << 2;
        const EXECUTABLE = 1 << 3;
        /// Code/data descriptor (clear for system descriptors)
        const CODE_DATA = 1 << 4;
        const DPL = 3 << 5;
        const PRESENT = 1 << 7;
    }
}

/// A raw 8-byte descriptor split into its fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub base: u32,
    /// Limit in bytes after granularity scaling
    pub limit_scaled: u32,
    pub access: AccessRights,
    pub default_big: bool,
    pub granularity: bool,
}

impl Descriptor {
    /// Split a raw descriptor
    ///
    /// # Example
    ///
    /// ```
    /// use pcx::core::cpu::segment::Descriptor;
    ///
    /// // Flat 4 GiB code segment
    /// let d = Descriptor::parse(0x00CF_9A00_0000_FFFF);
    /// assert_eq!(d.base, 0);
    /// assert_eq!(d.limit_scaled, 0xFFFF_FFFF);
    /// assert!(d.is_code());
    /// assert!(d.default_big);
    /// ```
    pub fn parse(raw: u64) -> Self {
        let limit = (raw & 0xFFFF) as u32 | (((raw >> 48) & 0xF) as u32) << 16;
        let base = ((raw >> 16) & 0xFF_FFFF) as u32 | (((raw >> 56) & 0xFF) as u32) << 24;
        let access = AccessRights::from_bits_retain((raw >> 40) as u8);
        let flags = (raw >> 52) & 0xF;
        let granularity = flags & 0x8 != 0;

        Self {
            base,
            limit_scaled: if granularity {
                (limit << 12) | 0xFFF
            } else {
                limit
            },
            access,
            default_big: flags & 0x4 != 0,
            granularity,
        }
    }

    pub fn dpl(&self) -> u8 {
        (self.access.bits() >> 5) & 3
    }

    pub fn present(&self) -> bool {
        self.access.contains(AccessRights::PRESENT)
    }

    /// System descriptor type nibble (LDT, TSS, gates)
    pub fn system_type(&self) -> Option<u8> {
        (!self.access.contains(AccessRights::CODE_DATA)).then_some(self.access.bits() & 0xF)
    }

    pub fn is_code(&self) -> bool {
        self.access
            .contains(AccessRights::CODE_DATA | AccessRights::EXECUTABLE)
    }

    pub fn is_data(&self) -> bool {
        self.access.contains(AccessRights::CODE_DATA)
            && !self.access.contains(AccessRights::EXECUTABLE)
    }
}

/// Cached descriptor attributes used for every access through a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorCache {
    pub base: u32,
    pub limit_scaled: u32,
    pub dpl: u8,
    /// Low four bits of the access byte
    pub kind: u8,
    pub present: bool,
    /// False after loading a null selector into DS/ES/FS/GS
    pub valid: bool,
    pub code_data: bool,
    pub executable: bool,
    pub readable: bool,
    pub writable: bool,
    pub conforming: bool,
    pub expand_down: bool,
    pub default_big: bool,
    pub granularity: bool,
}

impl DescriptorCache {
    /// Attributes of a segment after reset: 64 KiB, present, read/write
    pub fn real_mode(executable: bool) -> Self {
        Self {
            base: 0,
            limit_scaled: 0xFFFF,
            dpl: 0,
            kind: if executable { 0xB } else { 0x3 },
            present: true,
            valid: true,
            code_data: true,
            executable,
            readable: true,
            writable: !executable,
            conforming: false,
            expand_down: false,
            default_big: false,
            granularity: false,
        }
    }

    fn from_descriptor(d: &Descriptor) -> Self {
        let executable = d.access.contains(AccessRights::EXECUTABLE);
        let rw = d.access.contains(AccessRights::READ_WRITE);
        let ce = d.access.contains(AccessRights::CONFORMING_EXPAND_DOWN);
        Self {
            base: d.base,
            limit_scaled: d.limit_scaled,
            dpl: d.dpl(),
            kind: d.access.bits() & 0xF,
            present: d.present(),
            valid: true,
            code_data: d.access.contains(AccessRights::CODE_DATA),
            executable,
            readable: !executable || rw,
            writable: !executable && rw,
            conforming: executable && ce,
            expand_down: !executable && ce,
            default_big: d.default_big,
            granularity: d.granularity,
        }
    }

    /// Whether `[offset, offset + size)` lies inside the segment
    #[inline]
    pub fn within_limit(&self, offset: u32, size: u8) -> bool {
        let Some(last) = offset.checked_add(size.max(1) as u32 - 1) else {
            return false;
        };
        if self.expand_down {
            let upper = if self.default_big { u32::MAX } else { 0xFFFF };
            offset > self.limit_scaled && last <= upper
        } else {
            last <= self.limit_scaled
        }
    }
}

/// Kind of access made through a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// CPU state a segment load depends on
pub struct SegmentEnv<'a> {
    pub mode: CpuMode,
    pub cpl: u8,
    pub gdtr: DescriptorTableRegister,
    pub ldtr: DescriptorTableRegister,
    pub memory: &'a mut Memory,
}

/// A segment register: visible selector plus descriptor cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegRegister {
    kind: SegReg,
    value: u16,
    selector: Selector,
    cache: DescriptorCache,
}

impl SegRegister {
    /// Segment register in its reset state
    ///
    /// CS resets to selector 0xF000 with base 0xF0000, so F000:FFF0 reaches
    /// the BIOS reset vector at physical 0xFFFF0.
    pub fn new(kind: SegReg) -> Self {
        let mut reg = Self {
            kind,
            value: 0,
            selector: Selector::default(),
            cache: DescriptorCache::real_mode(kind == SegReg::Cs),
        };
        reg.reset();
        reg
    }

    /// Restore the reset state
    pub fn reset(&mut self) {
        let value = if self.kind == SegReg::Cs { 0xF000 } else { 0 };
        self.value = value;
        self.selector = Selector::from(value);
        self.cache = DescriptorCache::real_mode(self.kind == SegReg::Cs);
        self.cache.base = (value as u32) << 4;
    }

    /// Which register this is
    pub fn kind(&self) -> SegReg {
        self.kind
    }

    /// Visible selector value
    #[inline(always)]
    pub fn value(&self) -> u16 {
        self.value
    }

    pub fn selector(&self) -> Selector {
        self.selector
    }

    #[inline(always)]
    pub fn base(&self) -> u32 {
        self.cache.base
    }

    #[inline(always)]
    pub fn cache(&self) -> &DescriptorCache {
        &self.cache
    }

    /// Exception raised for limit violations through this segment
    pub fn exception_vector(&self) -> ExceptionVector {
        if self.kind == SegReg::Ss {
            ExceptionVector::StackFault
        } else {
            ExceptionVector::GeneralProtection
        }
    }

    /// Load a new selector
    ///
    /// In real and virtual-8086 mode only the base changes. In protected mode
    /// the descriptor is fetched, checked against the current privilege
    /// level, marked accessed in memory and cached. On any fault the register
    /// is left untouched.
    ///
    /// # Arguments
    ///
    /// * `value` - Selector value (masked to 16 bits)
    /// * `env` - Mode, privilege level, descriptor tables and memory
    ///
    /// # Example
    ///
    /// ```
    /// use pcx::core::cpu::registers::SegReg;
    /// use pcx::core::cpu::segment::{CpuMode, DescriptorTableRegister, SegRegister, SegmentEnv};
    /// use pcx::core::memory::Memory;
    ///
    /// let mut memory = Memory::new(1024 * 1024);
    /// let mut ds = SegRegister::new(SegReg::Ds);
    /// let mut env = SegmentEnv {
    ///     mode: CpuMode::Real,
    ///     cpl: 0,
    ///     gdtr: DescriptorTableRegister::default(),
    ///     ldtr: DescriptorTableRegister::default(),
    ///     memory: &mut memory,
    /// };
    ///
    /// ds.set(0x1234, &mut env).unwrap();
    /// assert_eq!(ds.base(), 0x12340);
    /// assert!(ds.cache().present);
    /// ```
    pub fn set(&mut self, value: u32, env: &mut SegmentEnv) -> Result<()> {
        let value = (value & 0xFFFF) as u16;
        if !env.mode.uses_descriptors() {
            self.value = value;
            self.selector = Selector::from(value);
            self.cache.base = (value as u32) << 4;
            self.cache.present = true;
            self.cache.valid = true;
            return Ok(());
        }

        let selector = Selector::from(value);
        let cache = match self.kind {
            SegReg::Ss => load_stack_segment(value, selector, env)?,
            SegReg::Cs => load_code_segment(value, selector, env)?,
            _ => match load_data_segment(value, selector, env)? {
                Some(cache) => cache,
                None => {
                    log::trace!("{}: null selector loaded", self.kind);
                    self.value = value;
                    self.selector = selector;
                    self.cache.valid = false;
                    self.cache.present = false;
                    return Ok(());
                }
            },
        };

        log::debug!(
            "{} <- 0x{:04X}: base=0x{:08X} limit=0x{:08X} dpl={}",
            self.kind,
            value,
            cache.base,
            cache.limit_scaled,
            cache.dpl
        );
        self.value = value;
        self.selector = selector;
        self.cache = cache;
        Ok(())
    }

    /// Check an access and return its linear address
    ///
    /// Limit violations raise the segment's exception vector with error
    /// code 0. Protected mode also rejects writes to code or read-only data,
    /// reads from execute-only code, and any use of a null segment. In real
    /// mode a violation is a host-level `MemoryFault`.
    #[inline]
    pub fn linear_address(&self, offset: u32, size: u8, kind: AccessKind, mode: CpuMode) -> Result<u32> {
        let vector = if mode != CpuMode::Real && !self.permits(kind) {
            Some(ExceptionVector::GeneralProtection)
        } else if !self.cache.within_limit(offset, size) {
            Some(self.exception_vector())
        } else {
            None
        };

        if let Some(vector) = vector {
            if mode == CpuMode::Real {
                return Err(EmulatorError::MemoryFault {
                    vector,
                    address: self.cache.base.wrapping_add(offset),
                });
            }
            return Err(EmulatorError::exception(vector, Some(0)));
        }

        Ok(self.cache.base.wrapping_add(offset))
    }

    fn permits(&self, kind: AccessKind) -> bool {
        self.cache.valid
            && match kind {
                AccessKind::Read => self.cache.readable,
                AccessKind::Write => self.cache.writable,
                AccessKind::Execute => self.cache.executable,
            }
    }

    /// Read `size` bytes at `offset` within the segment
    #[inline]
    pub fn read_segment(&self, memory: &mut Memory, offset: u32, size: u8, mode: CpuMode) -> Result<u32> {
        let linear = self.linear_address(offset, size, AccessKind::Read, mode)?;
        memory.read_linear(linear, size)
    }

    /// Write `size` bytes at `offset` within the segment
    #[inline]
    pub fn write_segment(
        &self,
        memory: &mut Memory,
        offset: u32,
        value: u32,
        size: u8,
        mode: CpuMode,
    ) -> Result<()> {
        let linear = self.linear_address(offset, size, AccessKind::Write, mode)?;
        memory.write_linear(linear, value, size)
    }
}

/// Fetch, parse and mark accessed the descriptor for a non-null selector
fn fetch_descriptor(value: u16, env: &mut SegmentEnv, exception: ExceptionVector) -> Result<Descriptor> {
    let raw = env
        .memory
        .fetch_raw_descriptor(value, &env.gdtr, &env.ldtr, exception)?;
    Ok(Descriptor::parse(raw))
}

fn mark_accessed(value: u16, descriptor: &Descriptor, env: &mut SegmentEnv) -> Result<()> {
    if descriptor.access.contains(AccessRights::ACCESSED) {
        return Ok(());
    }
    let table = if value & 0x4 != 0 { env.ldtr } else { env.gdtr };
    let addr = table.base.wrapping_add((value & 0xFFF8) as u32 + 5);
    let access = descriptor.access | AccessRights::ACCESSED;
    env.memory.write_linear(addr, access.bits() as u32, 1)
}

fn gp(value: u16) -> EmulatorError {
    EmulatorError::exception(ExceptionVector::GeneralProtection, Some(value & 0xFFFC))
}

fn load_stack_segment(value: u16, selector: Selector, env: &mut SegmentEnv) -> Result<DescriptorCache> {
    if selector.is_null() {
        return Err(EmulatorError::exception(
            ExceptionVector::GeneralProtection,
            Some(0),
        ));
    }
    if selector.rpl != env.cpl {
        return Err(gp(value));
    }

    let descriptor = fetch_descriptor(value, env, ExceptionVector::GeneralProtection)?;
    if !descriptor.is_data() || !descriptor.access.contains(AccessRights::READ_WRITE) {
        return Err(gp(value));
    }
    if descriptor.dpl() != env.cpl {
        return Err(gp(value));
    }
    if !descriptor.present() {
        return Err(EmulatorError::exception(
            ExceptionVector::StackFault,
            Some(value & 0xFFFC),
        ));
    }

    mark_accessed(value, &descriptor, env)?;
    Ok(DescriptorCache::from_descriptor(&descriptor))
}

fn load_code_segment(value: u16, selector: Selector, env: &mut SegmentEnv) -> Result<DescriptorCache> {
    if selector.is_null() {
        return Err(EmulatorError::exception(
            ExceptionVector::GeneralProtection,
            Some(0),
        ));
    }

    let descriptor = fetch_descriptor(value, env, ExceptionVector::GeneralProtection)?;
    if !descriptor.is_code() {
        return Err(gp(value));
    }
    let conforming = descriptor
        .access
        .contains(AccessRights::CONFORMING_EXPAND_DOWN);
    if conforming {
        if descriptor.dpl() > env.cpl {
            return Err(gp(value));
        }
    } else {
        if selector.rpl > env.cpl {
            return Err(EmulatorError::Unimplemented("privilege level change"));
        }
        if descriptor.dpl() != env.cpl {
            return Err(gp(value));
        }
    }
    if !descriptor.present() {
        return Err(EmulatorError::exception(
            ExceptionVector::SegmentNotPresent,
            Some(value & 0xFFFC),
        ));
    }

    mark_accessed(value, &descriptor, env)?;
    Ok(DescriptorCache::from_descriptor(&descriptor))
}

/// Returns `None` for a null selector
fn load_data_segment(
    value: u16,
    selector: Selector,
    env: &mut SegmentEnv,
) -> Result<Option<DescriptorCache>> {
    if selector.is_null() {
        return Ok(None);
    }

    let descriptor = fetch_descriptor(value, env, ExceptionVector::GeneralProtection)?;
    let readable_code =
        descriptor.is_code() && descriptor.access.contains(AccessRights::READ_WRITE);
    if !descriptor.is_data() && !readable_code {
        return Err(gp(value));
    }

    let conforming_code = descriptor.is_code()
        && descriptor
            .access
            .contains(AccessRights::CONFORMING_EXPAND_DOWN);
    if !conforming_code && selector.rpl.max(env.cpl) > descriptor.dpl() {
        return Err(gp(value));
    }
    if !descriptor.present() {
        return Err(EmulatorError::exception(
            ExceptionVector::SegmentNotPresent,
            Some(value & 0xFFFC),
        ));
    }

    mark_accessed(value, &descriptor, env)?;
    Ok(Some(DescriptorCache::from_descriptor(&descriptor)))
}
