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

//! Decoded operands
//!
//! The decoder resolves every operand to an `Accessor` once, so execution
//! only dispatches on a small enum instead of re-examining the operand's
//! addressing method each time it is read or written.
//!
//! Memory displacements are stored with their encoded size and are
//! sign-extended when the effective address is computed.

use super::flags::size_mask;
use super::registers::{RegisterRef, SegReg};
use super::CPU;
use crate::core::error::{EmulatorError, Result};
use crate::core::memory::Memory;
use std::fmt;

/// Operand category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    General,
    Segment,
    Control,
    Debug,
    Mmx,
    Simd,
    Immediate,
    MemDisplacement,
    Flags,
}

/// How an operand is read and written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Accessor {
    /// Direct general register
    Register(RegisterRef),
    /// Memory at segment:[base + index + disp]
    Pointer,
    Immediate,
    /// Memory at segment:[disp] (moffs forms)
    MemDisplacement,
    Segment(SegReg),
    Control(u8),
    Debug(u8),
    Flags,
}

/// Immediate or displacement bytes as encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Encoded {
    pub value: u32,
    /// Encoded width in bytes
    pub size: u8,
}

/// A resolved instruction operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operand {
    pub kind: OperandKind,
    /// Access width in bytes
    pub size: u8,
    pub base: Option<RegisterRef>,
    pub index: Option<RegisterRef>,
    pub immediate: Option<Encoded>,
    pub displacement: Option<Encoded>,
    pub is_pointer: bool,
    /// Segment used for memory access (default or override)
    pub segment: SegReg,
    /// Effective addresses wrap at 32 bits instead of 16
    pub address_size32: bool,
    pub accessor: Accessor,
}

impl Operand {
    fn empty(kind: OperandKind, size: u8, accessor: Accessor) -> Self {
        Self {
            kind,
            size,
            base: None,
            index: None,
            immediate: None,
            displacement: None,
            is_pointer: false,
            segment: SegReg::Ds,
            address_size32: false,
            accessor,
        }
    }

    /// General register
    pub fn register(reg: RegisterRef) -> Self {
        Self::empty(OperandKind::General, reg.size(), Accessor::Register(reg))
    }

    /// Immediate of `encoded_size` bytes read as `size` bytes (sign-extended)
    pub fn immediate(value: u32, encoded_size: u8, size: u8) -> Self {
        let mut op = Self::empty(OperandKind::Immediate, size, Accessor::Immediate);
        op.immediate = Some(Encoded {
            value: value & size_mask(encoded_size),
            size: encoded_size,
        });
        op
    }

    /// Memory operand addressed through registers and a displacement
    pub fn pointer(
        base: Option<RegisterRef>,
        index: Option<RegisterRef>,
        displacement: Option<Encoded>,
        segment: SegReg,
        size: u8,
        address_size32: bool,
    ) -> Self {
        Self {
            base,
            index,
            displacement,
            is_pointer: true,
            segment,
            address_size32,
            ..Self::empty(OperandKind::General, size, Accessor::Pointer)
        }
    }

    /// Memory operand at a direct offset
    pub fn mem_displacement(offset: Encoded, segment: SegReg, size: u8, address_size32: bool) -> Self {
        Self {
            displacement: Some(offset),
            is_pointer: true,
            segment,
            address_size32,
            ..Self::empty(OperandKind::MemDisplacement, size, Accessor::MemDisplacement)
        }
    }

    pub fn segment_register(seg: SegReg) -> Self {
        Self::empty(OperandKind::Segment, 2, Accessor::Segment(seg))
    }

    pub fn control(index: u8) -> Self {
        Self::empty(OperandKind::Control, 4, Accessor::Control(index))
    }

    pub fn debug(index: u8) -> Self {
        Self::empty(OperandKind::Debug, 4, Accessor::Debug(index))
    }

    pub fn flags(size: u8) -> Self {
        Self::empty(OperandKind::Flags, size, Accessor::Flags)
    }

    /// Mask covering the operand width
    #[inline(always)]
    pub fn mask(&self) -> u32 {
        size_mask(self.size)
    }

    /// Whether the operand lives in memory
    #[inline(always)]
    pub fn is_memory(&self) -> bool {
        matches!(self.accessor, Accessor::Pointer | Accessor::MemDisplacement)
    }

    /// Immediate value sign-extended to the operand width
    #[inline]
    pub fn immediate_value(&self) -> u32 {
        self.immediate
            .map(|imm| sign_extend(imm.value, imm.size, self.size))
            .unwrap_or(0)
    }
}

/// Sign-extend the low `from` bytes of `value` to `to` bytes
///
/// Applying the same extension twice gives the same result.
///
/// # Example
///
/// ```
/// use pcx::core::cpu::operand::sign_extend;
///
/// assert_eq!(sign_extend(0x80, 1, 2), 0xFF80);
/// assert_eq!(sign_extend(0x7F, 1, 4), 0x7F);
/// assert_eq!(sign_extend(0xFFFE, 2, 4), 0xFFFF_FFFE);
/// ```
#[inline(always)]
pub fn sign_extend(value: u32, from: u8, to: u8) -> u32 {
    let extended = match from {
        1 => value as u8 as i8 as i32 as u32,
        2 => value as u16 as i16 as i32 as u32,
        _ => value,
    };
    extended & size_mask(to)
}

fn ptr_name(size: u8) -> &'static str {
    match size {
        1 => "byte",
        2 => "word",
        4 => "dword",
        6 => "fword",
        _ => "",
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.accessor {
            Accessor::Register(reg) => write!(f, "{}", reg),
            Accessor::Immediate => write!(f, "0x{:X}", self.immediate_value()),
            Accessor::Segment(seg) => write!(f, "{}", seg),
            Accessor::Control(n) => write!(f, "cr{}", n),
            Accessor::Debug(n) => write!(f, "dr{}", n),
            Accessor::Flags => f.write_str("flags"),
            Accessor::Pointer | Accessor::MemDisplacement => {
                write!(f, "{} ptr {}:[", ptr_name(self.size), self.segment)?;
                let mut first = true;
                for reg in [self.base, self.index].into_iter().flatten() {
                    if !first {
                        f.write_str("+")?;
                    }
                    write!(f, "{}", reg)?;
                    first = false;
                }
                if let Some(disp) = self.displacement {
                    let value = if self.accessor == Accessor::Pointer {
                        sign_extend(disp.value, disp.size, 4) as i32
                    } else {
                        disp.value as i32
                    };
                    if first {
                        write!(f, "0x{:X}", disp.value)?;
                    } else if value < 0 {
                        write!(f, "-0x{:X}", value.unsigned_abs())?;
                    } else {
                        write!(f, "+0x{:X}", value)?;
                    }
                }
                f.write_str("]")
            }
        }
    }
}

impl CPU {
    /// Effective address of a memory operand, `extra` bytes in
    ///
    /// base + index + extra + sign-extended displacement, wrapped to the
    /// operand's address width.
    #[inline]
    pub fn effective_address(&self, op: &Operand, extra: u32) -> u32 {
        let mut ea = extra;
        if let Some(base) = op.base {
            ea = ea.wrapping_add(self.regs.read(base));
        }
        if let Some(index) = op.index {
            ea = ea.wrapping_add(self.regs.read(index));
        }
        if let Some(disp) = op.displacement {
            let disp = match op.accessor {
                Accessor::MemDisplacement => disp.value,
                _ => sign_extend(disp.value, disp.size, 4),
            };
            ea = ea.wrapping_add(disp);
        }
        if op.address_size32 {
            ea
        } else {
            ea & 0xFFFF
        }
    }

    /// Read an operand at its own width
    #[inline]
    pub fn read_operand(&mut self, memory: &mut Memory, op: &Operand) -> Result<u32> {
        self.read_operand_at(memory, op, 0, op.size)
    }

    /// Read `size` bytes of an operand, `extra` bytes past its address
    ///
    /// `extra` and `size` only matter for memory operands; they select the
    /// parts of far pointers and descriptor-table images.
    pub fn read_operand_at(&mut self, memory: &mut Memory, op: &Operand, extra: u32, size: u8) -> Result<u32> {
        match op.accessor {
            Accessor::Register(reg) => Ok(self.regs.read(reg)),
            Accessor::Pointer | Accessor::MemDisplacement => {
                let ea = self.effective_address(op, extra);
                let mode = self.mode();
                self.segs[op.segment.index()].read_segment(memory, ea, size, mode)
            }
            Accessor::Immediate => Ok(op.immediate_value()),
            Accessor::Segment(seg) => Ok(self.segs[seg.index()].value() as u32),
            Accessor::Control(n) => Ok(self.cr[n as usize]),
            Accessor::Debug(n) => Ok(self.dr[n as usize]),
            Accessor::Flags => Ok(self.flags.eflags() & op.mask()),
        }
    }

    /// Write an operand at its own width
    #[inline]
    pub fn write_operand(&mut self, memory: &mut Memory, op: &Operand, value: u32) -> Result<()> {
        self.write_operand_at(memory, op, 0, value, op.size)
    }

    /// Write `size` bytes of an operand, `extra` bytes past its address
    pub fn write_operand_at(
        &mut self,
        memory: &mut Memory,
        op: &Operand,
        extra: u32,
        value: u32,
        size: u8,
    ) -> Result<()> {
        match op.accessor {
            Accessor::Register(reg) => {
                self.regs.write(reg, value);
                Ok(())
            }
            Accessor::Pointer | Accessor::MemDisplacement => {
                let ea = self.effective_address(op, extra);
                let mode = self.mode();
                self.segs[op.segment.index()].write_segment(memory, ea, value & size_mask(size), size, mode)
            }
            Accessor::Immediate => Err(EmulatorError::Unimplemented("write to an immediate operand")),
            Accessor::Segment(seg) => self.load_segment(memory, seg, value),
            Accessor::Control(n) => self.write_control(memory, n, value),
            Accessor::Debug(n) => {
                self.dr[n as usize] = value;
                Ok(())
            }
            Accessor::Flags => {
                self.write_flags(value, op.size);
                Ok(())
            }
        }
    }
}
