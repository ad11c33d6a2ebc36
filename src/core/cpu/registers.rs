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

//! Register file
//!
//! The eight general registers are stored as 32-bit values. 8- and 16-bit
//! views are resolved through `RegisterRef`, which the decoder builds from
//! a ModR/M register index and an operand size.

use serde::{Deserialize, Serialize};
use std::fmt;

/// General-purpose register, in x86 encoding order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Register {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Register {
    pub const ALL: [Register; 8] = [
        Register::Eax,
        Register::Ecx,
        Register::Edx,
        Register::Ebx,
        Register::Esp,
        Register::Ebp,
        Register::Esi,
        Register::Edi,
    ];

    /// Register for a 3-bit encoding (higher bits ignored)
    #[inline(always)]
    pub fn from_index(index: u8) -> Self {
        Self::ALL[(index & 7) as usize]
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Which part of a 32-bit register an operand refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterPart {
    /// AL, CL, DL, BL
    Low8,
    /// AH, CH, DH, BH
    High8,
    Word,
    Dword,
}

/// A sized view of a general register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterRef {
    pub reg: Register,
    pub part: RegisterPart,
}

impl RegisterRef {
    /// Resolve a register encoding at an operand size
    ///
    /// For byte operands, encodings 4-7 name the high bytes of the first
    /// four registers (AH, CH, DH, BH).
    ///
    /// # Example
    ///
    /// ```
    /// use pcx::core::cpu::registers::{Register, RegisterPart, RegisterRef};
    ///
    /// let bh = RegisterRef::from_encoding(7, 1);
    /// assert_eq!(bh.reg, Register::Ebx);
    /// assert_eq!(bh.part, RegisterPart::High8);
    /// assert_eq!(RegisterRef::from_encoding(3, 2).to_string(), "bx");
    /// ```
    #[inline]
    pub fn from_encoding(index: u8, size: u8) -> Self {
        let index = index & 7;
        match size {
            1 if index < 4 => Self {
                reg: Register::from_index(index),
                part: RegisterPart::Low8,
            },
            1 => Self {
                reg: Register::from_index(index - 4),
                part: RegisterPart::High8,
            },
            2 => Self::word(Register::from_index(index)),
            _ => Self::dword(Register::from_index(index)),
        }
    }

    pub fn word(reg: Register) -> Self {
        Self {
            reg,
            part: RegisterPart::Word,
        }
    }

    pub fn dword(reg: Register) -> Self {
        Self {
            reg,
            part: RegisterPart::Dword,
        }
    }

    /// 16- or 32-bit view of `reg`
    pub fn sized(reg: Register, size32: bool) -> Self {
        if size32 {
            Self::dword(reg)
        } else {
            Self::word(reg)
        }
    }

    /// Width in bytes
    pub fn size(self) -> u8 {
        match self.part {
            RegisterPart::Low8 | RegisterPart::High8 => 1,
            RegisterPart::Word => 2,
            RegisterPart::Dword => 4,
        }
    }
}

impl fmt::Display for RegisterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const BYTE_LOW: [&str; 4] = ["al", "cl", "dl", "bl"];
        const BYTE_HIGH: [&str; 4] = ["ah", "ch", "dh", "bh"];
        const WORD: [&str; 8] = ["ax", "cx", "dx", "bx", "sp", "bp", "si", "di"];

        let i = self.reg.index();
        match self.part {
            RegisterPart::Low8 => f.write_str(BYTE_LOW[i & 3]),
            RegisterPart::High8 => f.write_str(BYTE_HIGH[i & 3]),
            RegisterPart::Word => f.write_str(WORD[i]),
            RegisterPart::Dword => write!(f, "e{}", WORD[i]),
        }
    }
}

/// Segment register, in x86 encoding order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub const ALL: [SegReg; 6] = [
        SegReg::Es,
        SegReg::Cs,
        SegReg::Ss,
        SegReg::Ds,
        SegReg::Fs,
        SegReg::Gs,
    ];

    /// Segment register for a 3-bit Reg field; 6 and 7 are reserved
    #[inline]
    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for SegReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 6] = ["es", "cs", "ss", "ds", "fs", "gs"];
        f.write_str(NAMES[self.index()])
    }
}

/// The eight general registers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneralRegisters {
    regs: [u32; 8],
}

impl GeneralRegisters {
    /// Full 32-bit value
    #[inline(always)]
    pub fn get(&self, reg: Register) -> u32 {
        self.regs[reg.index()]
    }

    /// Replace the full 32-bit value
    #[inline(always)]
    pub fn set(&mut self, reg: Register, value: u32) {
        self.regs[reg.index()] = value;
    }

    /// Read a sized view, zero-extended
    #[inline]
    pub fn read(&self, r: RegisterRef) -> u32 {
        let full = self.regs[r.reg.index()];
        match r.part {
            RegisterPart::Low8 => full & 0xFF,
            RegisterPart::High8 => (full >> 8) & 0xFF,
            RegisterPart::Word => full & 0xFFFF,
            RegisterPart::Dword => full,
        }
    }

    /// Write a sized view, preserving the other bits
    #[inline]
    pub fn write(&mut self, r: RegisterRef, value: u32) {
        let full = &mut self.regs[r.reg.index()];
        *full = match r.part {
            RegisterPart::Low8 => (*full & !0xFF) | (value & 0xFF),
            RegisterPart::High8 => (*full & !0xFF00) | ((value & 0xFF) << 8),
            RegisterPart::Word => (*full & !0xFFFF) | (value & 0xFFFF),
            RegisterPart::Dword => value,
        };
    }

    /// Raw values in encoding order
    pub fn as_array(&self) -> [u32; 8] {
        self.regs
    }

    /// Inverse of `as_array`
    pub fn from_array(regs: [u32; 8]) -> Self {
        Self { regs }
    }
}
