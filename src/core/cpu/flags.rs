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

//! Lazy condition-flag evaluation
//!
//! Arithmetic instructions do not compute EFLAGS eagerly. They record the
//! operation, its operands and its result in a snapshot and mark the flags
//! the operation defines as dirty. A flag is only computed when something
//! reads it, and the computed value is cached until the next `record`.
//!
//! # Example
//!
//! ```
//! use pcx::core::cpu::flags::{Flag, FlagOp, LazyFlagRegister};
//!
//! let mut flags = LazyFlagRegister::new();
//! // 0xFF + 0x01 as a byte add
//! flags.record(FlagOp::Add, 0xFF, 0x01, 0x100, 1);
//!
//! assert!(flags.is_dirty(Flag::Cf));
//! assert_eq!(flags.get(Flag::Cf), 1);
//! assert_eq!(flags.get(Flag::Zf), 1);
//! assert!(!flags.is_dirty(Flag::Cf));
//! ```

use bitflags::bitflags;

bitflags! {
    /// EFLAGS register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Eflags: u32 {
        const CF = 1 << 0;
        /// Always reads as 1
        const RESERVED_1 = 1 << 1;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
        const IOPL = 3 << 12;
        const NT = 1 << 14;
        const RF = 1 << 16;
        const VM = 1 << 17;
        const AC = 1 << 18;
        const ID = 1 << 21;
    }
}

impl Eflags {
    /// Flags that may be evaluated lazily
    pub const LAZY: Eflags = Eflags::CF
        .union(Eflags::PF)
        .union(Eflags::AF)
        .union(Eflags::ZF)
        .union(Eflags::SF)
        .union(Eflags::OF);

    /// Arithmetic status flags without CF (what INC/DEC define)
    const NO_CARRY: Eflags = Eflags::LAZY.difference(Eflags::CF);

    /// Status flags computed from the result alone
    const RESULT: Eflags = Eflags::PF.union(Eflags::ZF).union(Eflags::SF);
}

/// A single named flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    Cf,
    Pf,
    Af,
    Zf,
    Sf,
    Tf,
    If,
    Df,
    Of,
}

impl Flag {
    /// The lazily evaluated flags, in EFLAGS bit order
    pub const LAZY: [Flag; 6] = [Flag::Cf, Flag::Pf, Flag::Af, Flag::Zf, Flag::Sf, Flag::Of];

    /// Bit of this flag in EFLAGS
    #[inline(always)]
    pub fn bit(self) -> Eflags {
        match self {
            Flag::Cf => Eflags::CF,
            Flag::Pf => Eflags::PF,
            Flag::Af => Eflags::AF,
            Flag::Zf => Eflags::ZF,
            Flag::Sf => Eflags::SF,
            Flag::Tf => Eflags::TF,
            Flag::If => Eflags::IF,
            Flag::Df => Eflags::DF,
            Flag::Of => Eflags::OF,
        }
    }
}

/// Operation whose result is held in the lazy snapshot
///
/// Selects the CF/AF/OF formulas. PF, ZF and SF depend only on the result
/// and are the same for every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlagOp {
    Add,
    Adc,
    Sub,
    Sbb,
    Cmp,
    /// `val1` is the operand, `val2` is 0
    Neg,
    Inc,
    Dec,
    /// AND/OR/XOR/TEST
    #[default]
    Logic,
    /// `val1` is the high half of the product, `val2` is 0
    Mul,
    /// `val1` is the high half, `val2` the sign extension of the low half
    Imul,
    /// Shifts and rotates; CF and OF are stored eagerly by the caller
    Shift,
}

impl FlagOp {
    /// Flags this operation defines
    #[inline(always)]
    pub fn defined(self) -> Eflags {
        match self {
            FlagOp::Inc | FlagOp::Dec => Eflags::NO_CARRY,
            FlagOp::Shift => Eflags::RESULT,
            _ => Eflags::LAZY,
        }
    }
}

/// Operands and result of the last flag-producing operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Snapshot {
    op: FlagOp,
    val1: u32,
    val2: u32,
    res: u32,
    size: u8,
}

impl Snapshot {
    #[inline(always)]
    fn mask(&self) -> u32 {
        size_mask(self.size)
    }

    #[inline(always)]
    fn sign(&self) -> u32 {
        1u32 << (self.size as u32 * 8 - 1)
    }

    /// Incoming carry/borrow of ADC/SBB, recovered from the result
    #[inline(always)]
    fn carry_in(&self) -> bool {
        let plain = match self.op {
            FlagOp::Adc => self.val1.wrapping_add(self.val2),
            FlagOp::Sbb => self.val1.wrapping_sub(self.val2),
            _ => return false,
        };
        plain & self.mask() != self.res
    }

    fn compute(&self, flag: Flag) -> bool {
        let (v1, v2, res) = (self.val1, self.val2, self.res);
        let sign = self.sign();
        match flag {
            Flag::Cf => match self.op {
                FlagOp::Add => res < v1,
                FlagOp::Adc => {
                    if self.carry_in() {
                        res <= v1
                    } else {
                        res < v1
                    }
                }
                FlagOp::Sub | FlagOp::Cmp => v1 < v2,
                FlagOp::Sbb => {
                    if self.carry_in() {
                        v1 <= v2
                    } else {
                        v1 < v2
                    }
                }
                FlagOp::Neg => v1 != 0,
                FlagOp::Mul | FlagOp::Imul => v1 != v2,
                FlagOp::Inc | FlagOp::Dec | FlagOp::Logic | FlagOp::Shift => false,
            },
            Flag::Af => match self.op {
                FlagOp::Add
                | FlagOp::Adc
                | FlagOp::Sub
                | FlagOp::Sbb
                | FlagOp::Cmp
                | FlagOp::Neg => (v1 ^ v2 ^ res) & 0x10 != 0,
                FlagOp::Inc => res & 0xF == 0,
                FlagOp::Dec => res & 0xF == 0xF,
                FlagOp::Logic | FlagOp::Mul | FlagOp::Imul | FlagOp::Shift => false,
            },
            Flag::Of => match self.op {
                FlagOp::Add | FlagOp::Adc => (v1 ^ res) & (v2 ^ res) & sign != 0,
                FlagOp::Sub | FlagOp::Sbb | FlagOp::Cmp => (v1 ^ v2) & (v1 ^ res) & sign != 0,
                FlagOp::Neg | FlagOp::Inc => res == sign,
                FlagOp::Dec => res == sign - 1,
                FlagOp::Mul | FlagOp::Imul => v1 != v2,
                FlagOp::Logic | FlagOp::Shift => false,
            },
            Flag::Pf => parity(res as u8),
            Flag::Zf => res & self.mask() == 0,
            Flag::Sf => res & sign != 0,
            Flag::Tf | Flag::If | Flag::Df => false,
        }
    }
}

/// EFLAGS with lazily evaluated status flags
///
/// Each of CF, PF, AF, ZF, SF and OF is either stored (clean) or pending
/// computation from the last-result snapshot (dirty). Control flags are
/// always stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LazyFlagRegister {
    /// Stored flag values; lazy bits are only meaningful while clean
    value: Eflags,
    /// Lazy flags pending computation
    dirty: Eflags,
    last: Snapshot,
}

impl LazyFlagRegister {
    /// EFLAGS after reset: only the reserved bit set
    pub fn new() -> Self {
        Self {
            value: Eflags::RESERVED_1,
            dirty: Eflags::empty(),
            last: Snapshot {
                size: 4,
                ..Snapshot::default()
            },
        }
    }

    /// Read a flag as 0 or 1, computing it first if dirty
    #[inline]
    pub fn get(&mut self, flag: Flag) -> u8 {
        let bit = flag.bit();
        if self.dirty.contains(bit) {
            let value = self.last.compute(flag);
            self.value.set(bit, value);
            self.dirty.remove(bit);
        }
        self.value.contains(bit) as u8
    }

    /// Read a flag as a bool
    #[inline(always)]
    pub fn test(&mut self, flag: Flag) -> bool {
        self.get(flag) != 0
    }

    /// Whether the flag still needs computing
    pub fn is_dirty(&self, flag: Flag) -> bool {
        self.dirty.contains(flag.bit())
    }

    /// Store 1
    #[inline]
    pub fn set(&mut self, flag: Flag) {
        self.set_bin(flag, true);
    }

    /// Store 0
    #[inline]
    pub fn clear(&mut self, flag: Flag) {
        self.set_bin(flag, false);
    }

    /// Store a definite value
    #[inline]
    pub fn set_bin(&mut self, flag: Flag, value: bool) {
        let bit = flag.bit();
        self.value.set(bit, value);
        self.dirty.remove(bit);
    }

    /// Record a flag-producing operation
    ///
    /// Flags the operation does not define keep their current values: any
    /// that are still dirty are computed from the previous snapshot before it
    /// is replaced. Values are truncated to `size` bytes.
    ///
    /// # Arguments
    ///
    /// * `op` - Operation selecting the CF/AF/OF formulas
    /// * `val1` - First operand (destination)
    /// * `val2` - Second operand (source)
    /// * `res` - Result, possibly with a carry above the operand width
    /// * `size` - Operand size in bytes (1, 2 or 4)
    #[inline]
    pub fn record(&mut self, op: FlagOp, val1: u32, val2: u32, res: u32, size: u8) {
        let defined = op.defined();
        let stale = self.dirty.difference(defined);
        if !stale.is_empty() {
            self.materialize(stale);
        }

        let mask = size_mask(size);
        self.last = Snapshot {
            op,
            val1: val1 & mask,
            val2: val2 & mask,
            res: res & mask,
            size,
        };
        self.dirty = defined;
    }

    /// Full EFLAGS value with every lazy flag computed
    pub fn eflags(&self) -> u32 {
        let mut value = self.value;
        for flag in Flag::LAZY {
            if self.dirty.contains(flag.bit()) {
                value.set(flag.bit(), self.last.compute(flag));
            }
        }
        (value | Eflags::RESERVED_1).bits()
    }

    /// Replace EFLAGS with definite values (POPF, IRET, state restore)
    ///
    /// Every lazy bit is stored as given and the dirty mask is cleared. This
    /// reads back the same as marking the lazy bits dirty against a snapshot
    /// that recomputes them to `value`, without needing such a snapshot.
    pub fn set_eflags(&mut self, value: u32) {
        self.value = Eflags::from_bits_truncate(value) | Eflags::RESERVED_1;
        self.dirty = Eflags::empty();
    }

    /// Test a non-lazy control bit such as IOPL or VM
    pub fn contains(&self, bits: Eflags) -> bool {
        debug_assert!(!bits.intersects(Eflags::LAZY));
        self.value.contains(bits)
    }

    /// Current I/O privilege level
    pub fn iopl(&self) -> u8 {
        ((self.value.bits() & Eflags::IOPL.bits()) >> 12) as u8
    }

    /// Evaluate a Jcc/SETcc condition code (low 4 bits of the opcode)
    pub fn condition(&mut self, cc: u8) -> bool {
        let result = match cc >> 1 {
            0 => self.test(Flag::Of),
            1 => self.test(Flag::Cf),
            2 => self.test(Flag::Zf),
            3 => self.test(Flag::Cf) || self.test(Flag::Zf),
            4 => self.test(Flag::Sf),
            5 => self.test(Flag::Pf),
            6 => self.test(Flag::Sf) != self.test(Flag::Of),
            _ => self.test(Flag::Zf) || (self.test(Flag::Sf) != self.test(Flag::Of)),
        };
        result ^ (cc & 1 != 0)
    }

    fn materialize(&mut self, flags: Eflags) {
        for flag in Flag::LAZY {
            if flags.contains(flag.bit()) {
                self.value.set(flag.bit(), self.last.compute(flag));
            }
        }
        self.dirty.remove(flags);
    }
}

impl Default for LazyFlagRegister {
    fn default() -> Self {
        Self::new()
    }
}

/// Mask covering `size` bytes
#[inline(always)]
pub fn size_mask(size: u8) -> u32 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}

/// Even parity of a byte (PF)
///
/// # Example
///
/// ```
/// use pcx::core::cpu::flags::parity;
///
/// assert!(parity(0x0F));
/// assert!(!parity(0x07));
/// ```
#[inline(always)]
pub fn parity(value: u8) -> bool {
    value.count_ones() % 2 == 0
}
