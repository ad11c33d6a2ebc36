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

//! Decoded instructions and their disassembly

use super::operand::{sign_extend, Accessor, Operand};
use super::registers::SegReg;
use crate::core::error::{DecodeError, EmulatorError, Result};
use std::fmt;

/// Instruction mnemonic
///
/// Jcc and SETcc carry their condition code (the low nibble of the opcode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mnemonic {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
    Inc,
    Dec,
    Push,
    Pop,
    Pusha,
    Popa,
    Pushf,
    Popf,
    Jcc(u8),
    Setcc(u8),
    Test,
    Xchg,
    Mov,
    Movzx,
    Movsx,
    Lea,
    Nop,
    Cbw,
    Cwd,
    Call,
    CallFar,
    Jmp,
    JmpFar,
    Ret,
    Retf,
    Leave,
    Int3,
    Int,
    Into,
    Iret,
    Hlt,
    Cmc,
    Clc,
    Stc,
    Cli,
    Sti,
    Cld,
    Std,
    Sahf,
    Lahf,
    Loop,
    Loope,
    Loopne,
    Jcxz,
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shl,
    Shr,
    Sar,
    Not,
    Neg,
    Mul,
    Imul,
    Div,
    Idiv,
    Lds,
    Les,
    Lss,
    Lfs,
    Lgs,
    Sldt,
    Lldt,
    Sgdt,
    Sidt,
    Lgdt,
    Lidt,
    Smsw,
    Lmsw,
    Clts,
}

const CONDITIONS: [&str; 16] = [
    "o", "no", "b", "ae", "e", "ne", "be", "a", "s", "ns", "p", "np", "l", "ge", "le", "g",
];

impl Mnemonic {
    /// String instructions honour REP prefixes
    pub fn is_string(self) -> bool {
        matches!(
            self,
            Mnemonic::Movs | Mnemonic::Cmps | Mnemonic::Stos | Mnemonic::Lods | Mnemonic::Scas
        )
    }

    /// Near branches whose operand is relative to the next instruction
    pub fn is_relative_branch(self) -> bool {
        matches!(
            self,
            Mnemonic::Jcc(_)
                | Mnemonic::Jmp
                | Mnemonic::Call
                | Mnemonic::Loop
                | Mnemonic::Loope
                | Mnemonic::Loopne
                | Mnemonic::Jcxz
        )
    }

    fn name(self) -> &'static str {
        match self {
            Mnemonic::Add => "add",
            Mnemonic::Or => "or",
            Mnemonic::Adc => "adc",
            Mnemonic::Sbb => "sbb",
            Mnemonic::And => "and",
            Mnemonic::Sub => "sub",
            Mnemonic::Xor => "xor",
            Mnemonic::Cmp => "cmp",
            Mnemonic::Inc => "inc",
            Mnemonic::Dec => "dec",
            Mnemonic::Push => "push",
            Mnemonic::Pop => "pop",
            Mnemonic::Pusha => "pusha",
            Mnemonic::Popa => "popa",
            Mnemonic::Pushf => "pushf",
            Mnemonic::Popf => "popf",
            Mnemonic::Jcc(_) => "j",
            Mnemonic::Setcc(_) => "set",
            Mnemonic::Test => "test",
            Mnemonic::Xchg => "xchg",
            Mnemonic::Mov => "mov",
            Mnemonic::Movzx => "movzx",
            Mnemonic::Movsx => "movsx",
            Mnemonic::Lea => "lea",
            Mnemonic::Nop => "nop",
            Mnemonic::Cbw => "cbw",
            Mnemonic::Cwd => "cwd",
            Mnemonic::Call => "call",
            Mnemonic::CallFar => "call far",
            Mnemonic::Jmp => "jmp",
            Mnemonic::JmpFar => "jmp far",
            Mnemonic::Ret => "ret",
            Mnemonic::Retf => "retf",
            Mnemonic::Leave => "leave",
            Mnemonic::Int3 => "int3",
            Mnemonic::Int => "int",
            Mnemonic::Into => "into",
            Mnemonic::Iret => "iret",
            Mnemonic::Hlt => "hlt",
            Mnemonic::Cmc => "cmc",
            Mnemonic::Clc => "clc",
            Mnemonic::Stc => "stc",
            Mnemonic::Cli => "cli",
            Mnemonic::Sti => "sti",
            Mnemonic::Cld => "cld",
            Mnemonic::Std => "std",
            Mnemonic::Sahf => "sahf",
            Mnemonic::Lahf => "lahf",
            Mnemonic::Loop => "loop",
            Mnemonic::Loope => "loope",
            Mnemonic::Loopne => "loopne",
            Mnemonic::Jcxz => "jcxz",
            Mnemonic::Movs => "movs",
            Mnemonic::Cmps => "cmps",
            Mnemonic::Stos => "stos",
            Mnemonic::Lods => "lods",
            Mnemonic::Scas => "scas",
            Mnemonic::Rol => "rol",
            Mnemonic::Ror => "ror",
            Mnemonic::Rcl => "rcl",
            Mnemonic::Rcr => "rcr",
            Mnemonic::Shl => "shl",
            Mnemonic::Shr => "shr",
            Mnemonic::Sar => "sar",
            Mnemonic::Not => "not",
            Mnemonic::Neg => "neg",
            Mnemonic::Mul => "mul",
            Mnemonic::Imul => "imul",
            Mnemonic::Div => "div",
            Mnemonic::Idiv => "idiv",
            Mnemonic::Lds => "lds",
            Mnemonic::Les => "les",
            Mnemonic::Lss => "lss",
            Mnemonic::Lfs => "lfs",
            Mnemonic::Lgs => "lgs",
            Mnemonic::Sldt => "sldt",
            Mnemonic::Lldt => "lldt",
            Mnemonic::Sgdt => "sgdt",
            Mnemonic::Sidt => "sidt",
            Mnemonic::Lgdt => "lgdt",
            Mnemonic::Lidt => "lidt",
            Mnemonic::Smsw => "smsw",
            Mnemonic::Lmsw => "lmsw",
            Mnemonic::Clts => "clts",
        }
    }
}

impl fmt::Display for Mnemonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        match self {
            Mnemonic::Jcc(cc) | Mnemonic::Setcc(cc) => f.write_str(CONDITIONS[(cc & 0xF) as usize]),
            _ => Ok(()),
        }
    }
}

/// REP prefix attached to an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Repeat {
    /// F3: REP, or REPE for CMPS/SCAS
    Rep,
    /// F2: REPNE
    Repne,
}

/// A fully decoded instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub mnemonic: Mnemonic,
    /// Offset of the first byte (EIP when fetched through CS)
    pub offset: u32,
    /// Length in bytes, prefixes included
    pub len: u8,
    pub operands: [Option<Operand>; 3],
    pub repeat: Option<Repeat>,
    /// Effective data segment (override or DS)
    pub segment: SegReg,
    pub address_size32: bool,
    pub operand_size32: bool,
}

impl Instruction {
    /// Operand `n`, or a decode error if the form has fewer operands
    #[inline]
    pub fn operand(&self, n: usize) -> Result<&Operand> {
        self.operands
            .get(n)
            .and_then(Option::as_ref)
            .ok_or(EmulatorError::Decode {
                offset: self.offset,
                reason: DecodeError::MissingOperand(n as u8),
            })
    }

    /// Number of decoded operands
    pub fn operand_count(&self) -> usize {
        self.operands.iter().flatten().count()
    }

    /// Operand size in bytes for forms without explicit operands
    #[inline(always)]
    pub fn operand_bytes(&self) -> u8 {
        if self.operand_size32 {
            4
        } else {
            2
        }
    }

    /// Offset of the following instruction
    #[inline(always)]
    pub fn next_offset(&self) -> u32 {
        self.offset.wrapping_add(self.len as u32)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.repeat {
            Some(Repeat::Rep) if matches!(self.mnemonic, Mnemonic::Cmps | Mnemonic::Scas) => {
                f.write_str("repe ")?
            }
            Some(Repeat::Rep) => f.write_str("rep ")?,
            Some(Repeat::Repne) => f.write_str("repne ")?,
            None => {}
        }

        match self.mnemonic {
            Mnemonic::Cbw if self.operand_size32 => return f.write_str("cwde"),
            Mnemonic::Cwd if self.operand_size32 => return f.write_str("cdq"),
            Mnemonic::Iret if self.operand_size32 => return f.write_str("iretd"),
            Mnemonic::Jcxz if self.address_size32 => f.write_str("jecxz")?,
            m if m.is_string() => {
                let size = self.operands[0].map(|op| op.size).unwrap_or(1);
                let suffix = match size {
                    1 => "b",
                    2 => "w",
                    _ => "d",
                };
                return write!(f, "{}{}", m, suffix);
            }
            m => write!(f, "{}", m)?,
        }

        // Far direct transfers print as selector:offset
        if matches!(self.mnemonic, Mnemonic::JmpFar | Mnemonic::CallFar) && self.operand_count() == 2 {
            if let (Some(off), Some(sel)) = (self.operands[0], self.operands[1]) {
                return write!(f, " 0x{:04X}:0x{:X}", sel.immediate_value(), off.immediate_value());
            }
        }

        for (i, op) in self.operands.iter().flatten().enumerate() {
            f.write_str(if i == 0 { " " } else { ", " })?;
            if self.mnemonic.is_relative_branch() && op.accessor == Accessor::Immediate {
                let rel = op.immediate.map(|imm| sign_extend(imm.value, imm.size, 4)).unwrap_or(0);
                let mut target = self.next_offset().wrapping_add(rel);
                if !self.operand_size32 {
                    target &= 0xFFFF;
                }
                write!(f, "0x{:X}", target)?;
            } else {
                write!(f, "{}", op)?;
            }
        }
        Ok(())
    }
}
