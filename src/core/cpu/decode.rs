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

//! x86 instruction decoder
//!
//! Decoding is table driven. Each opcode maps to an `Entry`: either a direct
//! form (mnemonic plus operand attributes) or an extension group selected by
//! the Reg field of the ModR/M byte. Operand attributes use the usual
//! method/type notation (`Ev`, `Gb`, `Iz`, ...).
//!
//! # Example
//!
//! ```
//! use pcx::core::cpu::decode::decode;
//! use pcx::core::cpu::instruction::Mnemonic;
//!
//! let bytes: &[u8] = &[0x89, 0xC3];
//! let insn = decode(&mut &bytes[..], 0, false, false).unwrap();
//! assert_eq!(insn.mnemonic, Mnemonic::Mov);
//! assert_eq!(insn.len, 2);
//! assert_eq!(insn.to_string(), "mov bx, ax");
//! ```

use super::instruction::{Instruction, Mnemonic, Repeat};
use super::operand::{Accessor, Encoded, Operand};
use super::registers::{Register, RegisterRef, SegReg};
use crate::core::error::{DecodeError, EmulatorError, Result};

/// Architectural limit on instruction length
pub const MAX_INSTRUCTION_LEN: u32 = 15;

/// Byte source for the decoder
///
/// Offsets are absolute: the decoder passes the offset of every byte it
/// wants rather than relying on a cursor.
pub trait CodeReader {
    fn read_u8(&mut self, offset: u32) -> Result<u8>;

    fn read_u16(&mut self, offset: u32) -> Result<u16> {
        let lo = self.read_u8(offset)? as u16;
        let hi = self.read_u8(offset.wrapping_add(1))? as u16;
        Ok(lo | (hi << 8))
    }

    fn read_u32(&mut self, offset: u32) -> Result<u32> {
        let lo = self.read_u16(offset)? as u32;
        let hi = self.read_u16(offset.wrapping_add(2))? as u32;
        Ok(lo | (hi << 16))
    }
}

impl CodeReader for &[u8] {
    fn read_u8(&mut self, offset: u32) -> Result<u8> {
        self.get(offset as usize)
            .copied()
            .ok_or(EmulatorError::OutOfBounds { address: offset })
    }
}

/// Operand addressing method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Far pointer offset; the selector follows as a separate `Iw`
    A,
    /// Control register in Reg
    C,
    /// Debug register in Reg
    D,
    /// Register or memory from ModR/M
    E,
    /// EFLAGS
    F,
    /// General register in Reg
    G,
    /// Immediate
    I,
    /// Relative branch offset
    J,
    /// Memory only from ModR/M
    M,
    /// Direct offset (moffs), no ModR/M
    O,
    /// MMX register in Reg
    P,
    /// General register only from ModR/M
    R,
    /// Segment register in Reg
    S,
    /// SIMD register in Reg
    V,
    /// DS:(E)SI string source
    X,
    /// ES:(E)DI string destination
    Y,
}

/// Operand type code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCode {
    /// Byte
    B,
    /// Word
    W,
    /// Doubleword
    D,
    /// Word or doubleword by operand size
    V,
    /// Word, or doubleword for 32-bit operands (immediates)
    Z,
    /// 32- or 48-bit far pointer
    P,
    /// 6-byte pseudo-descriptor (LGDT/SGDT)
    S,
    /// Selector store: a word in memory, a full operand-size register
    Sel,
}

/// Literal register named by an opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegLit {
    /// 8-bit register by encoding (AL..BH)
    Byte(u8),
    /// eAX..eDI at the current operand size
    Full(u8),
    Seg(SegReg),
}

/// One operand slot of a table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandAttr {
    Reg(RegLit),
    Const(u32),
    Addr(Method, TypeCode),
}

impl OperandAttr {
    fn needs_modrm(self) -> bool {
        matches!(
            self,
            OperandAttr::Addr(
                Method::C
                    | Method::D
                    | Method::E
                    | Method::G
                    | Method::M
                    | Method::P
                    | Method::R
                    | Method::S
                    | Method::V,
                _
            )
        )
    }
}

/// Extension groups, indexed by ModR/M Reg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Group {
    /// ADD..CMP with the given operands (0x80-0x83)
    Arith(&'static [OperandAttr]),
    /// ROL..SAR with the given operands (0xC0, 0xC1, 0xD0-0xD3)
    Shift(&'static [OperandAttr]),
    /// TEST/NOT/NEG/MUL/IMUL/DIV/IDIV (0xF6, 0xF7)
    Unary { byte: bool },
    /// INC/DEC Eb (0xFE)
    IncDec,
    /// INC/DEC/CALL/JMP/PUSH Ev (0xFF)
    Indirect,
    /// POP Ev (0x8F)
    PopEv,
    /// MOV E, I (0xC6, 0xC7)
    MovImm(&'static [OperandAttr]),
    /// SLDT/LLDT (0x0F 0x00)
    Descriptor,
    /// SGDT/SIDT/LGDT/LIDT/SMSW/LMSW (0x0F 0x01)
    System,
}

/// Decoding table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Invalid,
    Op(Mnemonic, &'static [OperandAttr]),
    Group(Group),
    /// MMX/SSE opcode space; decoding its operands fails
    Vector(&'static [OperandAttr]),
    /// Recognised but outside the emulated core
    Unsupported(&'static str),
}

const fn addr(method: Method, ty: TypeCode) -> OperandAttr {
    OperandAttr::Addr(method, ty)
}

use Method as M;
use TypeCode as T;

const NONE: &[OperandAttr] = &[];
const EB_GB: &[OperandAttr] = &[addr(M::E, T::B), addr(M::G, T::B)];
const EV_GV: &[OperandAttr] = &[addr(M::E, T::V), addr(M::G, T::V)];
const GB_EB: &[OperandAttr] = &[addr(M::G, T::B), addr(M::E, T::B)];
const GV_EV: &[OperandAttr] = &[addr(M::G, T::V), addr(M::E, T::V)];
const AL_IB: &[OperandAttr] = &[OperandAttr::Reg(RegLit::Byte(0)), addr(M::I, T::B)];
const EAX_IZ: &[OperandAttr] = &[OperandAttr::Reg(RegLit::Full(0)), addr(M::I, T::Z)];
const EB_IB: &[OperandAttr] = &[addr(M::E, T::B), addr(M::I, T::B)];
const EV_IZ: &[OperandAttr] = &[addr(M::E, T::V), addr(M::I, T::Z)];
const EV_IB: &[OperandAttr] = &[addr(M::E, T::V), addr(M::I, T::B)];
const EB: &[OperandAttr] = &[addr(M::E, T::B)];
const EV: &[OperandAttr] = &[addr(M::E, T::V)];
const EW: &[OperandAttr] = &[addr(M::E, T::W)];
const MP: &[OperandAttr] = &[addr(M::M, T::P)];
const MS: &[OperandAttr] = &[addr(M::M, T::S)];
const GV_M: &[OperandAttr] = &[addr(M::G, T::V), addr(M::M, T::V)];
const GV_MP: &[OperandAttr] = &[addr(M::G, T::V), addr(M::M, T::P)];
const GV_EB: &[OperandAttr] = &[addr(M::G, T::V), addr(M::E, T::B)];
const GV_EW: &[OperandAttr] = &[addr(M::G, T::V), addr(M::E, T::W)];
const GV_EV_IZ: &[OperandAttr] = &[addr(M::G, T::V), addr(M::E, T::V), addr(M::I, T::Z)];
const GV_EV_IB: &[OperandAttr] = &[addr(M::G, T::V), addr(M::E, T::V), addr(M::I, T::B)];
const ESEL_SW: &[OperandAttr] = &[addr(M::E, T::Sel), addr(M::S, T::W)];
const SW_EW: &[OperandAttr] = &[addr(M::S, T::W), addr(M::E, T::W)];
const AL_OB: &[OperandAttr] = &[OperandAttr::Reg(RegLit::Byte(0)), addr(M::O, T::B)];
const EAX_OV: &[OperandAttr] = &[OperandAttr::Reg(RegLit::Full(0)), addr(M::O, T::V)];
const OB_AL: &[OperandAttr] = &[addr(M::O, T::B), OperandAttr::Reg(RegLit::Byte(0))];
const OV_EAX: &[OperandAttr] = &[addr(M::O, T::V), OperandAttr::Reg(RegLit::Full(0))];
const YB_XB: &[OperandAttr] = &[addr(M::Y, T::B), addr(M::X, T::B)];
const YV_XV: &[OperandAttr] = &[addr(M::Y, T::V), addr(M::X, T::V)];
const XB_YB: &[OperandAttr] = &[addr(M::X, T::B), addr(M::Y, T::B)];
const XV_YV: &[OperandAttr] = &[addr(M::X, T::V), addr(M::Y, T::V)];
const YB_AL: &[OperandAttr] = &[addr(M::Y, T::B), OperandAttr::Reg(RegLit::Byte(0))];
const YV_EAX: &[OperandAttr] = &[addr(M::Y, T::V), OperandAttr::Reg(RegLit::Full(0))];
const AL_XB: &[OperandAttr] = &[OperandAttr::Reg(RegLit::Byte(0)), addr(M::X, T::B)];
const EAX_XV: &[OperandAttr] = &[OperandAttr::Reg(RegLit::Full(0)), addr(M::X, T::V)];
const AL_YB: &[OperandAttr] = &[OperandAttr::Reg(RegLit::Byte(0)), addr(M::Y, T::B)];
const EAX_YV: &[OperandAttr] = &[OperandAttr::Reg(RegLit::Full(0)), addr(M::Y, T::V)];
const JB: &[OperandAttr] = &[addr(M::J, T::B)];
const JZ: &[OperandAttr] = &[addr(M::J, T::Z)];
const IB: &[OperandAttr] = &[addr(M::I, T::B)];
const IW: &[OperandAttr] = &[addr(M::I, T::W)];
const IZ: &[OperandAttr] = &[addr(M::I, T::Z)];
const AP: &[OperandAttr] = &[addr(M::A, T::Z), addr(M::I, T::W)];
const FV: &[OperandAttr] = &[addr(M::F, T::V)];
const INT3: &[OperandAttr] = &[OperandAttr::Const(3)];
const EB_1: &[OperandAttr] = &[addr(M::E, T::B), OperandAttr::Const(1)];
const EV_1: &[OperandAttr] = &[addr(M::E, T::V), OperandAttr::Const(1)];
const EB_CL: &[OperandAttr] = &[addr(M::E, T::B), OperandAttr::Reg(RegLit::Byte(1))];
const EV_CL: &[OperandAttr] = &[addr(M::E, T::V), OperandAttr::Reg(RegLit::Byte(1))];
const RD_CD: &[OperandAttr] = &[addr(M::R, T::D), addr(M::C, T::D)];
const CD_RD: &[OperandAttr] = &[addr(M::C, T::D), addr(M::R, T::D)];
const RD_DD: &[OperandAttr] = &[addr(M::R, T::D), addr(M::D, T::D)];
const DD_RD: &[OperandAttr] = &[addr(M::D, T::D), addr(M::R, T::D)];
const PQ_EQ: &[OperandAttr] = &[addr(M::P, T::D), addr(M::E, T::D)];
const VX_EX: &[OperandAttr] = &[addr(M::V, T::D), addr(M::E, T::D)];

const fn seg(s: SegReg) -> [OperandAttr; 1] {
    [OperandAttr::Reg(RegLit::Seg(s))]
}

const SEG_ES: &[OperandAttr] = &seg(SegReg::Es);
const SEG_CS: &[OperandAttr] = &seg(SegReg::Cs);
const SEG_SS: &[OperandAttr] = &seg(SegReg::Ss);
const SEG_DS: &[OperandAttr] = &seg(SegReg::Ds);
const SEG_FS: &[OperandAttr] = &seg(SegReg::Fs);
const SEG_GS: &[OperandAttr] = &seg(SegReg::Gs);

const fn full_registers() -> [[OperandAttr; 1]; 8] {
    let mut table = [[OperandAttr::Const(0)]; 8];
    let mut i = 0;
    while i < 8 {
        table[i] = [OperandAttr::Reg(RegLit::Full(i as u8))];
        i += 1;
    }
    table
}

const fn xchg_accumulator() -> [[OperandAttr; 2]; 8] {
    let mut table = [[OperandAttr::Const(0); 2]; 8];
    let mut i = 0;
    while i < 8 {
        table[i] = [
            OperandAttr::Reg(RegLit::Full(0)),
            OperandAttr::Reg(RegLit::Full(i as u8)),
        ];
        i += 1;
    }
    table
}

const fn mov_byte_immediate() -> [[OperandAttr; 2]; 8] {
    let mut table = [[OperandAttr::Const(0); 2]; 8];
    let mut i = 0;
    while i < 8 {
        table[i] = [OperandAttr::Reg(RegLit::Byte(i as u8)), addr(M::I, T::B)];
        i += 1;
    }
    table
}

const fn mov_full_immediate() -> [[OperandAttr; 2]; 8] {
    let mut table = [[OperandAttr::Const(0); 2]; 8];
    let mut i = 0;
    while i < 8 {
        table[i] = [OperandAttr::Reg(RegLit::Full(i as u8)), addr(M::I, T::V)];
        i += 1;
    }
    table
}

static FULL_REG: [[OperandAttr; 1]; 8] = full_registers();
static XCHG_EAX: [[OperandAttr; 2]; 8] = xchg_accumulator();
static MOV_R8_IB: [[OperandAttr; 2]; 8] = mov_byte_immediate();
static MOV_RV_IV: [[OperandAttr; 2]; 8] = mov_full_immediate();

const ARITH: [Mnemonic; 8] = [
    Mnemonic::Add,
    Mnemonic::Or,
    Mnemonic::Adc,
    Mnemonic::Sbb,
    Mnemonic::And,
    Mnemonic::Sub,
    Mnemonic::Xor,
    Mnemonic::Cmp,
];

const SHIFT: [Mnemonic; 8] = [
    Mnemonic::Rol,
    Mnemonic::Ror,
    Mnemonic::Rcl,
    Mnemonic::Rcr,
    Mnemonic::Shl,
    Mnemonic::Shr,
    Mnemonic::Shl,
    Mnemonic::Sar,
];

/// One-byte opcode map
fn primary(opcode: u8) -> Entry {
    let r = (opcode & 7) as usize;
    match opcode {
        // ADD/OR/ADC/SBB/AND/SUB/XOR/CMP in their six classic forms
        0x00..=0x3F if opcode & 7 < 6 => {
            let attrs = match opcode & 7 {
                0 => EB_GB,
                1 => EV_GV,
                2 => GB_EB,
                3 => GV_EV,
                4 => AL_IB,
                _ => EAX_IZ,
            };
            Entry::Op(ARITH[(opcode >> 3) as usize], attrs)
        }
        0x06 => Entry::Op(Mnemonic::Push, SEG_ES),
        0x07 => Entry::Op(Mnemonic::Pop, SEG_ES),
        0x0E => Entry::Op(Mnemonic::Push, SEG_CS),
        0x16 => Entry::Op(Mnemonic::Push, SEG_SS),
        0x17 => Entry::Op(Mnemonic::Pop, SEG_SS),
        0x1E => Entry::Op(Mnemonic::Push, SEG_DS),
        0x1F => Entry::Op(Mnemonic::Pop, SEG_DS),
        0x40..=0x47 => Entry::Op(Mnemonic::Inc, &FULL_REG[r]),
        0x48..=0x4F => Entry::Op(Mnemonic::Dec, &FULL_REG[r]),
        0x50..=0x57 => Entry::Op(Mnemonic::Push, &FULL_REG[r]),
        0x58..=0x5F => Entry::Op(Mnemonic::Pop, &FULL_REG[r]),
        0x60 => Entry::Op(Mnemonic::Pusha, NONE),
        0x61 => Entry::Op(Mnemonic::Popa, NONE),
        0x68 => Entry::Op(Mnemonic::Push, IZ),
        0x69 => Entry::Op(Mnemonic::Imul, GV_EV_IZ),
        0x6A => Entry::Op(Mnemonic::Push, IB),
        0x6B => Entry::Op(Mnemonic::Imul, GV_EV_IB),
        0x6C..=0x6F => Entry::Unsupported("port I/O"),
        0x70..=0x7F => Entry::Op(Mnemonic::Jcc(opcode & 0xF), JB),
        0x80 | 0x82 => Entry::Group(Group::Arith(EB_IB)),
        0x81 => Entry::Group(Group::Arith(EV_IZ)),
        0x83 => Entry::Group(Group::Arith(EV_IB)),
        0x84 => Entry::Op(Mnemonic::Test, EB_GB),
        0x85 => Entry::Op(Mnemonic::Test, EV_GV),
        0x86 => Entry::Op(Mnemonic::Xchg, EB_GB),
        0x87 => Entry::Op(Mnemonic::Xchg, EV_GV),
        0x88 => Entry::Op(Mnemonic::Mov, EB_GB),
        0x89 => Entry::Op(Mnemonic::Mov, EV_GV),
        0x8A => Entry::Op(Mnemonic::Mov, GB_EB),
        0x8B => Entry::Op(Mnemonic::Mov, GV_EV),
        0x8C => Entry::Op(Mnemonic::Mov, ESEL_SW),
        0x8D => Entry::Op(Mnemonic::Lea, GV_M),
        0x8E => Entry::Op(Mnemonic::Mov, SW_EW),
        0x8F => Entry::Group(Group::PopEv),
        0x90 => Entry::Op(Mnemonic::Nop, NONE),
        0x91..=0x97 => Entry::Op(Mnemonic::Xchg, &XCHG_EAX[r]),
        0x98 => Entry::Op(Mnemonic::Cbw, NONE),
        0x99 => Entry::Op(Mnemonic::Cwd, NONE),
        0x9A => Entry::Op(Mnemonic::CallFar, AP),
        // FWAIT with no FPU attached
        0x9B => Entry::Op(Mnemonic::Nop, NONE),
        0x9C => Entry::Op(Mnemonic::Pushf, FV),
        0x9D => Entry::Op(Mnemonic::Popf, FV),
        0x9E => Entry::Op(Mnemonic::Sahf, NONE),
        0x9F => Entry::Op(Mnemonic::Lahf, NONE),
        0xA0 => Entry::Op(Mnemonic::Mov, AL_OB),
        0xA1 => Entry::Op(Mnemonic::Mov, EAX_OV),
        0xA2 => Entry::Op(Mnemonic::Mov, OB_AL),
        0xA3 => Entry::Op(Mnemonic::Mov, OV_EAX),
        0xA4 => Entry::Op(Mnemonic::Movs, YB_XB),
        0xA5 => Entry::Op(Mnemonic::Movs, YV_XV),
        0xA6 => Entry::Op(Mnemonic::Cmps, XB_YB),
        0xA7 => Entry::Op(Mnemonic::Cmps, XV_YV),
        0xA8 => Entry::Op(Mnemonic::Test, AL_IB),
        0xA9 => Entry::Op(Mnemonic::Test, EAX_IZ),
        0xAA => Entry::Op(Mnemonic::Stos, YB_AL),
        0xAB => Entry::Op(Mnemonic::Stos, YV_EAX),
        0xAC => Entry::Op(Mnemonic::Lods, AL_XB),
        0xAD => Entry::Op(Mnemonic::Lods, EAX_XV),
        0xAE => Entry::Op(Mnemonic::Scas, AL_YB),
        0xAF => Entry::Op(Mnemonic::Scas, EAX_YV),
        0xB0..=0xB7 => Entry::Op(Mnemonic::Mov, &MOV_R8_IB[r]),
        0xB8..=0xBF => Entry::Op(Mnemonic::Mov, &MOV_RV_IV[r]),
        0xC0 => Entry::Group(Group::Shift(EB_IB)),
        0xC1 => Entry::Group(Group::Shift(EV_IB)),
        0xC2 => Entry::Op(Mnemonic::Ret, IW),
        0xC3 => Entry::Op(Mnemonic::Ret, NONE),
        0xC4 => Entry::Op(Mnemonic::Les, GV_MP),
        0xC5 => Entry::Op(Mnemonic::Lds, GV_MP),
        0xC6 => Entry::Group(Group::MovImm(EB_IB)),
        0xC7 => Entry::Group(Group::MovImm(EV_IZ)),
        0xC9 => Entry::Op(Mnemonic::Leave, NONE),
        0xCA => Entry::Op(Mnemonic::Retf, IW),
        0xCB => Entry::Op(Mnemonic::Retf, NONE),
        0xCC => Entry::Op(Mnemonic::Int3, INT3),
        0xCD => Entry::Op(Mnemonic::Int, IB),
        0xCE => Entry::Op(Mnemonic::Into, NONE),
        0xCF => Entry::Op(Mnemonic::Iret, NONE),
        0xD0 => Entry::Group(Group::Shift(EB_1)),
        0xD1 => Entry::Group(Group::Shift(EV_1)),
        0xD2 => Entry::Group(Group::Shift(EB_CL)),
        0xD3 => Entry::Group(Group::Shift(EV_CL)),
        0xD8..=0xDF => Entry::Unsupported("x87 escape"),
        0xE0 => Entry::Op(Mnemonic::Loopne, JB),
        0xE1 => Entry::Op(Mnemonic::Loope, JB),
        0xE2 => Entry::Op(Mnemonic::Loop, JB),
        0xE3 => Entry::Op(Mnemonic::Jcxz, JB),
        0xE4..=0xE7 | 0xEC..=0xEF => Entry::Unsupported("port I/O"),
        0xE8 => Entry::Op(Mnemonic::Call, JZ),
        0xE9 => Entry::Op(Mnemonic::Jmp, JZ),
        0xEA => Entry::Op(Mnemonic::JmpFar, AP),
        0xEB => Entry::Op(Mnemonic::Jmp, JB),
        0xF4 => Entry::Op(Mnemonic::Hlt, NONE),
        0xF5 => Entry::Op(Mnemonic::Cmc, NONE),
        0xF6 => Entry::Group(Group::Unary { byte: true }),
        0xF7 => Entry::Group(Group::Unary { byte: false }),
        0xF8 => Entry::Op(Mnemonic::Clc, NONE),
        0xF9 => Entry::Op(Mnemonic::Stc, NONE),
        0xFA => Entry::Op(Mnemonic::Cli, NONE),
        0xFB => Entry::Op(Mnemonic::Sti, NONE),
        0xFC => Entry::Op(Mnemonic::Cld, NONE),
        0xFD => Entry::Op(Mnemonic::Std, NONE),
        0xFE => Entry::Group(Group::IncDec),
        0xFF => Entry::Group(Group::Indirect),
        _ => Entry::Invalid,
    }
}

/// Two-byte (0x0F-prefixed) opcode map
fn secondary(opcode: u8) -> Entry {
    match opcode {
        0x00 => Entry::Group(Group::Descriptor),
        0x01 => Entry::Group(Group::System),
        0x06 => Entry::Op(Mnemonic::Clts, NONE),
        0x10..=0x17 | 0x28..=0x2F | 0x50..=0x5F => Entry::Vector(VX_EX),
        0x20 => Entry::Op(Mnemonic::Mov, RD_CD),
        0x21 => Entry::Op(Mnemonic::Mov, RD_DD),
        0x22 => Entry::Op(Mnemonic::Mov, CD_RD),
        0x23 => Entry::Op(Mnemonic::Mov, DD_RD),
        0x60..=0x6F | 0x74..=0x76 | 0x7E | 0x7F | 0xD1..=0xFE => Entry::Vector(PQ_EQ),
        0x80..=0x8F => Entry::Op(Mnemonic::Jcc(opcode & 0xF), JZ),
        0x90..=0x9F => Entry::Op(Mnemonic::Setcc(opcode & 0xF), EB),
        0xA0 => Entry::Op(Mnemonic::Push, SEG_FS),
        0xA1 => Entry::Op(Mnemonic::Pop, SEG_FS),
        0xA8 => Entry::Op(Mnemonic::Push, SEG_GS),
        0xA9 => Entry::Op(Mnemonic::Pop, SEG_GS),
        0xAF => Entry::Op(Mnemonic::Imul, GV_EV),
        0xB2 => Entry::Op(Mnemonic::Lss, GV_MP),
        0xB4 => Entry::Op(Mnemonic::Lfs, GV_MP),
        0xB5 => Entry::Op(Mnemonic::Lgs, GV_MP),
        0xB6 => Entry::Op(Mnemonic::Movzx, GV_EB),
        0xB7 => Entry::Op(Mnemonic::Movzx, GV_EW),
        0xBE => Entry::Op(Mnemonic::Movsx, GV_EB),
        0xBF => Entry::Op(Mnemonic::Movsx, GV_EW),
        _ => Entry::Invalid,
    }
}

/// Entry selected by the Reg field within a group
fn group_entry(group: Group, reg: u8) -> Entry {
    let reg = (reg & 7) as usize;
    match group {
        Group::Arith(attrs) => Entry::Op(ARITH[reg], attrs),
        Group::Shift(attrs) => Entry::Op(SHIFT[reg], attrs),
        Group::Unary { byte } => {
            let (single, test) = if byte { (EB, EB_IB) } else { (EV, EV_IZ) };
            match reg {
                0 | 1 => Entry::Op(Mnemonic::Test, test),
                2 => Entry::Op(Mnemonic::Not, single),
                3 => Entry::Op(Mnemonic::Neg, single),
                4 => Entry::Op(Mnemonic::Mul, single),
                5 => Entry::Op(Mnemonic::Imul, single),
                6 => Entry::Op(Mnemonic::Div, single),
                _ => Entry::Op(Mnemonic::Idiv, single),
            }
        }
        Group::IncDec => match reg {
            0 => Entry::Op(Mnemonic::Inc, EB),
            1 => Entry::Op(Mnemonic::Dec, EB),
            _ => Entry::Invalid,
        },
        Group::Indirect => match reg {
            0 => Entry::Op(Mnemonic::Inc, EV),
            1 => Entry::Op(Mnemonic::Dec, EV),
            2 => Entry::Op(Mnemonic::Call, EV),
            3 => Entry::Op(Mnemonic::CallFar, MP),
            4 => Entry::Op(Mnemonic::Jmp, EV),
            5 => Entry::Op(Mnemonic::JmpFar, MP),
            6 => Entry::Op(Mnemonic::Push, EV),
            _ => Entry::Invalid,
        },
        Group::PopEv => match reg {
            0 => Entry::Op(Mnemonic::Pop, EV),
            _ => Entry::Invalid,
        },
        Group::MovImm(attrs) => match reg {
            0 => Entry::Op(Mnemonic::Mov, attrs),
            _ => Entry::Invalid,
        },
        Group::Descriptor => match reg {
            0 => Entry::Op(Mnemonic::Sldt, EW),
            2 => Entry::Op(Mnemonic::Lldt, EW),
            _ => Entry::Invalid,
        },
        Group::System => match reg {
            0 => Entry::Op(Mnemonic::Sgdt, MS),
            1 => Entry::Op(Mnemonic::Sidt, MS),
            2 => Entry::Op(Mnemonic::Lgdt, MS),
            3 => Entry::Op(Mnemonic::Lidt, MS),
            4 => Entry::Op(Mnemonic::Smsw, EW),
            6 => Entry::Op(Mnemonic::Lmsw, EW),
            _ => Entry::Invalid,
        },
    }
}

/// 16-bit ModR/M base and index registers by RM
const EA16: [(Register, Option<Register>); 8] = [
    (Register::Ebx, Some(Register::Esi)),
    (Register::Ebx, Some(Register::Edi)),
    (Register::Ebp, Some(Register::Esi)),
    (Register::Ebp, Some(Register::Edi)),
    (Register::Esi, None),
    (Register::Edi, None),
    (Register::Ebp, None),
    (Register::Ebx, None),
];

/// Default segment by RM for mod == 0 (RM 6 is a bare disp16)
const SEG16_NO_DISP: [SegReg; 8] = [
    SegReg::Ds,
    SegReg::Ds,
    SegReg::Ss,
    SegReg::Ss,
    SegReg::Ds,
    SegReg::Ds,
    SegReg::Ds,
    SegReg::Ds,
];

/// Default segment by RM for mod == 1 or 2
const SEG16_DISP: [SegReg; 8] = [
    SegReg::Ds,
    SegReg::Ds,
    SegReg::Ss,
    SegReg::Ss,
    SegReg::Ds,
    SegReg::Ds,
    SegReg::Ss,
    SegReg::Ds,
];

/// Memory reference described by a ModR/M byte
#[derive(Debug, Clone, Copy)]
struct MemoryRef {
    base: Option<RegisterRef>,
    index: Option<RegisterRef>,
    disp: Option<Encoded>,
    /// Default segment for the addressing form
    segment: SegReg,
}

#[derive(Debug, Clone, Copy)]
struct ModRm {
    md: u8,
    reg: u8,
    rm: u8,
    memory: Option<MemoryRef>,
}

struct Decoder<'r, R: CodeReader + ?Sized> {
    reader: &'r mut R,
    start: u32,
    pos: u32,
    opcode: u8,
    address_size32: bool,
    operand_size32: bool,
    seg_override: Option<SegReg>,
    repeat: Option<Repeat>,
    modrm: Option<ModRm>,
    /// MOV to/from CRn/DRn: the 386 treats every ModR/M as a register form
    register_form: bool,
}

impl<R: CodeReader + ?Sized> Decoder<'_, R> {
    fn error(&self, reason: DecodeError) -> EmulatorError {
        EmulatorError::Decode {
            offset: self.start,
            reason,
        }
    }

    fn check_len(&self, extra: u32) -> Result<()> {
        if self.pos.wrapping_sub(self.start) + extra > MAX_INSTRUCTION_LEN {
            return Err(self.error(DecodeError::TooLong));
        }
        Ok(())
    }

    fn next_u8(&mut self) -> Result<u8> {
        self.check_len(1)?;
        let byte = self.reader.read_u8(self.pos)?;
        self.pos = self.pos.wrapping_add(1);
        Ok(byte)
    }

    /// Read a little-endian value of `size` bytes
    fn next_sized(&mut self, size: u8) -> Result<u32> {
        self.check_len(size as u32)?;
        let value = match size {
            1 => self.reader.read_u8(self.pos)? as u32,
            2 => self.reader.read_u16(self.pos)? as u32,
            _ => self.reader.read_u32(self.pos)?,
        };
        self.pos = self.pos.wrapping_add(size as u32);
        Ok(value)
    }

    /// Consume prefixes, returning the first opcode byte
    fn prefixes(&mut self) -> Result<u8> {
        loop {
            let byte = self.next_u8()?;
            match byte {
                0x26 => self.seg_override = Some(SegReg::Es),
                0x2E => self.seg_override = Some(SegReg::Cs),
                0x36 => self.seg_override = Some(SegReg::Ss),
                0x3E => self.seg_override = Some(SegReg::Ds),
                0x64 => self.seg_override = Some(SegReg::Fs),
                0x65 => self.seg_override = Some(SegReg::Gs),
                0x66 => self.operand_size32 = !self.operand_size32,
                0x67 => self.address_size32 = !self.address_size32,
                0xF0 => {}
                0xF2 => self.repeat = Some(Repeat::Repne),
                0xF3 => self.repeat = Some(Repeat::Rep),
                _ => return Ok(byte),
            }
        }
    }

    fn modrm(&mut self) -> Result<ModRm> {
        if let Some(modrm) = self.modrm {
            return Ok(modrm);
        }

        let byte = self.next_u8()?;
        let md = byte >> 6;
        let reg = (byte >> 3) & 7;
        let rm = byte & 7;
        let memory = match md {
            _ if self.register_form => None,
            3 => None,
            _ if self.address_size32 => Some(self.memory32(md, rm)?),
            _ => Some(self.memory16(md, rm)?),
        };

        let modrm = ModRm { md, reg, rm, memory };
        self.modrm = Some(modrm);
        Ok(modrm)
    }

    fn displacement(&mut self, size: u8) -> Result<Option<Encoded>> {
        let value = self.next_sized(size)?;
        Ok(Some(Encoded { value, size }))
    }

    fn memory16(&mut self, md: u8, rm: u8) -> Result<MemoryRef> {
        if md == 0 && rm == 6 {
            return Ok(MemoryRef {
                base: None,
                index: None,
                disp: self.displacement(2)?,
                segment: SegReg::Ds,
            });
        }

        let (base, index) = EA16[rm as usize];
        let disp = match md {
            1 => self.displacement(1)?,
            2 => self.displacement(2)?,
            _ => None,
        };
        let segment = if md == 0 {
            SEG16_NO_DISP[rm as usize]
        } else {
            SEG16_DISP[rm as usize]
        };

        Ok(MemoryRef {
            base: Some(RegisterRef::word(base)),
            index: index.map(RegisterRef::word),
            disp,
            segment,
        })
    }

    fn memory32(&mut self, md: u8, rm: u8) -> Result<MemoryRef> {
        if rm == 4 {
            return Err(EmulatorError::Unimplemented("SIB addressing"));
        }
        if md == 0 && rm == 5 {
            return Ok(MemoryRef {
                base: None,
                index: None,
                disp: self.displacement(4)?,
                segment: SegReg::Ds,
            });
        }

        let disp = match md {
            1 => self.displacement(1)?,
            2 => self.displacement(4)?,
            _ => None,
        };
        let segment = if rm == 5 { SegReg::Ss } else { SegReg::Ds };

        Ok(MemoryRef {
            base: Some(RegisterRef::dword(Register::from_index(rm))),
            index: None,
            disp,
            segment,
        })
    }

    fn size_of(&self, ty: TypeCode) -> u8 {
        match ty {
            TypeCode::B => 1,
            TypeCode::W => 2,
            TypeCode::D => 4,
            TypeCode::V | TypeCode::Z | TypeCode::Sel => {
                if self.operand_size32 {
                    4
                } else {
                    2
                }
            }
            TypeCode::P => {
                if self.operand_size32 {
                    6
                } else {
                    4
                }
            }
            TypeCode::S => 6,
        }
    }

    fn operand_bytes(&self) -> u8 {
        self.size_of(TypeCode::V)
    }

    fn pointer(&self, memory: MemoryRef, size: u8) -> Operand {
        Operand::pointer(
            memory.base,
            memory.index,
            memory.disp,
            self.seg_override.unwrap_or(memory.segment),
            size,
            self.address_size32,
        )
    }

    fn string_register(&self, reg: Register) -> RegisterRef {
        RegisterRef::sized(reg, self.address_size32)
    }

    /// Decode one operand
    ///
    /// `target` is the width an 8-bit immediate is sign-extended to.
    fn operand(&mut self, attr: OperandAttr, target: Option<u8>) -> Result<Operand> {
        let (method, ty) = match attr {
            OperandAttr::Reg(lit) => {
                return Ok(match lit {
                    RegLit::Byte(i) => Operand::register(RegisterRef::from_encoding(i, 1)),
                    RegLit::Full(i) => Operand::register(RegisterRef::sized(
                        Register::from_index(i),
                        self.operand_size32,
                    )),
                    RegLit::Seg(s) => Operand::segment_register(s),
                })
            }
            OperandAttr::Const(value) => return Ok(Operand::immediate(value, 1, 1)),
            OperandAttr::Addr(method, ty) => (method, ty),
        };

        let size = self.size_of(ty);
        match method {
            Method::C | Method::D => {
                let modrm = self.modrm()?;
                if method == Method::C {
                    if !matches!(modrm.reg, 0 | 2 | 3 | 4) {
                        return Err(self.error(DecodeError::InvalidExtension {
                            opcode: self.opcode,
                            reg: modrm.reg,
                        }));
                    }
                    Ok(Operand::control(modrm.reg))
                } else {
                    Ok(Operand::debug(modrm.reg))
                }
            }
            Method::G => {
                let modrm = self.modrm()?;
                Ok(Operand::register(RegisterRef::from_encoding(modrm.reg, size)))
            }
            Method::S => {
                let modrm = self.modrm()?;
                let seg = SegReg::from_index(modrm.reg).ok_or_else(|| {
                    self.error(DecodeError::InvalidExtension {
                        opcode: self.opcode,
                        reg: modrm.reg,
                    })
                })?;
                Ok(Operand::segment_register(seg))
            }
            Method::P => Err(self.error(DecodeError::Unsupported("MMX register operand"))),
            Method::V => Err(self.error(DecodeError::Unsupported("SIMD register operand"))),
            Method::E | Method::M | Method::R => {
                let modrm = self.modrm()?;
                match (modrm.memory, method) {
                    (Some(_), Method::R) => Err(self.error(DecodeError::RegisterRequired)),
                    (None, Method::M) => Err(self.error(DecodeError::MemoryRequired)),
                    (Some(memory), _) if ty == TypeCode::Sel => Ok(self.pointer(memory, 2)),
                    (Some(memory), _) => Ok(self.pointer(memory, size)),
                    (None, _) => Ok(Operand::register(RegisterRef::from_encoding(modrm.rm, size))),
                }
            }
            Method::I | Method::A => {
                let encoded = size.min(4);
                let value = self.next_sized(encoded)?;
                let width = match target {
                    Some(width) if encoded == 1 => width,
                    _ => encoded,
                };
                Ok(Operand::immediate(value, encoded, width))
            }
            Method::J => {
                let value = self.next_sized(size)?;
                Ok(Operand::immediate(value, size, self.operand_bytes()))
            }
            Method::O => {
                let width = if self.address_size32 { 4 } else { 2 };
                let value = self.next_sized(width)?;
                Ok(Operand::mem_displacement(
                    Encoded { value, size: width },
                    self.seg_override.unwrap_or(SegReg::Ds),
                    size,
                    self.address_size32,
                ))
            }
            Method::X => Ok(Operand::pointer(
                Some(self.string_register(Register::Esi)),
                None,
                None,
                self.seg_override.unwrap_or(SegReg::Ds),
                size,
                self.address_size32,
            )),
            Method::Y => Ok(Operand::pointer(
                Some(self.string_register(Register::Edi)),
                None,
                None,
                SegReg::Es,
                size,
                self.address_size32,
            )),
            Method::F => Ok(Operand::flags(size)),
        }
    }
}

/// Decode one instruction starting at `offset`
///
/// # Arguments
///
/// * `reader` - Byte source (a slice, or the CS segment of a running CPU)
/// * `offset` - Offset of the first byte
/// * `address_size_32` - Default address size of the code segment
/// * `operand_size_32` - Default operand size of the code segment
///
/// # Returns
///
/// The decoded instruction, or `EmulatorError::Decode` for invalid encodings
pub fn decode<R: CodeReader + ?Sized>(
    reader: &mut R,
    offset: u32,
    address_size_32: bool,
    operand_size_32: bool,
) -> Result<Instruction> {
    let mut d = Decoder {
        reader,
        start: offset,
        pos: offset,
        opcode: 0,
        address_size32: address_size_32,
        operand_size32: operand_size_32,
        seg_override: None,
        repeat: None,
        modrm: None,
        register_form: false,
    };

    let first = d.prefixes()?;
    let entry = if first == 0x0F {
        let second = d.next_u8()?;
        d.opcode = second;
        d.register_form = (0x20..=0x23).contains(&second);
        match secondary(second) {
            Entry::Invalid => return Err(d.error(DecodeError::InvalidEscape(second))),
            entry => entry,
        }
    } else {
        d.opcode = first;
        primary(first)
    };

    let entry = match entry {
        Entry::Group(group) => {
            let reg = d.modrm()?.reg;
            match group_entry(group, reg) {
                Entry::Invalid => {
                    return Err(d.error(DecodeError::InvalidExtension {
                        opcode: d.opcode,
                        reg,
                    }))
                }
                entry => entry,
            }
        }
        entry => entry,
    };

    let (mnemonic, attrs) = match entry {
        Entry::Op(mnemonic, attrs) => (mnemonic, attrs),
        Entry::Vector(attrs) => {
            d.modrm()?;
            for attr in attrs {
                d.operand(*attr, None)?;
            }
            return Err(d.error(DecodeError::Unsupported("vector instruction")));
        }
        Entry::Unsupported(reason) => return Err(d.error(DecodeError::Unsupported(reason))),
        Entry::Invalid | Entry::Group(_) => return Err(d.error(DecodeError::InvalidOpcode(first))),
    };

    if attrs.iter().any(|attr| attr.needs_modrm()) {
        d.modrm()?;
    }

    let mut operands = [None; 3];
    for (i, attr) in attrs.iter().enumerate() {
        let target = match (i, mnemonic) {
            (0, Mnemonic::Push) => Some(d.operand_bytes()),
            (0, _) => None,
            _ => operands[0].map(|op: Operand| op.size),
        };
        operands[i] = Some(d.operand(*attr, target)?);
    }

    // MOV to CS is undefined
    if let (Mnemonic::Mov, Some(op)) = (mnemonic, operands[0]) {
        if op.accessor == Accessor::Segment(SegReg::Cs) {
            return Err(d.error(DecodeError::InvalidExtension {
                opcode: d.opcode,
                reg: 1,
            }));
        }
    }

    let len = d.pos.wrapping_sub(d.start) as u8;
    Ok(Instruction {
        mnemonic,
        offset,
        len,
        operands,
        repeat: d.repeat,
        segment: d.seg_override.unwrap_or(SegReg::Ds),
        address_size32: d.address_size32,
        operand_size32: d.operand_size32,
    })
}
