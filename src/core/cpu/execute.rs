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

//! Instruction semantics
//!
//! `execute` runs one decoded instruction. EIP already points past the
//! instruction when it is called; branches overwrite it and an unfinished
//! REP string instruction rewinds it so the next step runs the following
//! iteration.
//!
//! Faults are returned as `EmulatorError::Exception` without side effects on
//! EIP or ESP; `CPU::step` restores both and delivers the exception.

use super::flags::{size_mask, Eflags, Flag, FlagOp};
use super::instruction::{Instruction, Mnemonic, Repeat};
use super::operand::{sign_extend, Accessor, Operand, OperandKind};
use super::registers::{Register, RegisterRef, SegReg};
use super::segment::{AccessRights, CpuMode, Descriptor, DescriptorTableRegister};
use super::{CPU, CR0_PE, CR0_TS};
use crate::core::error::{EmulatorError, ExceptionVector, Result};
use crate::core::memory::Memory;

fn fault(vector: ExceptionVector, code: u16) -> EmulatorError {
    EmulatorError::exception(vector, Some(code))
}

fn gp(code: u16) -> EmulatorError {
    fault(ExceptionVector::GeneralProtection, code)
}

#[inline(always)]
fn sign_bit(size: u8) -> u32 {
    1 << (size as u32 * 8 - 1)
}

/// Accumulator (AL, AX or EAX) at `size`
#[inline(always)]
fn accumulator(size: u8) -> RegisterRef {
    RegisterRef::from_encoding(0, size)
}

impl CPU {
    /// Execute one decoded instruction
    pub(super) fn execute(&mut self, memory: &mut Memory, insn: &Instruction) -> Result<()> {
        use Mnemonic as M;

        match insn.mnemonic {
            M::Add | M::Or | M::Adc | M::Sbb | M::And | M::Sub | M::Xor | M::Cmp | M::Test => {
                let dst = insn.operand(0)?;
                let src = insn.operand(1)?;
                let a = self.read_operand(memory, dst)?;
                let b = self.read_operand(memory, src)?;
                let (res, op) = self.alu(insn.mnemonic, a, b);
                if !matches!(insn.mnemonic, M::Cmp | M::Test) {
                    self.write_operand(memory, dst, res)?;
                }
                self.flags.record(op, a, b, res, dst.size);
            }
            M::Inc | M::Dec => {
                let op = insn.operand(0)?;
                let a = self.read_operand(memory, op)?;
                let (res, flag_op) = if insn.mnemonic == M::Inc {
                    (a.wrapping_add(1), FlagOp::Inc)
                } else {
                    (a.wrapping_sub(1), FlagOp::Dec)
                };
                self.write_operand(memory, op, res)?;
                self.flags.record(flag_op, a, 1, res, op.size);
            }
            M::Not => {
                let op = insn.operand(0)?;
                let a = self.read_operand(memory, op)?;
                self.write_operand(memory, op, !a)?;
            }
            M::Neg => {
                let op = insn.operand(0)?;
                let a = self.read_operand(memory, op)?;
                let res = 0u32.wrapping_sub(a);
                self.write_operand(memory, op, res)?;
                self.flags.record(FlagOp::Neg, a, 0, res, op.size);
            }

            M::Push => {
                let op = insn.operand(0)?;
                let value = self.read_operand(memory, op)?;
                self.push(memory, value, stack_width(insn, op))?;
            }
            M::Pop => {
                let op = insn.operand(0)?;
                let value = self.pop(memory, stack_width(insn, op))?;
                self.write_operand(memory, op, value)?;
            }
            M::Pusha => {
                let size = insn.operand_bytes();
                let sp = self.regs.get(Register::Esp);
                for reg in Register::ALL {
                    let value = if reg == Register::Esp {
                        sp
                    } else {
                        self.regs.get(reg)
                    };
                    self.push(memory, value, size)?;
                }
            }
            M::Popa => {
                let size = insn.operand_bytes();
                for reg in Register::ALL.into_iter().rev() {
                    let value = self.pop(memory, size)?;
                    if reg != Register::Esp {
                        self.regs.write(RegisterRef::sized(reg, size == 4), value);
                    }
                }
            }
            M::Pushf => {
                let op = insn.operand(0)?;
                if self.mode() == CpuMode::Virtual8086 && self.flags.iopl() < 3 {
                    return Err(gp(0));
                }
                let image = self.flags.eflags() & !(Eflags::VM | Eflags::RF).bits();
                self.push(memory, image, op.size)?;
            }
            M::Popf => {
                let op = insn.operand(0)?;
                if self.mode() == CpuMode::Virtual8086 && self.flags.iopl() < 3 {
                    return Err(gp(0));
                }
                let value = self.pop(memory, op.size)?;
                self.write_flags(value, op.size);
            }

            M::Mov => {
                let dst = insn.operand(0)?;
                let src = insn.operand(1)?;
                if is_system_register(dst) || is_system_register(src) {
                    self.require_privilege()?;
                }
                let value = self.read_operand(memory, src)?;
                self.write_operand(memory, dst, value)?;
            }
            M::Movzx | M::Movsx => {
                let dst = insn.operand(0)?;
                let src = insn.operand(1)?;
                let mut value = self.read_operand(memory, src)?;
                if insn.mnemonic == M::Movsx {
                    value = sign_extend(value, src.size, dst.size);
                }
                self.write_operand(memory, dst, value)?;
            }
            M::Xchg => {
                let a_op = insn.operand(0)?;
                let b_op = insn.operand(1)?;
                let a = self.read_operand(memory, a_op)?;
                let b = self.read_operand(memory, b_op)?;
                self.write_operand(memory, a_op, b)?;
                self.write_operand(memory, b_op, a)?;
            }
            M::Lea => {
                let dst = insn.operand(0)?;
                let src = insn.operand(1)?;
                let ea = self.effective_address(src, 0);
                self.write_operand(memory, dst, ea)?;
            }
            M::Nop => {}
            M::Cbw => {
                if insn.operand_size32 {
                    let ax = self.regs.read(accumulator(2));
                    self.regs.write(accumulator(4), sign_extend(ax, 2, 4));
                } else {
                    let al = self.regs.read(accumulator(1));
                    self.regs.write(accumulator(2), sign_extend(al, 1, 2));
                }
            }
            M::Cwd => {
                let size = insn.operand_bytes();
                let acc = self.regs.read(accumulator(size));
                let high = if acc & sign_bit(size) != 0 {
                    size_mask(size)
                } else {
                    0
                };
                self.regs.write(RegisterRef::from_encoding(2, size), high);
            }
            M::Lahf => {
                let low = self.flags.eflags() & 0xFF;
                self.regs.write(RegisterRef::from_encoding(4, 1), low);
            }
            M::Sahf => {
                let ah = self.regs.read(RegisterRef::from_encoding(4, 1));
                for flag in [Flag::Cf, Flag::Pf, Flag::Af, Flag::Zf, Flag::Sf] {
                    self.flags.set_bin(flag, ah & flag.bit().bits() != 0);
                }
            }

            M::Jcc(cc) => {
                if self.flags.condition(cc) {
                    self.eip = self.relative_target(insn)?;
                }
            }
            M::Setcc(cc) => {
                let op = insn.operand(0)?;
                let value = self.flags.condition(cc) as u32;
                self.write_operand(memory, op, value)?;
            }
            M::Jmp => {
                self.eip = self.near_target(memory, insn)?;
            }
            M::Call => {
                let target = self.near_target(memory, insn)?;
                let ret = self.eip;
                self.push(memory, ret, insn.operand_bytes())?;
                self.eip = target;
            }
            M::Ret => {
                let target = self.pop(memory, insn.operand_bytes())?;
                self.eip = self.mask_ip(insn, target);
                self.release_stack(insn)?;
            }
            M::JmpFar => {
                let (selector, offset) = self.far_pointer(memory, insn)?;
                self.load_segment(memory, SegReg::Cs, selector)?;
                self.eip = self.mask_ip(insn, offset);
            }
            M::CallFar => {
                let (selector, offset) = self.far_pointer(memory, insn)?;
                let size = insn.operand_bytes();
                let cs = self.segs[SegReg::Cs.index()].value() as u32;
                let ret = self.eip;
                self.push(memory, cs, size)?;
                self.push(memory, ret, size)?;
                self.load_segment(memory, SegReg::Cs, selector)?;
                self.eip = self.mask_ip(insn, offset);
            }
            M::Retf => {
                let size = insn.operand_bytes();
                let offset = self.pop(memory, size)?;
                let selector = self.pop(memory, size)? & 0xFFFF;
                if self.mode() == CpuMode::Protected && (selector & 3) as u8 > self.cpl {
                    return Err(EmulatorError::Unimplemented("privilege level change"));
                }
                self.load_segment(memory, SegReg::Cs, selector)?;
                self.eip = self.mask_ip(insn, offset);
                self.release_stack(insn)?;
            }
            M::Leave => {
                let ebp = self.regs.get(Register::Ebp);
                if self.stack_big() {
                    self.regs.set(Register::Esp, ebp);
                } else {
                    self.regs.write(RegisterRef::word(Register::Esp), ebp);
                }
                let size = insn.operand_bytes();
                let value = self.pop(memory, size)?;
                self.regs.write(RegisterRef::sized(Register::Ebp, size == 4), value);
            }
            M::Loop | M::Loope | M::Loopne => {
                let count_ref = RegisterRef::sized(Register::Ecx, insn.address_size32);
                let count = self.regs.read(count_ref).wrapping_sub(1) & size_mask(count_ref.size());
                self.regs.write(count_ref, count);
                let taken = count != 0
                    && match insn.mnemonic {
                        M::Loope => self.flags.test(Flag::Zf),
                        M::Loopne => !self.flags.test(Flag::Zf),
                        _ => true,
                    };
                if taken {
                    self.eip = self.relative_target(insn)?;
                }
            }
            M::Jcxz => {
                let count_ref = RegisterRef::sized(Register::Ecx, insn.address_size32);
                if self.regs.read(count_ref) == 0 {
                    self.eip = self.relative_target(insn)?;
                }
            }

            M::Int3 => self.interrupt(memory, 3, None, self.eip, true)?,
            M::Int => {
                let vector = insn.operand(0)?.immediate_value() as u8;
                if self.mode() == CpuMode::Virtual8086 && self.flags.iopl() < 3 {
                    return Err(gp(0));
                }
                self.interrupt(memory, vector, None, self.eip, true)?;
            }
            M::Into => {
                if self.flags.test(Flag::Of) {
                    self.interrupt(memory, 4, None, self.eip, true)?;
                }
            }
            M::Iret => self.iret(memory, insn)?,
            M::Hlt => {
                self.require_privilege()?;
                log::debug!(
                    "CPU: HLT at {:04X}:{:08X}",
                    self.segs[SegReg::Cs.index()].value(),
                    self.current_eip
                );
                self.halted = true;
            }

            M::Cmc => {
                let cf = self.flags.test(Flag::Cf);
                self.flags.set_bin(Flag::Cf, !cf);
            }
            M::Clc => self.flags.clear(Flag::Cf),
            M::Stc => self.flags.set(Flag::Cf),
            M::Cld => self.flags.clear(Flag::Df),
            M::Std => self.flags.set(Flag::Df),
            M::Cli => {
                self.require_iopl()?;
                self.flags.clear(Flag::If);
            }
            M::Sti => {
                self.require_iopl()?;
                if !self.flags.contains(Eflags::IF) {
                    self.interrupt_shadow = true;
                }
                self.flags.set(Flag::If);
            }

            M::Movs | M::Cmps | M::Stos | M::Lods | M::Scas => self.string(memory, insn)?,

            M::Rol | M::Ror | M::Rcl | M::Rcr | M::Shl | M::Shr | M::Sar => {
                self.shift(memory, insn)?
            }

            M::Mul => self.multiply(memory, insn, false)?,
            M::Imul if insn.operand_count() == 1 => self.multiply(memory, insn, true)?,
            M::Imul => self.multiply_truncated(memory, insn)?,
            M::Div => self.divide(memory, insn, false)?,
            M::Idiv => self.divide(memory, insn, true)?,

            M::Lds => self.load_far_pointer(memory, insn, SegReg::Ds)?,
            M::Les => self.load_far_pointer(memory, insn, SegReg::Es)?,
            M::Lss => self.load_far_pointer(memory, insn, SegReg::Ss)?,
            M::Lfs => self.load_far_pointer(memory, insn, SegReg::Fs)?,
            M::Lgs => self.load_far_pointer(memory, insn, SegReg::Gs)?,

            M::Sldt => {
                self.require_protected()?;
                let op = insn.operand(0)?;
                self.write_operand(memory, op, self.ldtr_selector as u32)?;
            }
            M::Lldt => {
                self.require_protected()?;
                self.require_privilege()?;
                let selector = self.read_operand(memory, insn.operand(0)?)? as u16;
                self.load_ldt(memory, selector)?;
            }
            M::Sgdt | M::Sidt => {
                let table = if insn.mnemonic == M::Sgdt {
                    self.gdtr
                } else {
                    self.idtr
                };
                let base = if insn.operand_size32 {
                    table.base
                } else {
                    table.base & 0x00FF_FFFF
                };
                let op = insn.operand(0)?;
                self.write_operand_at(memory, op, 0, table.limit, 2)?;
                self.write_operand_at(memory, op, 2, base, 4)?;
            }
            M::Lgdt | M::Lidt => {
                self.require_privilege()?;
                let op = insn.operand(0)?;
                let limit = self.read_operand_at(memory, op, 0, 2)?;
                let mut base = self.read_operand_at(memory, op, 2, 4)?;
                if !insn.operand_size32 {
                    base &= 0x00FF_FFFF;
                }
                let table = DescriptorTableRegister { base, limit };
                log::debug!("{}: base=0x{:08X} limit=0x{:04X}", insn.mnemonic, base, limit);
                if insn.mnemonic == M::Lgdt {
                    self.gdtr = table;
                } else {
                    self.idtr = table;
                }
            }
            M::Smsw => {
                let op = insn.operand(0)?;
                self.write_operand(memory, op, self.cr[0] & 0xFFFF)?;
            }
            M::Lmsw => {
                self.require_privilege()?;
                let value = self.read_operand(memory, insn.operand(0)?)? & 0xF;
                // LMSW can set PE but never clear it
                let cr0 = (self.cr[0] & !0xF) | value | (self.cr[0] & CR0_PE);
                self.write_control(memory, 0, cr0)?;
            }
            M::Clts => {
                self.require_privilege()?;
                self.cr[0] &= !CR0_TS;
            }
        }
        Ok(())
    }

    /// Two-operand ALU result and the flag formula that describes it
    #[inline]
    fn alu(&mut self, mnemonic: Mnemonic, a: u32, b: u32) -> (u32, FlagOp) {
        match mnemonic {
            Mnemonic::Add => (a.wrapping_add(b), FlagOp::Add),
            Mnemonic::Adc => {
                let carry = self.flags.get(Flag::Cf) as u32;
                (a.wrapping_add(b).wrapping_add(carry), FlagOp::Adc)
            }
            Mnemonic::Sub => (a.wrapping_sub(b), FlagOp::Sub),
            Mnemonic::Sbb => {
                let borrow = self.flags.get(Flag::Cf) as u32;
                (a.wrapping_sub(b).wrapping_sub(borrow), FlagOp::Sbb)
            }
            Mnemonic::Cmp => (a.wrapping_sub(b), FlagOp::Cmp),
            Mnemonic::Or => (a | b, FlagOp::Logic),
            Mnemonic::Xor => (a ^ b, FlagOp::Logic),
            _ => (a & b, FlagOp::Logic),
        }
    }

    fn stack_big(&self) -> bool {
        self.segs[SegReg::Ss.index()].cache().default_big
    }

    /// Push `size` bytes onto SS:(E)SP
    ///
    /// ESP only moves once the write has succeeded.
    pub(super) fn push(&mut self, memory: &mut Memory, value: u32, size: u8) -> Result<()> {
        let esp = self.regs.get(Register::Esp);
        let (new_esp, offset) = if self.stack_big() {
            let esp = esp.wrapping_sub(size as u32);
            (esp, esp)
        } else {
            let sp = (esp as u16).wrapping_sub(size as u16) as u32;
            ((esp & 0xFFFF_0000) | sp, sp)
        };
        let mode = self.mode();
        self.segs[SegReg::Ss.index()].write_segment(memory, offset, value & size_mask(size), size, mode)?;
        self.regs.set(Register::Esp, new_esp);
        Ok(())
    }

    /// Pop `size` bytes from SS:(E)SP
    pub(super) fn pop(&mut self, memory: &mut Memory, size: u8) -> Result<u32> {
        let esp = self.regs.get(Register::Esp);
        let offset = if self.stack_big() { esp } else { esp & 0xFFFF };
        let mode = self.mode();
        let value = self.segs[SegReg::Ss.index()].read_segment(memory, offset, size, mode)?;
        self.adjust_sp(size as u32);
        Ok(value)
    }

    fn adjust_sp(&mut self, delta: u32) {
        let esp = self.regs.get(Register::Esp);
        let new_esp = if self.stack_big() {
            esp.wrapping_add(delta)
        } else {
            (esp & 0xFFFF_0000) | (esp as u16).wrapping_add(delta as u16) as u32
        };
        self.regs.set(Register::Esp, new_esp);
    }

    /// Drop the imm16 bytes of RET n / RETF n
    fn release_stack(&mut self, insn: &Instruction) -> Result<()> {
        if insn.operand_count() == 1 {
            let bytes = insn.operand(0)?.immediate_value();
            self.adjust_sp(bytes);
        }
        Ok(())
    }

    fn mask_ip(&self, insn: &Instruction, target: u32) -> u32 {
        if insn.operand_size32 {
            target
        } else {
            target & 0xFFFF
        }
    }

    /// Target of a relative branch
    fn relative_target(&self, insn: &Instruction) -> Result<u32> {
        let op = insn.operand(0)?;
        let rel = sign_extend(op.immediate_value(), op.size, 4);
        Ok(self.mask_ip(insn, insn.next_offset().wrapping_add(rel)))
    }

    /// Target of a near JMP/CALL, relative or indirect
    fn near_target(&mut self, memory: &mut Memory, insn: &Instruction) -> Result<u32> {
        let op = insn.operand(0)?;
        if op.accessor == Accessor::Immediate {
            self.relative_target(insn)
        } else {
            let target = self.read_operand(memory, op)?;
            Ok(self.mask_ip(insn, target))
        }
    }

    /// Selector and offset of a far JMP/CALL
    ///
    /// Direct forms carry both as immediates; indirect forms read an
    /// offset:selector pair from memory.
    fn far_pointer(&mut self, memory: &mut Memory, insn: &Instruction) -> Result<(u32, u32)> {
        if insn.operand_count() == 2 {
            let offset = insn.operand(0)?.immediate_value();
            let selector = insn.operand(1)?.immediate_value();
            return Ok((selector, offset));
        }
        let op = insn.operand(0)?;
        let offset_size = op.size - 2;
        let offset = self.read_operand_at(memory, op, 0, offset_size)?;
        let selector = self.read_operand_at(memory, op, offset_size as u32, 2)?;
        Ok((selector, offset))
    }

    /// LDS/LES/LSS/LFS/LGS
    fn load_far_pointer(&mut self, memory: &mut Memory, insn: &Instruction, seg: SegReg) -> Result<()> {
        let dst = insn.operand(0)?;
        let src = insn.operand(1)?;
        let offset = self.read_operand_at(memory, src, 0, dst.size)?;
        let selector = self.read_operand_at(memory, src, dst.size as u32, 2)?;
        self.load_segment(memory, seg, selector)?;
        self.write_operand(memory, dst, offset)
    }

    /// One iteration of a string instruction
    fn string(&mut self, memory: &mut Memory, insn: &Instruction) -> Result<()> {
        let count_ref = RegisterRef::sized(Register::Ecx, insn.address_size32);
        if insn.repeat.is_some() && self.regs.read(count_ref) == 0 {
            return Ok(());
        }

        let dst = insn.operand(0)?;
        let src = insn.operand(1)?;
        match insn.mnemonic {
            Mnemonic::Cmps | Mnemonic::Scas => {
                let a = self.read_operand(memory, dst)?;
                let b = self.read_operand(memory, src)?;
                self.flags.record(FlagOp::Cmp, a, b, a.wrapping_sub(b), dst.size);
            }
            _ => {
                let value = self.read_operand(memory, src)?;
                self.write_operand(memory, dst, value)?;
            }
        }

        let step = if self.flags.contains(Eflags::DF) {
            (dst.size as u32).wrapping_neg()
        } else {
            dst.size as u32
        };
        for op in [dst, src] {
            if let Some(index) = op.base.filter(|_| op.is_memory()) {
                let value = self.regs.read(index).wrapping_add(step);
                self.regs.write(index, value);
            }
        }

        if let Some(repeat) = insn.repeat {
            let count = self.regs.read(count_ref).wrapping_sub(1) & size_mask(count_ref.size());
            self.regs.write(count_ref, count);
            let mut again = count != 0;
            if matches!(insn.mnemonic, Mnemonic::Cmps | Mnemonic::Scas) {
                let zf = self.flags.test(Flag::Zf);
                again &= match repeat {
                    Repeat::Rep => zf,
                    Repeat::Repne => !zf,
                };
            }
            if again {
                self.eip = insn.offset;
            }
        }
        Ok(())
    }

    /// Group 2 shifts and rotates
    ///
    /// The count is masked to 5 bits; a zero count changes nothing.
    /// Shifts define PF/ZF/SF from the result. Rotates only touch CF and OF.
    fn shift(&mut self, memory: &mut Memory, insn: &Instruction) -> Result<()> {
        let dst = insn.operand(0)?;
        let a = self.read_operand(memory, dst)?;
        let count = self.read_operand(memory, insn.operand(1)?)? & 0x1F;
        if count == 0 {
            return Ok(());
        }

        let size = dst.size;
        let bits = size as u32 * 8;
        let mask = size_mask(size);
        let sign = sign_bit(size);
        let msb = |v: u32| v & sign != 0;

        let (res, cf, of, record) = match insn.mnemonic {
            Mnemonic::Shl => {
                let wide = (a as u64) << count;
                let res = wide as u32 & mask;
                let cf = (wide >> bits) & 1 != 0;
                (res, cf, msb(res) != cf, true)
            }
            Mnemonic::Shr => {
                let cf = (a >> (count - 1)) & 1 != 0;
                (a >> count, cf, msb(a), true)
            }
            Mnemonic::Sar => {
                let signed = sign_extend(a, size, 4) as i32;
                let cf = (signed >> (count - 1)) & 1 != 0;
                ((signed >> count) as u32 & mask, cf, false, true)
            }
            Mnemonic::Rol => {
                let n = count % bits;
                let res = if n == 0 {
                    a
                } else {
                    ((a << n) | (a >> (bits - n))) & mask
                };
                let cf = res & 1 != 0;
                (res, cf, msb(res) != cf, false)
            }
            Mnemonic::Ror => {
                let n = count % bits;
                let res = if n == 0 {
                    a
                } else {
                    ((a >> n) | (a << (bits - n))) & mask
                };
                (res, msb(res), msb(res ^ (res << 1)), false)
            }
            Mnemonic::Rcl => {
                let mut cf = self.flags.test(Flag::Cf);
                let mut v = a;
                for _ in 0..count % (bits + 1) {
                    let out = msb(v);
                    v = ((v << 1) | cf as u32) & mask;
                    cf = out;
                }
                (v, cf, msb(v) != cf, false)
            }
            _ => {
                let mut cf = self.flags.test(Flag::Cf);
                let mut v = a;
                for _ in 0..count % (bits + 1) {
                    let out = v & 1 != 0;
                    v = (v >> 1) | if cf { sign } else { 0 };
                    cf = out;
                }
                (v, cf, msb(v ^ (v << 1)), false)
            }
        };

        self.write_operand(memory, dst, res)?;
        if record {
            self.flags.record(FlagOp::Shift, a, count, res, size);
        }
        self.flags.set_bin(Flag::Cf, cf);
        self.flags.set_bin(Flag::Of, of);
        Ok(())
    }

    /// MUL/IMUL with the accumulator, widening into (E)DX or AH
    fn multiply(&mut self, memory: &mut Memory, insn: &Instruction, signed: bool) -> Result<()> {
        let src_op = insn.operand(0)?;
        let size = src_op.size;
        let bits = size as u32 * 8;
        let mask = size_mask(size);
        let src = self.read_operand(memory, src_op)?;
        let acc = self.regs.read(accumulator(size));

        let (low, high, expected) = if signed {
            let product =
                sign_extend(acc, size, 4) as i32 as i64 * sign_extend(src, size, 4) as i32 as i64;
            let low = product as u32 & mask;
            let high = (product >> bits) as u32 & mask;
            let expected = if low & sign_bit(size) != 0 { mask } else { 0 };
            (low, high, expected)
        } else {
            let product = acc as u64 * src as u64;
            (product as u32 & mask, (product >> bits) as u32 & mask, 0)
        };

        if size == 1 {
            self.regs.write(accumulator(2), (high << 8) | low);
        } else {
            self.regs.write(accumulator(size), low);
            self.regs.write(RegisterRef::from_encoding(2, size), high);
        }
        let op = if signed { FlagOp::Imul } else { FlagOp::Mul };
        self.flags.record(op, high, expected, low, size);
        Ok(())
    }

    /// Two- and three-operand IMUL, truncated to the destination width
    fn multiply_truncated(&mut self, memory: &mut Memory, insn: &Instruction) -> Result<()> {
        let dst = insn.operand(0)?;
        let (a, b) = if insn.operand_count() == 3 {
            (
                self.read_operand(memory, insn.operand(1)?)?,
                self.read_operand(memory, insn.operand(2)?)?,
            )
        } else {
            (
                self.read_operand(memory, dst)?,
                self.read_operand(memory, insn.operand(1)?)?,
            )
        };

        let size = dst.size;
        let mask = size_mask(size);
        let product = sign_extend(a, size, 4) as i32 as i64 * sign_extend(b, size, 4) as i32 as i64;
        let low = product as u32 & mask;
        let high = (product >> (size as u32 * 8)) as u32 & mask;
        let expected = if low & sign_bit(size) != 0 { mask } else { 0 };

        self.write_operand(memory, dst, low)?;
        self.flags.record(FlagOp::Imul, high, expected, low, size);
        Ok(())
    }

    /// DIV/IDIV of (E)DX:(E)AX or AX
    ///
    /// Division by zero and quotients that do not fit raise #DE.
    fn divide(&mut self, memory: &mut Memory, insn: &Instruction, signed: bool) -> Result<()> {
        let op = insn.operand(0)?;
        let size = op.size;
        let bits = size as u32 * 8;
        let mask = size_mask(size);
        let divisor = self.read_operand(memory, op)?;
        let divide_error = EmulatorError::exception(ExceptionVector::DivideError, None);
        if divisor == 0 {
            return Err(divide_error);
        }

        let dividend = match size {
            1 => self.regs.read(accumulator(2)) as u64,
            _ => {
                let high = self.regs.read(RegisterRef::from_encoding(2, size)) as u64;
                (high << bits) | self.regs.read(accumulator(size)) as u64
            }
        };

        let (quotient, remainder) = if signed {
            let dividend = match size {
                1 => dividend as u16 as i16 as i64,
                2 => dividend as u32 as i32 as i64,
                _ => dividend as i64,
            };
            let divisor = sign_extend(divisor, size, 4) as i32 as i64;
            let (Some(q), Some(r)) = (dividend.checked_div(divisor), dividend.checked_rem(divisor))
            else {
                return Err(divide_error);
            };
            let limit = 1i64 << (bits - 1);
            if q >= limit || q < -limit {
                return Err(divide_error);
            }
            (q as u32 & mask, r as u32 & mask)
        } else {
            let q = dividend / divisor as u64;
            if q > mask as u64 {
                return Err(divide_error);
            }
            (q as u32, (dividend % divisor as u64) as u32)
        };

        if size == 1 {
            self.regs.write(accumulator(2), (remainder << 8) | quotient);
        } else {
            self.regs.write(accumulator(size), quotient);
            self.regs.write(RegisterRef::from_encoding(2, size), remainder);
        }
        Ok(())
    }

    fn load_ldt(&mut self, memory: &mut Memory, selector: u16) -> Result<()> {
        if selector & 0xFFFC == 0 {
            self.ldtr = DescriptorTableRegister::default();
            self.ldtr_selector = selector;
            return Ok(());
        }
        if selector & 0x4 != 0 {
            return Err(gp(selector & 0xFFFC));
        }

        let raw = memory.fetch_raw_descriptor(
            selector,
            &self.gdtr,
            &self.ldtr,
            ExceptionVector::GeneralProtection,
        )?;
        let descriptor = Descriptor::parse(raw);
        if descriptor.system_type() != Some(0x2) {
            return Err(gp(selector & 0xFFFC));
        }
        if !descriptor.present() {
            return Err(fault(ExceptionVector::SegmentNotPresent, selector & 0xFFFC));
        }

        self.ldtr = DescriptorTableRegister {
            base: descriptor.base,
            limit: descriptor.limit_scaled,
        };
        self.ldtr_selector = selector;
        log::debug!(
            "LDTR <- 0x{:04X}: base=0x{:08X} limit=0x{:08X}",
            selector,
            descriptor.base,
            descriptor.limit_scaled
        );
        Ok(())
    }

    /// Privileged instructions need CPL 0 (always true in real mode)
    fn require_privilege(&self) -> Result<()> {
        match self.mode() {
            CpuMode::Real => Ok(()),
            CpuMode::Protected if self.cpl == 0 => Ok(()),
            _ => Err(gp(0)),
        }
    }

    /// CLI/STI need CPL <= IOPL
    fn require_iopl(&self) -> Result<()> {
        let allowed = match self.mode() {
            CpuMode::Real => true,
            CpuMode::Protected => self.cpl <= self.flags.iopl(),
            CpuMode::Virtual8086 => self.flags.iopl() == 3,
        };
        if allowed {
            Ok(())
        } else {
            Err(gp(0))
        }
    }

    fn require_protected(&self) -> Result<()> {
        if self.mode() == CpuMode::Protected {
            Ok(())
        } else {
            Err(EmulatorError::exception(ExceptionVector::InvalidOpcode, None))
        }
    }

    /// Transfer control through the IVT or IDT
    ///
    /// # Arguments
    ///
    /// * `vector` - Interrupt vector number
    /// * `error_code` - Pushed after the return address (protected mode only)
    /// * `return_eip` - Offset the handler returns to
    /// * `software` - INT n/INT3/INTO, which are checked against the gate DPL
    pub(super) fn interrupt(
        &mut self,
        memory: &mut Memory,
        vector: u8,
        error_code: Option<u16>,
        return_eip: u32,
        software: bool,
    ) -> Result<()> {
        match self.mode() {
            CpuMode::Real => self.real_mode_interrupt(memory, vector, return_eip),
            CpuMode::Protected => {
                self.protected_mode_interrupt(memory, vector, error_code, return_eip, software)
            }
            CpuMode::Virtual8086 => Err(EmulatorError::Unimplemented("virtual-8086 interrupt")),
        }
    }

    fn real_mode_interrupt(&mut self, memory: &mut Memory, vector: u8, return_eip: u32) -> Result<()> {
        let index = vector as u32 * 4;
        if index + 3 > self.idtr.limit {
            return Err(gp(0));
        }
        let entry = self.idtr.base.wrapping_add(index);
        let offset = memory.read_linear(entry, 2)?;
        let selector = memory.read_linear(entry.wrapping_add(2), 2)?;

        let flags = self.flags.eflags();
        let cs = self.segs[SegReg::Cs.index()].value() as u32;
        self.push(memory, flags, 2)?;
        self.push(memory, cs, 2)?;
        self.push(memory, return_eip, 2)?;

        self.flags
            .set_eflags(flags & !(Eflags::IF | Eflags::TF | Eflags::AC).bits());
        self.load_segment(memory, SegReg::Cs, selector)?;
        self.eip = offset;
        log::trace!("INT 0x{:02X} -> {:04X}:{:04X}", vector, selector, offset);
        Ok(())
    }

    fn protected_mode_interrupt(
        &mut self,
        memory: &mut Memory,
        vector: u8,
        error_code: Option<u16>,
        return_eip: u32,
        software: bool,
    ) -> Result<()> {
        let index = vector as u32 * 8;
        // IDT-relative error code
        let gate_code = (index + 2) as u16;
        if index + 7 > self.idtr.limit {
            return Err(gp(gate_code));
        }

        let entry = self.idtr.base.wrapping_add(index);
        let low = memory.read_linear(entry, 4)? as u64;
        let high = memory.read_linear(entry.wrapping_add(4), 4)? as u64;
        let raw = low | (high << 32);

        let gate_type = ((raw >> 40) & 0xF) as u8;
        let gate_dpl = ((raw >> 45) & 3) as u8;
        let present = raw & (1 << 47) != 0;
        let selector = ((raw >> 16) & 0xFFFF) as u16;
        let offset = (raw & 0xFFFF) as u32 | (((raw >> 48) & 0xFFFF) as u32) << 16;

        let (big, trap) = match gate_type {
            0x6 => (false, false),
            0x7 => (false, true),
            0xE => (true, false),
            0xF => (true, true),
            0x5 => return Err(EmulatorError::Unimplemented("task gate")),
            _ => return Err(gp(gate_code)),
        };
        if software && gate_dpl < self.cpl {
            return Err(gp(gate_code));
        }
        if !present {
            return Err(fault(ExceptionVector::SegmentNotPresent, gate_code));
        }
        if selector & 0xFFFC == 0 {
            return Err(gp(0));
        }

        let target = Descriptor::parse(memory.fetch_raw_descriptor(
            selector,
            &self.gdtr,
            &self.ldtr,
            ExceptionVector::GeneralProtection,
        )?);
        let conforming = target.access.contains(AccessRights::CONFORMING_EXPAND_DOWN);
        if target.is_code() && !conforming && target.dpl() < self.cpl {
            return Err(EmulatorError::Unimplemented("privilege level change"));
        }

        let size = if big { 4 } else { 2 };
        let flags = self.flags.eflags();
        let cs = self.segs[SegReg::Cs.index()].value() as u32;
        self.push(memory, flags, size)?;
        self.push(memory, cs, size)?;
        self.push(memory, return_eip, size)?;
        if let Some(code) = error_code {
            self.push(memory, code as u32, size)?;
        }

        let target_selector = (selector & !3) | self.cpl as u16;
        self.load_segment(memory, SegReg::Cs, target_selector as u32)?;

        let mut cleared = Eflags::TF | Eflags::NT | Eflags::RF | Eflags::VM;
        if !trap {
            cleared |= Eflags::IF;
        }
        self.flags.set_eflags(flags & !cleared.bits());
        self.eip = if big { offset } else { offset & 0xFFFF };
        log::trace!(
            "INT 0x{:02X} -> {:04X}:{:08X} ({} gate)",
            vector,
            target_selector,
            self.eip,
            if trap { "trap" } else { "interrupt" }
        );
        Ok(())
    }

    fn iret(&mut self, memory: &mut Memory, insn: &Instruction) -> Result<()> {
        let mode = self.mode();
        match mode {
            CpuMode::Virtual8086 => return Err(EmulatorError::Unimplemented("virtual-8086 IRET")),
            CpuMode::Protected if self.flags.contains(Eflags::NT) => {
                return Err(EmulatorError::Unimplemented("task return"))
            }
            _ => {}
        }

        let size = insn.operand_bytes();
        let offset = self.pop(memory, size)?;
        let selector = self.pop(memory, size)? & 0xFFFF;
        let flags = self.pop(memory, size)?;

        if mode == CpuMode::Protected {
            if size == 4 && flags & Eflags::VM.bits() != 0 && self.cpl == 0 {
                return Err(EmulatorError::Unimplemented("virtual-8086 entry"));
            }
            if (selector & 3) as u8 > self.cpl {
                return Err(EmulatorError::Unimplemented("privilege level change"));
            }
        }

        self.load_segment(memory, SegReg::Cs, selector)?;
        self.eip = self.mask_ip(insn, offset);
        self.write_flags(flags, size);
        Ok(())
    }
}

/// Width of a PUSH/POP; segment registers move a full operand-size slot
fn stack_width(insn: &Instruction, op: &Operand) -> u8 {
    match op.accessor {
        Accessor::Segment(_) => insn.operand_bytes(),
        _ => op.size,
    }
}

fn is_system_register(op: &Operand) -> bool {
    matches!(op.kind, OperandKind::Control | OperandKind::Debug)
}
