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

//! Machine setup helpers for CPU tests

use super::*;
use crate::core::cpu::instruction::Instruction;

/// Where test code is placed (CS = 0 in real mode, flat CS in protected mode)
pub const CODE: u32 = 0x1000;

/// Initial stack pointer
pub const STACK_TOP: u32 = 0x8000;

/// GDT location used by `setup_protected`
pub const GDT_BASE: u32 = 0x0500;

/// IDT location used by the interrupt tests
pub const IDT_BASE: u32 = 0x0800;

pub const CODE32_SEL: u16 = 0x08;
pub const DATA32_SEL: u16 = 0x10;
pub const CODE16_SEL: u16 = 0x18;
pub const DATA16_SEL: u16 = 0x20;
/// Read-only data segment
pub const RODATA_SEL: u16 = 0x28;
/// DPL 3 data segment
pub const USER_DATA_SEL: u16 = 0x30;
/// Not-present data segment
pub const ABSENT_SEL: u16 = 0x38;
/// LDT descriptor
pub const LDT_SEL: u16 = 0x40;
/// Small data segment with a 0xFF byte limit
pub const SMALL_DATA_SEL: u16 = 0x48;
/// Conforming 32-bit code segment
pub const CONFORMING_SEL: u16 = 0x50;

pub const GDT_ENTRIES: u32 = 11;

/// Copy bytes into physical memory
pub fn load(memory: &mut Memory, addr: u32, bytes: &[u8]) {
    for (i, &b) in bytes.iter().enumerate() {
        memory.write_physical(addr + i as u32, b as u32, 1).unwrap();
    }
}

/// Build a raw segment descriptor
pub fn descriptor(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    (limit & 0xFFFF) as u64
        | ((base & 0xFF_FFFF) as u64) << 16
        | (access as u64) << 40
        | (((limit >> 16) & 0xF) as u64) << 48
        | ((flags & 0xF) as u64) << 52
        | ((base >> 24) as u64) << 56
}

/// Write a 64-bit value little-endian
pub fn write_u64(memory: &mut Memory, addr: u32, value: u64) {
    memory.write_physical(addr, value as u32, 4).unwrap();
    memory
        .write_physical(addr + 4, (value >> 32) as u32, 4)
        .unwrap();
}

/// Write an interrupt or trap gate into the IDT at `IDT_BASE`
pub fn write_gate(memory: &mut Memory, vector: u8, selector: u16, offset: u32, type_attr: u8) {
    let raw = (offset & 0xFFFF) as u64
        | (selector as u64) << 16
        | (type_attr as u64) << 40
        | ((offset >> 16) as u64) << 48;
    write_u64(memory, IDT_BASE + vector as u32 * 8, raw);
}

/// Real-mode machine with `code` at 0000:1000 and SS:SP = 0000:8000
pub fn setup_real(code: &[u8]) -> (CPU, Memory) {
    let mut memory = Memory::new(1024 * 1024);
    load(&mut memory, CODE, code);

    let mut cpu = CPU::new();
    cpu.load_segment(&mut memory, SegReg::Cs, 0).unwrap();
    cpu.set_eip(CODE);
    cpu.set_reg(Register::Esp, STACK_TOP);
    (cpu, memory)
}

/// Write the test GDT at `GDT_BASE`
pub fn write_gdt(memory: &mut Memory) {
    let entries = [
        0,
        descriptor(0, 0xFFFFF, 0x9A, 0xC),
        descriptor(0, 0xFFFFF, 0x92, 0xC),
        descriptor(0, 0xFFFF, 0x9A, 0x0),
        descriptor(0, 0xFFFF, 0x92, 0x0),
        descriptor(0, 0xFFFFF, 0x90, 0xC),
        descriptor(0, 0xFFFFF, 0xF2, 0xC),
        descriptor(0, 0xFFFFF, 0x12, 0xC),
        descriptor(0x3000, 0x17, 0x82, 0x0),
        descriptor(0x2000, 0xFF, 0x92, 0x4),
        descriptor(0, 0xFFFFF, 0x9E, 0xC),
    ];
    for (i, raw) in entries.iter().enumerate() {
        write_u64(memory, GDT_BASE + i as u32 * 8, *raw);
    }
}

/// 32-bit flat protected-mode machine with `code` at 0x1000
///
/// CS = 0x08, DS/ES/SS = 0x10, CPL 0, IDT at `IDT_BASE` with room for
/// 64 gates (all empty).
pub fn setup_protected(code: &[u8]) -> (CPU, Memory) {
    let mut memory = Memory::new(1024 * 1024);
    load(&mut memory, CODE, code);
    write_gdt(&mut memory);

    let mut cpu = CPU::new();
    cpu.set_gdtr(DescriptorTableRegister {
        base: GDT_BASE,
        limit: GDT_ENTRIES * 8 - 1,
    });
    cpu.set_idtr(DescriptorTableRegister {
        base: IDT_BASE,
        limit: 64 * 8 - 1,
    });
    let cr0 = cpu.control(0) | CR0_PE;
    cpu.write_control(&mut memory, 0, cr0).unwrap();
    cpu.load_segment(&mut memory, SegReg::Cs, CODE32_SEL as u32)
        .unwrap();
    for seg in [SegReg::Ds, SegReg::Es, SegReg::Ss] {
        cpu.load_segment(&mut memory, seg, DATA32_SEL as u32)
            .unwrap();
    }
    cpu.set_eip(CODE);
    cpu.set_reg(Register::Esp, STACK_TOP);
    (cpu, memory)
}

/// Step `n` instructions, panicking on host errors
pub fn run(cpu: &mut CPU, memory: &mut Memory, n: usize) {
    for _ in 0..n {
        cpu.step(memory).unwrap();
    }
}

/// Decode from a byte slice at offset 0
pub fn decode_bytes(bytes: &[u8], size32: bool) -> Result<Instruction> {
    decode(&mut &bytes[..], 0, size32, size32)
}

/// Pop a word off the real-mode stack without executing anything
pub fn stack_word(memory: &mut Memory, sp: u32) -> u32 {
    memory.read_physical(sp, 2).unwrap()
}
