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

use super::helpers::*;
use super::*;
use crate::core::cpu::flags::Flag;

fn ax(cpu: &CPU) -> u32 {
    cpu.reg(Register::Eax) & 0xFFFF
}

fn cf(cpu: &mut CPU) -> bool {
    cpu.flags_mut().test(Flag::Cf)
}

fn zf(cpu: &mut CPU) -> bool {
    cpu.flags_mut().test(Flag::Zf)
}

fn of(cpu: &mut CPU) -> bool {
    cpu.flags_mut().test(Flag::Of)
}

// ---------------------------------------------------------------------------
// Arithmetic and logic
// ---------------------------------------------------------------------------

#[test]
fn test_add_sets_carry_and_zero() {
    // mov ax, 0xFFFF; add ax, 1
    let (mut cpu, mut memory) = setup_real(&[0xB8, 0xFF, 0xFF, 0x05, 0x01, 0x00]);
    run(&mut cpu, &mut memory, 2);
    assert_eq!(ax(&cpu), 0);
    assert!(cf(&mut cpu));
    assert!(zf(&mut cpu));
}

#[test]
fn test_cmp_does_not_write() {
    // mov ax, 5; cmp ax, 5
    let (mut cpu, mut memory) = setup_real(&[0xB8, 0x05, 0x00, 0x3D, 0x05, 0x00]);
    run(&mut cpu, &mut memory, 2);
    assert_eq!(ax(&cpu), 5);
    assert!(zf(&mut cpu));
}

#[test]
fn test_test_does_not_write() {
    // mov al, 0xF0; test al, 0x0F
    let (mut cpu, mut memory) = setup_real(&[0xB0, 0xF0, 0xA8, 0x0F]);
    run(&mut cpu, &mut memory, 2);
    assert_eq!(ax(&cpu), 0xF0);
    assert!(zf(&mut cpu));
    assert!(!cf(&mut cpu));
}

#[test]
fn test_adc_and_sbb_use_carry() {
    // stc; mov al, 1; adc al, 1
    let (mut cpu, mut memory) = setup_real(&[0xF9, 0xB0, 0x01, 0x14, 0x01]);
    run(&mut cpu, &mut memory, 3);
    assert_eq!(ax(&cpu), 3);

    // stc; mov al, 5; sbb al, 2
    let (mut cpu, mut memory) = setup_real(&[0xF9, 0xB0, 0x05, 0x1C, 0x02]);
    run(&mut cpu, &mut memory, 3);
    assert_eq!(ax(&cpu), 2);
}

#[test]
fn test_logic_ops_on_memory() {
    // mov word [0x0200], 0x00FF; or word [0x0200], 0x0F00; xor ax, ax
    let code = [
        0xC7, 0x06, 0x00, 0x02, 0xFF, 0x00, // mov word [0x200], 0xFF
        0x81, 0x0E, 0x00, 0x02, 0x00, 0x0F, // or word [0x200], 0xF00
        0x31, 0xC0, // xor ax, ax
    ];
    let (mut cpu, mut memory) = setup_real(&code);
    run(&mut cpu, &mut memory, 3);
    assert_eq!(memory.read_physical(0x0200, 2).unwrap(), 0x0FFF);
    assert_eq!(ax(&cpu), 0);
    assert!(zf(&mut cpu));
}

#[test]
fn test_inc_dec_preserve_carry() {
    // stc; inc ax; dec bx
    let (mut cpu, mut memory) = setup_real(&[0xF9, 0x40, 0x4B]);
    run(&mut cpu, &mut memory, 3);
    assert_eq!(ax(&cpu), 1);
    assert_eq!(cpu.reg(Register::Ebx), 0xFFFF);
    assert!(cf(&mut cpu));
}

#[test]
fn test_neg_and_not() {
    // mov ax, 5; neg ax
    let (mut cpu, mut memory) = setup_real(&[0xB8, 0x05, 0x00, 0xF7, 0xD8, 0xF7, 0xD0]);
    run(&mut cpu, &mut memory, 2);
    assert_eq!(ax(&cpu), 0xFFFB);
    assert!(cf(&mut cpu));

    // not ax leaves flags alone
    run(&mut cpu, &mut memory, 1);
    assert_eq!(ax(&cpu), 0x0004);
    assert!(cf(&mut cpu));
}

// ---------------------------------------------------------------------------
// Data movement
// ---------------------------------------------------------------------------

#[test]
fn test_mov_through_memory() {
    // mov ax, 0xBEEF; mov [0x0200], ax; mov bx, [0x0200]
    let code = [0xB8, 0xEF, 0xBE, 0xA3, 0x00, 0x02, 0x8B, 0x1E, 0x00, 0x02];
    let (mut cpu, mut memory) = setup_real(&code);
    run(&mut cpu, &mut memory, 3);
    assert_eq!(memory.read_physical(0x0200, 2).unwrap(), 0xBEEF);
    assert_eq!(cpu.reg(Register::Ebx), 0xBEEF);
}

#[test]
fn test_mov_byte_registers() {
    // mov ah, 0x12; mov al, 0x34; mov bh, ah
    let (mut cpu, mut memory) = setup_real(&[0xB4, 0x12, 0xB0, 0x34, 0x88, 0xE7]);
    run(&mut cpu, &mut memory, 3);
    assert_eq!(ax(&cpu), 0x1234);
    assert_eq!(cpu.reg(Register::Ebx), 0x1200);
}

#[test]
fn test_movzx_and_movsx() {
    // mov bl, 0x80; movzx ax, bl; movsx cx, bl
    let code = [0xB3, 0x80, 0x0F, 0xB6, 0xC3, 0x0F, 0xBE, 0xCB];
    let (mut cpu, mut memory) = setup_real(&code);
    run(&mut cpu, &mut memory, 3);
    assert_eq!(ax(&cpu), 0x0080);
    assert_eq!(cpu.reg(Register::Ecx), 0xFF80);
}

#[test]
fn test_xchg_and_lea() {
    // mov ax, 1; mov bx, 2; xchg ax, bx; mov di, 0x20; lea si, [bx+di+0x10]
    let code = [
        0xB8, 0x01, 0x00, 0xBB, 0x02, 0x00, 0x93, 0xBF, 0x20, 0x00, 0x8D, 0x71, 0x10,
    ];
    let (mut cpu, mut memory) = setup_real(&code);
    run(&mut cpu, &mut memory, 5);
    assert_eq!(ax(&cpu), 2);
    assert_eq!(cpu.reg(Register::Ebx), 1);
    assert_eq!(cpu.reg(Register::Esi), 0x31);
}

#[test]
fn test_cbw_and_cwd() {
    // mov al, 0xF0; cbw; cwd
    let (mut cpu, mut memory) = setup_real(&[0xB0, 0xF0, 0x98, 0x99]);
    run(&mut cpu, &mut memory, 3);
    assert_eq!(ax(&cpu), 0xFFF0);
    assert_eq!(cpu.reg(Register::Edx), 0xFFFF);

    // cwde with an operand-size prefix
    let (mut cpu, mut memory) = setup_real(&[0xB8, 0x00, 0x80, 0x66, 0x98]);
    run(&mut cpu, &mut memory, 2);
    assert_eq!(cpu.reg(Register::Eax), 0xFFFF_8000);
}

#[test]
fn test_lahf_and_sahf() {
    // stc; lahf
    let (mut cpu, mut memory) = setup_real(&[0xF9, 0x9F, 0xB4, 0x00, 0x9E]);
    run(&mut cpu, &mut memory, 2);
    assert_eq!(ax(&cpu) >> 8, 0x03);

    // mov ah, 0; sahf
    run(&mut cpu, &mut memory, 2);
    assert!(!cf(&mut cpu));
}

#[test]
fn test_lds_loads_pointer() {
    // lds si, [0x0200]
    let (mut cpu, mut memory) = setup_real(&[0xC5, 0x36, 0x00, 0x02]);
    memory.write_physical(0x0200, 0x1234, 2).unwrap();
    memory.write_physical(0x0202, 0x5000, 2).unwrap();
    run(&mut cpu, &mut memory, 1);
    assert_eq!(cpu.reg(Register::Esi), 0x1234);
    assert_eq!(cpu.segment(SegReg::Ds).value(), 0x5000);
    assert_eq!(cpu.segment(SegReg::Ds).base(), 0x50000);
}

#[test]
fn test_setcc() {
    // stc; setc al; setz bl
    let (mut cpu, mut memory) = setup_real(&[0xF9, 0x0F, 0x92, 0xC0, 0x0F, 0x94, 0xC3]);
    cpu.set_reg(Register::Ebx, 0xFF);
    run(&mut cpu, &mut memory, 3);
    assert_eq!(ax(&cpu), 1);
    assert_eq!(cpu.reg(Register::Ebx), 0);
}

// ---------------------------------------------------------------------------
// Stack
// ---------------------------------------------------------------------------

#[test]
fn test_push_pop() {
    // mov ax, 0x1234; push ax; pop bx
    let (mut cpu, mut memory) = setup_real(&[0xB8, 0x34, 0x12, 0x50, 0x5B]);
    run(&mut cpu, &mut memory, 2);
    assert_eq!(cpu.reg(Register::Esp), STACK_TOP - 2);
    assert_eq!(stack_word(&mut memory, STACK_TOP - 2), 0x1234);

    run(&mut cpu, &mut memory, 1);
    assert_eq!(cpu.reg(Register::Ebx), 0x1234);
    assert_eq!(cpu.reg(Register::Esp), STACK_TOP);
}

#[test]
fn test_push_immediate_and_memory() {
    // push 0x7F; push -2; push word [0x0200]
    let (mut cpu, mut memory) = setup_real(&[0x6A, 0x7F, 0x6A, 0xFE, 0xFF, 0x36, 0x00, 0x02]);
    memory.write_physical(0x0200, 0xCAFE, 2).unwrap();
    run(&mut cpu, &mut memory, 3);
    assert_eq!(stack_word(&mut memory, STACK_TOP - 2), 0x007F);
    assert_eq!(stack_word(&mut memory, STACK_TOP - 4), 0xFFFE);
    assert_eq!(stack_word(&mut memory, STACK_TOP - 6), 0xCAFE);
}

#[test]
fn test_push_segment_with_32_bit_operand() {
    // push ds (o32); pop es (o32)
    let (mut cpu, mut memory) = setup_real(&[0x66, 0x1E, 0x66, 0x07]);
    cpu.load_segment(&mut memory, SegReg::Ds, 0x1234).unwrap();
    run(&mut cpu, &mut memory, 1);
    assert_eq!(cpu.reg(Register::Esp), STACK_TOP - 4);

    run(&mut cpu, &mut memory, 1);
    assert_eq!(cpu.reg(Register::Esp), STACK_TOP);
    assert_eq!(cpu.segment(SegReg::Es).value(), 0x1234);
}

#[test]
fn test_stack_pointer_wraps_in_16_bit_stack() {
    // push ax with SP = 0
    let (mut cpu, mut memory) = setup_real(&[0x50]);
    cpu.load_segment(&mut memory, SegReg::Ss, 0x1000).unwrap();
    cpu.set_reg(Register::Esp, 0xABCD_0000);
    cpu.set_reg(Register::Eax, 0x5A5A);
    run(&mut cpu, &mut memory, 1);
    assert_eq!(cpu.reg(Register::Esp), 0xABCD_FFFE);
    assert_eq!(memory.read_physical(0x1FFFE, 2).unwrap(), 0x5A5A);
}

#[test]
fn test_pusha_popa() {
    // pusha; popa
    let (mut cpu, mut memory) = setup_real(&[0x60, 0x61]);
    let values = [0x11, 0x22, 0x33, 0x44, STACK_TOP, 0x66, 0x77, 0x88];
    for (reg, value) in Register::ALL.into_iter().zip(values) {
        cpu.set_reg(reg, value);
    }

    run(&mut cpu, &mut memory, 1);
    assert_eq!(cpu.reg(Register::Esp), STACK_TOP - 16);
    // AX first, DI last; the pushed SP is the original value
    assert_eq!(stack_word(&mut memory, STACK_TOP - 2), 0x11);
    assert_eq!(stack_word(&mut memory, STACK_TOP - 10), STACK_TOP);
    assert_eq!(stack_word(&mut memory, STACK_TOP - 16), 0x88);

    for reg in Register::ALL {
        if reg != Register::Esp {
            cpu.set_reg(reg, 0);
        }
    }
    run(&mut cpu, &mut memory, 1);
    for (reg, value) in Register::ALL.into_iter().zip(values) {
        assert_eq!(cpu.reg(reg), value, "{:?}", reg);
    }
}

#[test]
fn test_pushf_popf() {
    // stc; pushf; pop ax; mov ax, 0x0400; push ax; popf
    let code = [0xF9, 0x9C, 0x58, 0xB8, 0x00, 0x04, 0x50, 0x9D];
    let (mut cpu, mut memory) = setup_real(&code);
    run(&mut cpu, &mut memory, 3);
    assert_eq!(ax(&cpu), 0x0003);

    run(&mut cpu, &mut memory, 3);
    assert!(!cf(&mut cpu));
    assert!(cpu.flags().contains(Eflags::DF));
}

#[test]
fn test_leave() {
    // mov bp, sp; sub sp, 8; push ax; leave
    let code = [0x89, 0xE5, 0x83, 0xEC, 0x08, 0x50, 0xC9];
    let (mut cpu, mut memory) = setup_real(&code);
    // saved BP
    memory.write_physical(STACK_TOP, 0x4321, 2).unwrap();
    run(&mut cpu, &mut memory, 4);
    assert_eq!(cpu.reg(Register::Esp), STACK_TOP + 2);
    assert_eq!(cpu.reg(Register::Ebp), 0x4321);
}

// ---------------------------------------------------------------------------
// Control transfer
// ---------------------------------------------------------------------------

#[test]
fn test_conditional_jump() {
    // xor ax, ax; jz +2; mov al, 1; nop
    let (mut cpu, mut memory) = setup_real(&[0x31, 0xC0, 0x74, 0x02, 0xB0, 0x01, 0x90]);
    run(&mut cpu, &mut memory, 2);
    assert_eq!(cpu.eip(), CODE + 6);

    // inc ax; jz +2 falls through
    let (mut cpu, mut memory) = setup_real(&[0x40, 0x74, 0x02, 0xB0, 0x01]);
    run(&mut cpu, &mut memory, 3);
    assert_eq!(ax(&cpu), 1);
    assert_eq!(cpu.eip(), CODE + 5);
}

#[test]
fn test_short_jump_to_self() {
    let (mut cpu, mut memory) = setup_real(&[0xEB, 0xFE]);
    run(&mut cpu, &mut memory, 5);
    assert_eq!(cpu.eip(), CODE);
    assert_eq!(cpu.instruction_count(), 5);
}

#[test]
fn test_near_jump_wraps_ip() {
    // jmp near -0x1004 from 0x1000 lands at 0xFFFF
    let (mut cpu, mut memory) = setup_real(&[0xE9, 0xFC, 0xEF]);
    run(&mut cpu, &mut memory, 1);
    assert_eq!(cpu.eip(), 0xFFFF);
}

#[test]
fn test_call_and_ret() {
    // call +3; hlt; nop; nop; ret
    let (mut cpu, mut memory) = setup_real(&[0xE8, 0x03, 0x00, 0xF4, 0x90, 0x90, 0xC3]);
    run(&mut cpu, &mut memory, 1);
    assert_eq!(cpu.eip(), CODE + 6);
    assert_eq!(stack_word(&mut memory, STACK_TOP - 2), CODE + 3);

    run(&mut cpu, &mut memory, 1);
    assert_eq!(cpu.eip(), CODE + 3);
    assert_eq!(cpu.reg(Register::Esp), STACK_TOP);
}

#[test]
fn test_ret_with_immediate() {
    // ret 4
    let (mut cpu, mut memory) = setup_real(&[0xC2, 0x04, 0x00]);
    memory.write_physical(STACK_TOP, 0x2000, 2).unwrap();
    run(&mut cpu, &mut memory, 1);
    assert_eq!(cpu.eip(), 0x2000);
    assert_eq!(cpu.reg(Register::Esp), STACK_TOP + 6);
}

#[test]
fn test_indirect_call() {
    // mov bx, 0x1010; call bx
    let (mut cpu, mut memory) = setup_real(&[0xBB, 0x10, 0x10, 0xFF, 0xD3]);
    run(&mut cpu, &mut memory, 2);
    assert_eq!(cpu.eip(), 0x1010);
    assert_eq!(stack_word(&mut memory, STACK_TOP - 2), CODE + 5);
}

#[test]
fn test_far_jump_real_mode() {
    // jmp 0x0100:0x0200
    let (mut cpu, mut memory) = setup_real(&[0xEA, 0x00, 0x02, 0x00, 0x01]);
    run(&mut cpu, &mut memory, 1);
    assert_eq!(cpu.segment(SegReg::Cs).value(), 0x0100);
    assert_eq!(cpu.segment(SegReg::Cs).base(), 0x1000);
    assert_eq!(cpu.eip(), 0x0200);
}

#[test]
fn test_far_call_and_retf() {
    // call 0x0200:0x0000 ... retf at physical 0x2000
    let (mut cpu, mut memory) = setup_real(&[0x9A, 0x00, 0x00, 0x00, 0x02]);
    load(&mut memory, 0x2000, &[0xCB]);

    run(&mut cpu, &mut memory, 1);
    assert_eq!(cpu.segment(SegReg::Cs).value(), 0x0200);
    assert_eq!(cpu.eip(), 0);
    assert_eq!(stack_word(&mut memory, STACK_TOP - 2), 0);
    assert_eq!(stack_word(&mut memory, STACK_TOP - 4), CODE + 5);

    run(&mut cpu, &mut memory, 1);
    assert_eq!(cpu.segment(SegReg::Cs).value(), 0);
    assert_eq!(cpu.eip(), CODE + 5);
    assert_eq!(cpu.reg(Register::Esp), STACK_TOP);
}

#[test]
fn test_indirect_far_jump() {
    // jmp far [0x0300]
    let (mut cpu, mut memory) = setup_real(&[0xFF, 0x2E, 0x00, 0x03]);
    memory.write_physical(0x0300, 0x0010, 2).unwrap();
    memory.write_physical(0x0302, 0x0300, 2).unwrap();
    run(&mut cpu, &mut memory, 1);
    assert_eq!(cpu.segment(SegReg::Cs).value(), 0x0300);
    assert_eq!(cpu.eip(), 0x0010);
}

#[test]
fn test_loop() {
    // mov cx, 3; l: inc ax; loop l
    let (mut cpu, mut memory) = setup_real(&[0xB9, 0x03, 0x00, 0x40, 0xE2, 0xFD]);
    run(&mut cpu, &mut memory, 7);
    assert_eq!(ax(&cpu), 3);
    assert_eq!(cpu.reg(Register::Ecx), 0);
    assert_eq!(cpu.eip(), CODE + 6);
}

#[test]
fn test_loopne_stops_on_zero() {
    // mov cx, 10; l: dec ax; loopne l   (AX = 2)
    let (mut cpu, mut memory) = setup_real(&[0xB9, 0x0A, 0x00, 0x48, 0xE0, 0xFD]);
    cpu.set_reg(Register::Eax, 2);
    run(&mut cpu, &mut memory, 5);
    assert_eq!(ax(&cpu), 0);
    assert_eq!(cpu.reg(Register::Ecx), 8);
    assert_eq!(cpu.eip(), CODE + 6);
}

#[test]
fn test_jcxz() {
    // xor cx, cx; jcxz +1; nop; nop
    let (mut cpu, mut memory) = setup_real(&[0x31, 0xC9, 0xE3, 0x01, 0x90, 0x90]);
    run(&mut cpu, &mut memory, 2);
    assert_eq!(cpu.eip(), CODE + 5);
}

// ---------------------------------------------------------------------------
// String instructions
// ---------------------------------------------------------------------------

fn string_setup(code: &[u8]) -> (CPU, Memory) {
    let (mut cpu, mut memory) = setup_real(code);
    load(&mut memory, 0x0300, &[0x11, 0x22, 0x33, 0x44]);
    cpu.set_reg(Register::Esi, 0x0300);
    cpu.set_reg(Register::Edi, 0x0400);
    (cpu, memory)
}

#[test]
fn test_rep_movsb_one_iteration_per_step() {
    let (mut cpu, mut memory) = string_setup(&[0xF3, 0xA4]);
    cpu.set_reg(Register::Ecx, 4);

    run(&mut cpu, &mut memory, 2);
    assert_eq!(cpu.eip(), CODE);
    assert_eq!(cpu.reg(Register::Ecx), 2);

    run(&mut cpu, &mut memory, 2);
    assert_eq!(cpu.eip(), CODE + 2);
    assert_eq!(cpu.reg(Register::Ecx), 0);
    assert_eq!(cpu.reg(Register::Esi), 0x0304);
    assert_eq!(cpu.reg(Register::Edi), 0x0404);
    assert_eq!(memory.read_physical(0x0400, 4).unwrap(), 0x44332211);
}

#[test]
fn test_rep_with_zero_count_does_nothing() {
    let (mut cpu, mut memory) = string_setup(&[0xF3, 0xA4]);
    run(&mut cpu, &mut memory, 1);
    assert_eq!(cpu.eip(), CODE + 2);
    assert_eq!(cpu.reg(Register::Esi), 0x0300);
    assert_eq!(memory.read_physical(0x0400, 1).unwrap(), 0);
}

#[test]
fn test_movsw_backwards() {
    // std; movsw
    let (mut cpu, mut memory) = string_setup(&[0xFD, 0xA5]);
    run(&mut cpu, &mut memory, 2);
    assert_eq!(memory.read_physical(0x0400, 2).unwrap(), 0x2211);
    assert_eq!(cpu.reg(Register::Esi), 0x02FE);
    assert_eq!(cpu.reg(Register::Edi), 0x03FE);
}

#[test]
fn test_repne_scasb_finds_byte() {
    // mov al, 0x33; repne scasb
    let (mut cpu, mut memory) = string_setup(&[0xB0, 0x33, 0xF2, 0xAE]);
    cpu.set_reg(Register::Edi, 0x0300);
    cpu.set_reg(Register::Ecx, 4);
    run(&mut cpu, &mut memory, 4);
    assert_eq!(cpu.eip(), CODE + 4);
    assert_eq!(cpu.reg(Register::Edi), 0x0303);
    assert_eq!(cpu.reg(Register::Ecx), 1);
    assert!(zf(&mut cpu));
}

#[test]
fn test_repe_cmpsb_stops_on_mismatch() {
    let (mut cpu, mut memory) = string_setup(&[0xF3, 0xA6]);
    load(&mut memory, 0x0400, &[0x11, 0x22, 0x00, 0x44]);
    cpu.set_reg(Register::Ecx, 4);
    run(&mut cpu, &mut memory, 3);
    assert_eq!(cpu.eip(), CODE + 2);
    assert_eq!(cpu.reg(Register::Ecx), 1);
    assert!(!zf(&mut cpu));
}

#[test]
fn test_stos_and_lods() {
    // mov ax, 0xABCD; stosw; lodsb
    let (mut cpu, mut memory) = string_setup(&[0xB8, 0xCD, 0xAB, 0xAB, 0xAC]);
    run(&mut cpu, &mut memory, 3);
    assert_eq!(memory.read_physical(0x0400, 2).unwrap(), 0xABCD);
    assert_eq!(cpu.reg(Register::Edi), 0x0402);
    assert_eq!(ax(&cpu), 0xAB11);
    assert_eq!(cpu.reg(Register::Esi), 0x0301);
}

// ---------------------------------------------------------------------------
// Shifts and rotates
// ---------------------------------------------------------------------------

/// mov al, `value`; <op> al, 1
fn shift_al(value: u8, modrm: u8, carry_in: bool) -> CPU {
    let (mut cpu, mut memory) = setup_real(&[0xB0, value, 0xD0, modrm]);
    cpu.flags_mut().set_bin(Flag::Cf, carry_in);
    run(&mut cpu, &mut memory, 2);
    cpu
}

#[test]
fn test_shl_shr_sar() {
    let mut cpu = shift_al(0x81, 0xE0, false);
    assert_eq!(ax(&cpu), 0x02);
    assert!(cf(&mut cpu));
    assert!(of(&mut cpu));

    let mut cpu = shift_al(0x81, 0xE8, false);
    assert_eq!(ax(&cpu), 0x40);
    assert!(cf(&mut cpu));
    assert!(of(&mut cpu));

    let mut cpu = shift_al(0x81, 0xF8, false);
    assert_eq!(ax(&cpu), 0xC0);
    assert!(cf(&mut cpu));
    assert!(!of(&mut cpu));
}

#[test]
fn test_rotates() {
    let mut cpu = shift_al(0x81, 0xC0, false);
    assert_eq!(ax(&cpu), 0x03);
    assert!(cf(&mut cpu));

    let mut cpu = shift_al(0x81, 0xC8, false);
    assert_eq!(ax(&cpu), 0xC0);
    assert!(cf(&mut cpu));

    let mut cpu = shift_al(0x80, 0xD0, true);
    assert_eq!(ax(&cpu), 0x01);
    assert!(cf(&mut cpu));

    let mut cpu = shift_al(0x01, 0xD8, true);
    assert_eq!(ax(&cpu), 0x80);
    assert!(cf(&mut cpu));
}

#[test]
fn test_shift_by_immediate_and_cl() {
    // mov ax, 0x8001; sar ax, 4
    let (mut cpu, mut memory) = setup_real(&[0xB8, 0x01, 0x80, 0xC1, 0xF8, 0x04]);
    run(&mut cpu, &mut memory, 2);
    assert_eq!(ax(&cpu), 0xF800);

    // mov cl, 33; mov eax, 1 (o32); shl eax, cl (o32): count masked to 1
    let code = [0xB1, 0x21, 0x66, 0xB8, 0x01, 0x00, 0x00, 0x00, 0x66, 0xD3, 0xE0];
    let (mut cpu, mut memory) = setup_real(&code);
    run(&mut cpu, &mut memory, 3);
    assert_eq!(cpu.reg(Register::Eax), 2);
}

#[test]
fn test_zero_count_shift_keeps_flags() {
    // stc; mov cl, 0; shl ax, cl
    let (mut cpu, mut memory) = setup_real(&[0xF9, 0xB1, 0x00, 0xD3, 0xE0]);
    cpu.set_reg(Register::Eax, 0x8000);
    run(&mut cpu, &mut memory, 3);
    assert_eq!(ax(&cpu), 0x8000);
    assert!(cf(&mut cpu));
}

// ---------------------------------------------------------------------------
// Multiply and divide
// ---------------------------------------------------------------------------

#[test]
fn test_mul() {
    // mov al, 0x10; mov bl, 0x10; mul bl
    let (mut cpu, mut memory) = setup_real(&[0xB0, 0x10, 0xB3, 0x10, 0xF6, 0xE3]);
    run(&mut cpu, &mut memory, 3);
    assert_eq!(ax(&cpu), 0x0100);
    assert!(cf(&mut cpu));
    assert!(of(&mut cpu));

    // mov ax, 0x1000; mov bx, 0x10; mul bx
    let (mut cpu, mut memory) = setup_real(&[0xB8, 0x00, 0x10, 0xBB, 0x10, 0x00, 0xF7, 0xE3]);
    run(&mut cpu, &mut memory, 3);
    assert_eq!(ax(&cpu), 0);
    assert_eq!(cpu.reg(Register::Edx), 1);
}

#[test]
fn test_imul_forms() {
    // mov al, -1; mov bl, 2; imul bl
    let (mut cpu, mut memory) = setup_real(&[0xB0, 0xFF, 0xB3, 0x02, 0xF6, 0xEB]);
    run(&mut cpu, &mut memory, 3);
    assert_eq!(ax(&cpu), 0xFFFE);
    assert!(!cf(&mut cpu));

    // mov bx, 7; imul ax, bx, -3
    let (mut cpu, mut memory) = setup_real(&[0xBB, 0x07, 0x00, 0x6B, 0xC3, 0xFD]);
    run(&mut cpu, &mut memory, 2);
    assert_eq!(ax(&cpu), (-21i16) as u16 as u32);

    // mov ax, 0x4000; mov bx, 4; imul ax, bx overflows 16 bits
    let (mut cpu, mut memory) = setup_real(&[0xB8, 0x00, 0x40, 0xBB, 0x04, 0x00, 0x0F, 0xAF, 0xC3]);
    run(&mut cpu, &mut memory, 3);
    assert_eq!(ax(&cpu), 0);
    assert!(cf(&mut cpu));
    assert!(of(&mut cpu));
}

#[test]
fn test_div_and_idiv() {
    // mov ax, 100; mov bl, 7; div bl
    let (mut cpu, mut memory) = setup_real(&[0xB8, 0x64, 0x00, 0xB3, 0x07, 0xF6, 0xF3]);
    run(&mut cpu, &mut memory, 3);
    assert_eq!(ax(&cpu), 0x020E);

    // mov ax, -7; mov bl, 2; idiv bl
    let (mut cpu, mut memory) = setup_real(&[0xB8, 0xF9, 0xFF, 0xB3, 0x02, 0xF6, 0xFB]);
    run(&mut cpu, &mut memory, 3);
    assert_eq!(ax(&cpu), 0xFFFD);

    // dx:ax = 0x0001_0000; bx = 0x10; div bx
    let (mut cpu, mut memory) = setup_real(&[0xBB, 0x10, 0x00, 0xF7, 0xF3]);
    cpu.set_reg(Register::Edx, 1);
    run(&mut cpu, &mut memory, 2);
    assert_eq!(ax(&cpu), 0x1000);
    assert_eq!(cpu.reg(Register::Edx), 0);
}

// ---------------------------------------------------------------------------
// System instructions
// ---------------------------------------------------------------------------

#[test]
fn test_flag_instructions() {
    // stc; cmc; std; cld; sti; cli
    let (mut cpu, mut memory) = setup_real(&[0xF9, 0xF5, 0xFD, 0xFC, 0xFB, 0xFA]);
    run(&mut cpu, &mut memory, 2);
    assert!(!cf(&mut cpu));
    run(&mut cpu, &mut memory, 1);
    assert!(cpu.flags().contains(Eflags::DF));
    run(&mut cpu, &mut memory, 1);
    assert!(!cpu.flags().contains(Eflags::DF));

    run(&mut cpu, &mut memory, 1);
    assert!(cpu.flags().contains(Eflags::IF));
    // interrupts stay off until after the next instruction
    assert!(!cpu.interrupts_enabled());

    run(&mut cpu, &mut memory, 1);
    assert!(!cpu.flags().contains(Eflags::IF));
}

#[test]
fn test_lgdt_and_sgdt() {
    // lgdt [0x0200]; sgdt [0x0300]
    let code = [0x0F, 0x01, 0x16, 0x00, 0x02, 0x0F, 0x01, 0x06, 0x00, 0x03];
    let (mut cpu, mut memory) = setup_real(&code);
    memory.write_physical(0x0200, 0x0027, 2).unwrap();
    memory.write_physical(0x0202, 0xAB12_3456, 4).unwrap();

    run(&mut cpu, &mut memory, 1);
    // 16-bit operand size keeps 24 bits of base
    assert_eq!(cpu.gdtr().base, 0x0012_3456);
    assert_eq!(cpu.gdtr().limit, 0x27);

    run(&mut cpu, &mut memory, 1);
    assert_eq!(memory.read_physical(0x0300, 2).unwrap(), 0x27);
    assert_eq!(memory.read_physical(0x0302, 4).unwrap(), 0x0012_3456);
}

#[test]
fn test_lidt() {
    // lidt [0x0200] (o32)
    let (mut cpu, mut memory) = setup_real(&[0x66, 0x0F, 0x01, 0x1E, 0x00, 0x02]);
    memory.write_physical(0x0200, 0x07FF, 2).unwrap();
    memory.write_physical(0x0202, 0xAB12_3456, 4).unwrap();
    run(&mut cpu, &mut memory, 1);
    assert_eq!(cpu.idtr().base, 0xAB12_3456);
    assert_eq!(cpu.idtr().limit, 0x07FF);
}

#[test]
fn test_lmsw_enters_protected_mode_but_cannot_leave() {
    // mov ax, 1; lmsw ax; xor ax, ax; lmsw ax; smsw bx
    let code = [0xB8, 0x01, 0x00, 0x0F, 0x01, 0xF0, 0x31, 0xC0, 0x0F, 0x01, 0xF0, 0x0F, 0x01, 0xE3];
    let (mut cpu, mut memory) = setup_real(&code);
    run(&mut cpu, &mut memory, 2);
    assert_eq!(cpu.mode(), CpuMode::Protected);

    run(&mut cpu, &mut memory, 3);
    assert_eq!(cpu.mode(), CpuMode::Protected);
    assert_eq!(cpu.reg(Register::Ebx) & 0x1, 1);
    assert_ne!(cpu.reg(Register::Ebx) & CR0_ET, 0);
}

#[test]
fn test_mov_control_registers() {
    // mov eax, cr0; or al, 1; mov cr0, eax; mov eax, 0x1234; mov cr3, eax
    let code = [
        0x0F, 0x20, 0xC0, 0x0C, 0x01, 0x0F, 0x22, 0xC0, 0x66, 0xB8, 0x34, 0x12, 0x00, 0x00,
        0x0F, 0x22, 0xD8,
    ];
    let (mut cpu, mut memory) = setup_real(&code);
    run(&mut cpu, &mut memory, 3);
    assert_eq!(cpu.mode(), CpuMode::Protected);
    assert_eq!(cpu.control(0), CR0_ET | CR0_PE);

    run(&mut cpu, &mut memory, 2);
    assert_eq!(cpu.control(3), 0x1234);
}

#[test]
fn test_mov_from_segment_register() {
    // mov ax, 0x1234; mov ds, ax; mov bx, ds; mov ecx, ds; mov [0x0100], ds (o32)
    let code = [
        0xB8, 0x34, 0x12, 0x8E, 0xD8, 0x8C, 0xDB, 0x66, 0x8C, 0xD9, 0x66, 0x8C, 0x1E, 0x00,
        0x01,
    ];
    let (mut cpu, mut memory) = setup_real(&code);
    cpu.set_reg(Register::Ebx, 0xFFFF_FFFF);
    cpu.set_reg(Register::Ecx, 0xFFFF_FFFF);
    memory.write_physical(0x12440, 0xAABB_CCDD, 4).unwrap();

    run(&mut cpu, &mut memory, 5);
    assert_eq!(cpu.reg(Register::Ebx), 0xFFFF_1234);
    assert_eq!(cpu.reg(Register::Ecx), 0x1234);
    assert_eq!(memory.read_physical(0x12440, 4).unwrap(), 0xAABB_1234);
}

#[test]
fn test_clearing_pe_returns_to_real_mode() {
    let (mut cpu, mut memory) = setup_protected(&[]);
    let cr0 = cpu.control(0) & !CR0_PE;
    cpu.write_control(&mut memory, 0, cr0).unwrap();
    assert_eq!(cpu.mode(), CpuMode::Real);
    // ET is hardwired
    cpu.write_control(&mut memory, 0, 0).unwrap();
    assert_eq!(cpu.control(0), CR0_ET);
}

#[test]
fn test_clts() {
    let (mut cpu, mut memory) = setup_real(&[0x0F, 0x06]);
    let cr0 = cpu.control(0) | CR0_TS;
    cpu.write_control(&mut memory, 0, cr0).unwrap();
    run(&mut cpu, &mut memory, 1);
    assert_eq!(cpu.control(0) & CR0_TS, 0);
}

#[test]
fn test_lldt_and_ldt_selectors() {
    // mov ax, LDT_SEL; lldt ax; sldt bx; mov ax, 0x000C; mov ds, ax
    let code = [
        0x66, 0xB8, LDT_SEL as u8, 0x00, 0x0F, 0x00, 0xD0, 0x0F, 0x00, 0xC3, 0x66, 0xB8, 0x0C,
        0x00, 0x8E, 0xD8,
    ];
    let (mut cpu, mut memory) = setup_protected(&code);
    // LDT entry 1: data segment at 0x4000
    write_u64(&mut memory, 0x3008, descriptor(0x4000, 0xFFFF, 0x92, 0x4));

    run(&mut cpu, &mut memory, 2);
    assert_eq!(cpu.ldtr().base, 0x3000);
    assert_eq!(cpu.ldtr().limit, 0x17);

    run(&mut cpu, &mut memory, 1);
    assert_eq!(cpu.reg(Register::Ebx) & 0xFFFF, LDT_SEL as u32);

    run(&mut cpu, &mut memory, 2);
    assert_eq!(cpu.segment(SegReg::Ds).value(), 0x000C);
    assert_eq!(cpu.segment(SegReg::Ds).base(), 0x4000);
}

#[test]
fn test_lldt_with_null_selector_clears_ldtr() {
    // xor eax, eax; lldt ax
    let (mut cpu, mut memory) = setup_protected(&[0x31, 0xC0, 0x0F, 0x00, 0xD0]);
    cpu.ldtr = DescriptorTableRegister {
        base: 0x3000,
        limit: 0x17,
    };
    run(&mut cpu, &mut memory, 2);
    assert_eq!(cpu.ldtr(), DescriptorTableRegister::default());
}

#[test]
fn test_protected_mode_32_bit_code() {
    // mov eax, 0x12345678; push eax; pop ebx; add ebx, 8
    let code = [0xB8, 0x78, 0x56, 0x34, 0x12, 0x50, 0x5B, 0x83, 0xC3, 0x08];
    let (mut cpu, mut memory) = setup_protected(&code);
    run(&mut cpu, &mut memory, 2);
    assert_eq!(cpu.reg(Register::Esp), STACK_TOP - 4);
    assert_eq!(memory.read_physical(STACK_TOP - 4, 4).unwrap(), 0x12345678);

    run(&mut cpu, &mut memory, 2);
    assert_eq!(cpu.reg(Register::Ebx), 0x12345680);
    assert_eq!(cpu.eip(), CODE + code.len() as u32);
}

#[test]
fn test_protected_mode_far_jump_to_16_bit_code() {
    // jmp 0x0018:0x00002000 (32-bit form)
    let code = [0xEA, 0x00, 0x20, 0x00, 0x00, 0x18, 0x00];
    let (mut cpu, mut memory) = setup_protected(&code);
    // mov ax, 0x1234 as 16-bit code
    load(&mut memory, 0x2000, &[0xB8, 0x34, 0x12]);

    run(&mut cpu, &mut memory, 1);
    assert_eq!(cpu.segment(SegReg::Cs).value(), CODE16_SEL);
    assert!(!cpu.segment(SegReg::Cs).cache().default_big);
    assert_eq!(cpu.eip(), 0x2000);

    run(&mut cpu, &mut memory, 1);
    assert_eq!(cpu.reg(Register::Eax), 0x1234);
    assert_eq!(cpu.eip(), 0x2003);
}

#[test]
fn test_string_ops_with_32_bit_addressing() {
    // rep stosd in flat 32-bit mode
    let (mut cpu, mut memory) = setup_protected(&[0xF3, 0xAB]);
    cpu.set_reg(Register::Eax, 0xDEADBEEF);
    cpu.set_reg(Register::Edi, 0x0001_0000);
    cpu.set_reg(Register::Ecx, 3);
    run(&mut cpu, &mut memory, 3);
    assert_eq!(cpu.reg(Register::Edi), 0x0001_000C);
    assert_eq!(memory.read_physical(0x0001_0008, 4).unwrap(), 0xDEADBEEF);
    assert_eq!(cpu.eip(), CODE + 2);
}
