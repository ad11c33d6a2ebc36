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

//! Test ROM images and small real-mode/protected-mode programs
//!
//! Programs are placed at physical 0xF0000 (F000:0000) and entered through
//! the far jump installed at the reset vector.

/// Physical address programs are loaded at
pub const PROGRAM_BASE: u32 = 0xF0000;

/// Physical address of the reset vector
pub const RESET_VECTOR: u32 = 0xFFFF0;

/// `jmp far segment:offset`
#[allow(dead_code)]
pub fn reset_jump(segment: u16, offset: u16) -> Vec<u8> {
    let mut code = vec![0xEA];
    code.extend_from_slice(&offset.to_le_bytes());
    code.extend_from_slice(&segment.to_le_bytes());
    code
}

/// Test program: register arithmetic (AX = 5)
#[allow(dead_code)]
pub fn test_program_arithmetic() -> Vec<u8> {
    vec![
        0xB8, 0x02, 0x00, // mov ax, 2
        0xBB, 0x03, 0x00, // mov bx, 3
        0x01, 0xD8, // add ax, bx
        0xF4, // hlt
    ]
}

/// Test program: LOOP counting to 100 in AX
///
/// Executes 203 instructions including the final HLT.
#[allow(dead_code)]
pub fn test_program_counting_loop() -> Vec<u8> {
    vec![
        0xB9, 0x64, 0x00, // mov cx, 100
        0x31, 0xC0, // xor ax, ax
        0x40, // inc ax
        0xE2, 0xFD, // loop -3
        0xF4, // hlt
    ]
}

/// Test program: real-mode stack and memory traffic
///
/// Sets SS:SP = 0000:8000, DS = 0x1000 and stores 0xBEEF at DS:0x0010
/// (physical 0x10010) through a PUSH/POP pair.
#[allow(dead_code)]
pub fn test_program_stack_memory() -> Vec<u8> {
    vec![
        0x31, 0xC0, // xor ax, ax
        0x8E, 0xD0, // mov ss, ax
        0xBC, 0x00, 0x80, // mov sp, 0x8000
        0xB8, 0x00, 0x10, // mov ax, 0x1000
        0x8E, 0xD8, // mov ds, ax
        0x68, 0xEF, 0xBE, // push 0xBEEF
        0x8F, 0x06, 0x10, 0x00, // pop word [0x0010]
        0xF4, // hlt
    ]
}

/// Physical address the protected-mode program stores EAX at
pub const PROTECTED_STORE_ADDRESS: u32 = 0x0001_0000;

/// Test program: switch to 32-bit protected mode with a flat GDT
///
/// The image occupies F000:0000..F000:0120. It loads a three-entry GDT
/// (null, flat 32-bit code 0x08, flat data 0x10), sets CR0.PE, far jumps
/// into 32-bit code, loads DS/SS, stores 0x12345678 at 0x10000, round-trips
/// EAX through the stack into EBX and halts. Sixteen instructions counting
/// the reset jump and the HLT.
#[allow(dead_code)]
pub fn test_program_protected_mode() -> Vec<u8> {
    let mut image = vec![0x90u8; 0x120];

    let real_mode = [
        0xFA, // cli
        0x2E, 0x0F, 0x01, 0x16, 0x00, 0x01, // lgdt cs:[0x0100]
        0x0F, 0x20, 0xC0, // mov eax, cr0
        0x0C, 0x01, // or al, 1
        0x0F, 0x22, 0xC0, // mov cr0, eax
        0x66, 0xEA, 0x40, 0x00, 0x0F, 0x00, 0x08, 0x00, // jmp dword 0x08:0x000F0040
    ];
    image[..real_mode.len()].copy_from_slice(&real_mode);

    let protected = [
        0x66, 0xB8, 0x10, 0x00, // mov ax, 0x10
        0x8E, 0xD8, // mov ds, ax
        0x8E, 0xD0, // mov ss, ax
        0xBC, 0x00, 0x00, 0x09, 0x00, // mov esp, 0x90000
        0xB8, 0x78, 0x56, 0x34, 0x12, // mov eax, 0x12345678
        0x50, // push eax
        0xA3, 0x00, 0x00, 0x01, 0x00, // mov [0x10000], eax
        0x5B, // pop ebx
        0xF4, // hlt
    ];
    image[0x40..0x40 + protected.len()].copy_from_slice(&protected);

    // GDT pseudo-descriptor: limit 0x17, base 0x000F0108
    image[0x100..0x106].copy_from_slice(&[0x17, 0x00, 0x08, 0x01, 0x0F, 0x00]);

    // Descriptors are pre-marked accessed; the table lives in ROM
    let gdt: [[u8; 8]; 3] = [
        [0; 8],
        [0xFF, 0xFF, 0x00, 0x00, 0x00, 0x9B, 0xCF, 0x00],
        [0xFF, 0xFF, 0x00, 0x00, 0x00, 0x93, 0xCF, 0x00],
    ];
    for (i, descriptor) in gdt.iter().enumerate() {
        let at = 0x108 + i * 8;
        image[at..at + 8].copy_from_slice(descriptor);
    }

    image
}

/// A 64 KiB BIOS image: `program` at its start, reset jump to F000:0000
#[allow(dead_code)]
pub fn bios_image(program: &[u8]) -> Vec<u8> {
    let mut image = vec![0xF4u8; 64 * 1024];
    image[..program.len()].copy_from_slice(program);
    let jump = reset_jump(0xF000, 0x0000);
    image[0xFFF0..0xFFF0 + jump.len()].copy_from_slice(&jump);
    image
}
