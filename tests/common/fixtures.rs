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

//! Test fixtures for common test scenarios

use super::test_roms::{reset_jump, PROGRAM_BASE, RESET_VECTOR};
use pcx::core::config::MachineConfig;
use pcx::core::system::System;
use std::io::Write;
use tempfile::NamedTempFile;

/// Configuration with the smallest DRAM size, for fast tests
#[allow(dead_code)]
pub fn small_config() -> MachineConfig {
    MachineConfig {
        dram_size: MachineConfig::MIN_DRAM_SIZE,
        ..MachineConfig::default()
    }
}

/// Create a System with a small DRAM
#[allow(dead_code)]
pub fn create_test_system() -> System {
    System::from_config(small_config()).expect("small config is valid")
}

/// Create a System with `program` at F000:0000 and a reset jump to it
#[allow(dead_code)]
pub fn boot_system(program: &[u8]) -> System {
    let mut system = create_test_system();
    load_program(&mut system, program);
    system
}

/// Load `program` at F000:0000 and point the reset vector at it
#[allow(dead_code)]
pub fn load_program(system: &mut System, program: &[u8]) {
    let memory = system.memory_mut();
    memory
        .load_rom_image(PROGRAM_BASE, program)
        .expect("program fits in the ROM window");
    memory
        .load_rom_image(RESET_VECTOR, &reset_jump(0xF000, 0x0000))
        .expect("reset vector is inside the ROM window");
}

/// Write a BIOS image to a temporary file
#[allow(dead_code)]
pub fn bios_file(image: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(image).expect("Failed to write BIOS image");
    file.flush().expect("Failed to flush BIOS image");
    file
}
