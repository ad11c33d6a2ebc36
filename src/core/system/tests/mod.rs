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

//! System module tests
//!
//! Tests are grouped by scheduler concern.


use super::*;

/// Machine with 1 MiB DRAM and a small slice budget
fn small_system(slice_instructions: usize) -> System {
    let config = MachineConfig {
        dram_size: 1024 * 1024,
        slice_instructions,
        ..Default::default()
    };
    System::from_config(config).unwrap()
}

/// Place `code` at the reset vector F000:FFF0
fn at_reset_vector(system: &mut System, code: &[u8]) {
    system.memory_mut().load_rom_image(0xFFFF0, code).unwrap();
}
