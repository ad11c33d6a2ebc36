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

//! x86 PC emulator core library
//!
//! This library provides the instruction decode/execute engine, the
//! segmented memory subsystem and the lazy condition-flag evaluator of a
//! software PC emulator. BIOS and device models live outside the core and
//! reach it through MMIO registration and the physical read/write path.
//!
//! # Example
//!
//! ```
//! use pcx::core::cpu::registers::Register;
//! use pcx::core::system::{SliceOutcome, System};
//!
//! let mut system = System::new();
//! // mov ax, 0x1234; hlt
//! system
//!     .memory_mut()
//!     .load_rom_image(0xFFFF0, &[0xB8, 0x34, 0x12, 0xF4])
//!     .unwrap();
//!
//! assert_eq!(system.run_slice().unwrap(), SliceOutcome::Halted { executed: 2 });
//! assert_eq!(system.cpu().reg(Register::Eax), 0x1234);
//! ```

pub mod core;
