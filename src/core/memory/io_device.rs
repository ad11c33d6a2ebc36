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

//! Memory-mapped I/O handler trait
//!
//! Devices behind a fixed physical window implement `MmioHandler` and are
//! installed with `Memory::register_memory_handlers`. Memory routes every
//! access inside the window to the handler without touching DRAM.
//!
//! # Example
//!
//! ```
//! use pcx::core::memory::{Memory, MmioHandler};
//!
//! struct Framebuffer {
//!     cells: Vec<u8>,
//! }
//!
//! impl MmioHandler for Framebuffer {
//!     fn read(&mut self, addr: u32, _size: u8) -> u32 {
//!         self.cells[(addr - 0xA0000) as usize] as u32
//!     }
//!
//!     fn write(&mut self, addr: u32, value: u32, _size: u8) {
//!         self.cells[(addr - 0xA0000) as usize] = value as u8;
//!     }
//! }
//!
//! let mut memory = Memory::new(1024 * 1024);
//! memory
//!     .register_memory_handlers(
//!         0xA0000,
//!         0xBFFFF,
//!         "vga",
//!         Box::new(Framebuffer { cells: vec![0; 0x20000] }),
//!     )
//!     .unwrap();
//!
//! memory.write_physical(0xA0010, 0x41, 1).unwrap();
//! assert_eq!(memory.read_physical(0xA0010, 1).unwrap(), 0x41);
//! ```

/// A device serving a physical address window
///
/// Handlers receive the full physical address (after A20 masking) and the
/// access size in bytes (1, 2 or 4). Reads return the value zero-extended
/// to 32 bits; writes pass the value in the low `size` bytes.
///
/// Handlers are owned by `Memory` and are never shared across threads.
pub trait MmioHandler {
    /// Read `size` bytes at `addr`
    fn read(&mut self, addr: u32, size: u8) -> u32;

    /// Write the low `size` bytes of `value` at `addr`
    fn write(&mut self, addr: u32, value: u32, size: u8);
}
