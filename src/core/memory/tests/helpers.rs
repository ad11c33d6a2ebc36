// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 itsakeyfut

//! Helper functions for memory tests

use super::*;
use std::cell::RefCell;
use std::rc::Rc;

/// 1 MiB of DRAM, the smallest configuration
pub fn create_test_memory() -> Memory {
    Memory::new(1024 * 1024)
}

/// One access seen by a `RecordingHandler`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read { addr: u32, size: u8 },
    Write { addr: u32, value: u32, size: u8 },
}

/// MMIO handler that logs every access and answers reads with a fixed value
pub struct RecordingHandler {
    pub log: Rc<RefCell<Vec<Access>>>,
    pub read_value: u32,
}

impl MmioHandler for RecordingHandler {
    fn read(&mut self, addr: u32, size: u8) -> u32 {
        self.log.borrow_mut().push(Access::Read { addr, size });
        self.read_value
    }

    fn write(&mut self, addr: u32, value: u32, size: u8) {
        self.log.borrow_mut().push(Access::Write { addr, value, size });
    }
}

/// Memory with a recording VGA handler installed
pub fn create_memory_with_vga(read_value: u32) -> (Memory, Rc<RefCell<Vec<Access>>>) {
    let mut memory = create_test_memory();
    let log = Rc::new(RefCell::new(Vec::new()));
    memory
        .register_memory_handlers(
            Memory::VGA_START,
            Memory::VGA_END,
            Memory::VGA_DEVICE,
            Box::new(RecordingHandler {
                log: Rc::clone(&log),
                read_value,
            }),
        )
        .unwrap();
    (memory, log)
}
