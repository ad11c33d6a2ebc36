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

/// Emulator error types
use std::fmt;
use thiserror::Error;

/// Result type for emulator operations
pub type Result<T> = std::result::Result<T, EmulatorError>;

/// Main error type for the emulator
///
/// Only [`EmulatorError::Exception`] is recoverable by the guest (through its
/// own IDT/IVT handlers). Every other variant is a host-level defect or an
/// unimplemented feature and stops the machine.
#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("Decode error at offset 0x{offset:08X}: {reason}")]
    Decode { offset: u32, reason: DecodeError },

    #[error("CPU exception: {0}")]
    Exception(CpuException),

    #[error("Memory fault {vector} at 0x{address:08X} in real mode")]
    MemoryFault {
        vector: ExceptionVector,
        address: u32,
    },

    #[error("Physical address out of bounds: 0x{address:08X}")]
    OutOfBounds { address: u32 },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unimplemented feature: {0}")]
    Unimplemented(&'static str),

    #[error("Invalid BIOS size: {got} bytes (expected at most {expected})")]
    InvalidBiosSize { expected: usize, got: usize },

    #[error("Save state error: {0}")]
    SaveState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Config(#[from] toml::de::Error),
}

impl EmulatorError {
    /// Shorthand for raising a CPU exception
    pub fn exception(vector: ExceptionVector, error_code: Option<u16>) -> Self {
        EmulatorError::Exception(CpuException { vector, error_code })
    }

    /// Returns the CPU exception carried by this error, if any
    pub fn as_exception(&self) -> Option<CpuException> {
        match self {
            EmulatorError::Exception(e) => Some(*e),
            _ => None,
        }
    }
}

/// Reasons the decoder gives up on a byte sequence
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid opcode 0x{0:02X}")]
    InvalidOpcode(u8),

    #[error("invalid two-byte opcode 0x0F 0x{0:02X}")]
    InvalidEscape(u8),

    #[error("invalid extension /{reg} for opcode 0x{opcode:02X}")]
    InvalidExtension { opcode: u8, reg: u8 },

    #[error("register-only form requires mod == 3")]
    RegisterRequired,

    #[error("memory-only form requires mod != 3")]
    MemoryRequired,

    #[error("unsupported operand form: {0}")]
    Unsupported(&'static str),

    #[error("instruction longer than 15 bytes")]
    TooLong,

    #[error("operand {0} missing for this form")]
    MissingOperand(u8),
}

/// Architectural exception vectors raised by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionVector {
    /// #DE - divide error
    DivideError,
    /// #BP - breakpoint (INT3)
    Breakpoint,
    /// #OF - overflow (INTO)
    Overflow,
    /// #UD - invalid opcode
    InvalidOpcode,
    /// #DF - double fault
    DoubleFault,
    /// #NP - segment not present
    SegmentNotPresent,
    /// #SS - stack segment fault
    StackFault,
    /// #GP - general protection
    GeneralProtection,
}

impl ExceptionVector {
    /// Interrupt vector number
    pub fn number(self) -> u8 {
        match self {
            ExceptionVector::DivideError => 0,
            ExceptionVector::Breakpoint => 3,
            ExceptionVector::Overflow => 4,
            ExceptionVector::InvalidOpcode => 6,
            ExceptionVector::DoubleFault => 8,
            ExceptionVector::SegmentNotPresent => 11,
            ExceptionVector::StackFault => 12,
            ExceptionVector::GeneralProtection => 13,
        }
    }

    /// Whether delivery pushes an error code
    pub fn has_error_code(self) -> bool {
        matches!(
            self,
            ExceptionVector::DoubleFault
                | ExceptionVector::SegmentNotPresent
                | ExceptionVector::StackFault
                | ExceptionVector::GeneralProtection
        )
    }

    /// Faults that escalate to #DF when raised during delivery of another
    /// contributory fault
    pub fn is_contributory(self) -> bool {
        matches!(
            self,
            ExceptionVector::DivideError
                | ExceptionVector::SegmentNotPresent
                | ExceptionVector::StackFault
                | ExceptionVector::GeneralProtection
        )
    }
}

impl fmt::Display for ExceptionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExceptionVector::DivideError => "#DE",
            ExceptionVector::Breakpoint => "#BP",
            ExceptionVector::Overflow => "#OF",
            ExceptionVector::InvalidOpcode => "#UD",
            ExceptionVector::DoubleFault => "#DF",
            ExceptionVector::SegmentNotPresent => "#NP",
            ExceptionVector::StackFault => "#SS",
            ExceptionVector::GeneralProtection => "#GP",
        };
        f.write_str(name)
    }
}

/// A CPU exception together with its error code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuException {
    pub vector: ExceptionVector,
    pub error_code: Option<u16>,
}

impl fmt::Display for CpuException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error_code {
            Some(code) => write!(f, "{}(0x{:04X})", self.vector, code),
            None => write!(f, "{}", self.vector),
        }
    }
}
