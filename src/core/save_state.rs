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

//! Save state serialization
//!
//! A save state captures everything needed to resume the machine at an
//! instruction boundary: the CPU (general, segment, control and table
//! registers plus the halt state) and DRAM. ROM contents and MMIO handlers
//! are host configuration and are not saved; restore into a machine built
//! from the same configuration.
//!
//! # Save State Format
//!
//! States are encoded with bincode (standard configuration). Segment
//! registers and descriptor-table registers go through their serde
//! implementations.
//!
//! # Version Compatibility
//!
//! Save states carry a version number. Loading a state with a different
//! version fails with `EmulatorError::SaveState`.
//!
//! # Example
//!
//! ```no_run
//! use pcx::core::save_state::SaveState;
//! use pcx::core::system::System;
//!
//! let mut system = System::new();
//! // ... run emulation ...
//!
//! let state = SaveState::from_system(&system, "before boot sector");
//! state.save_to_file("machine.state").unwrap();
//!
//! let loaded = SaveState::load_from_file("machine.state").unwrap();
//! loaded.apply_to(&mut system).unwrap();
//! ```

use crate::core::cpu::segment::{DescriptorTableRegister, SegRegister};
use crate::core::error::{EmulatorError, Result};
use crate::core::system::System;
use bincode::{config, Decode, Encode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Save state version for compatibility checking
///
/// Incremented whenever the encoding changes incompatibly.
pub const SAVE_STATE_VERSION: u32 = 1;

/// Complete machine save state
#[derive(Serialize, Deserialize, Encode, Decode)]
pub struct SaveState {
    /// Version number for compatibility checking
    pub version: u32,

    pub metadata: SaveStateMetadata,

    pub cpu: CpuState,

    pub memory: MemoryState,
}

/// When and why the state was taken
#[derive(Serialize, Deserialize, Encode, Decode)]
#[bincode(encode_bounds = "", decode_bounds = "")]
pub struct SaveStateMetadata {
    /// Timestamp when the save state was created
    #[bincode(with_serde)]
    pub timestamp: DateTime<Utc>,

    /// Free-form label
    pub description: String,

    /// Instructions retired at save time
    pub instruction_count: u64,
}

/// CPU register file and run state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct CpuState {
    /// EAX..EDI
    pub regs: [u32; 8],

    pub eip: u32,

    /// EFLAGS with every lazy flag computed
    pub eflags: u32,

    /// ES, CS, SS, DS, FS, GS including their descriptor caches
    #[bincode(with_serde)]
    pub segments: [SegRegister; 6],

    /// CR0..CR4
    pub control: [u32; 5],

    pub debug: [u32; 8],

    #[bincode(with_serde)]
    pub gdtr: DescriptorTableRegister,

    #[bincode(with_serde)]
    pub idtr: DescriptorTableRegister,

    #[bincode(with_serde)]
    pub ldtr: DescriptorTableRegister,

    pub ldtr_selector: u16,

    pub cpl: u8,

    pub halted: bool,

    pub shutdown: bool,

    pub instruction_count: u64,
}

/// DRAM contents and the A20 gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct MemoryState {
    pub dram: Vec<u8>,

    pub a20_enabled: bool,
}

impl SaveState {
    /// Snapshot a running system
    ///
    /// # Arguments
    ///
    /// * `system` - Machine to capture
    /// * `description` - Label stored in the metadata
    pub fn from_system(system: &System, description: &str) -> Self {
        let cpu = system.cpu().to_state();
        Self {
            version: SAVE_STATE_VERSION,
            metadata: SaveStateMetadata {
                timestamp: Utc::now(),
                description: description.to_string(),
                instruction_count: cpu.instruction_count,
            },
            cpu,
            memory: system.memory().to_state(),
        }
    }

    /// Restore this state into `system`
    ///
    /// Pending interrupts are dropped and the decoded-instruction cache is
    /// emptied. DRAM size must match the target machine.
    pub fn apply_to(&self, system: &mut System) -> Result<()> {
        system.restore(&self.cpu, &self.memory)?;
        log::info!(
            "Save state restored: \"{}\" ({})",
            self.metadata.description,
            self.metadata.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
        Ok(())
    }

    /// Encode to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::encode_to_vec(self, config::standard())
            .map_err(|e| EmulatorError::SaveState(e.to_string()))
    }

    /// Decode from bytes, checking the version
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (state, _): (SaveState, usize) = bincode::decode_from_slice(bytes, config::standard())
            .map_err(|e| EmulatorError::SaveState(e.to_string()))?;

        if state.version != SAVE_STATE_VERSION {
            return Err(EmulatorError::SaveState(format!(
                "Incompatible save state version: expected {}, got {}",
                SAVE_STATE_VERSION, state.version
            )));
        }
        Ok(state)
    }

    /// Save state to file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to save file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let encoded = self.to_bytes()?;
        let mut file = File::create(path)?;
        file.write_all(&encoded)?;
        Ok(())
    }

    /// Load state from file
    ///
    /// # Returns
    ///
    /// - `Ok(SaveState)` if the file decodes and the version matches
    /// - `Err(EmulatorError)` on I/O, decode or version errors
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;
        Self::from_bytes(&buffer)
    }

    /// Approximate encoded size in bytes
    pub fn estimated_size(&self) -> usize {
        std::mem::size_of::<CpuState>() + self.memory.dram.len() + self.metadata.description.len() + 64
    }
}

/// Component state capture and restore
///
/// Implemented by every component that appears in a save state.
///
/// # Example
///
/// ```
/// use pcx::core::save_state::StateSave;
/// use pcx::core::cpu::CPU;
/// use pcx::core::cpu::registers::Register;
///
/// let mut cpu = CPU::new();
/// cpu.set_reg(Register::Ebx, 7);
/// let state = cpu.to_state();
///
/// let mut other = CPU::new();
/// other.restore_from_state(&state).unwrap();
/// assert_eq!(other.reg(Register::Ebx), 7);
/// ```
pub trait StateSave {
    /// The state type for this component
    type State: Serialize + for<'de> Deserialize<'de>;

    /// Convert this component to a saveable state
    fn to_state(&self) -> Self::State;

    /// Restore this component from a saved state
    fn restore_from_state(&mut self, state: &Self::State) -> Result<()>;
}
