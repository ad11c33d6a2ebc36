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

//! Machine configuration
//!
//! Configuration is read from a TOML file. Every field has a default so an
//! empty file (or no file at all) yields a usable machine.
//!
//! # Example
//!
//! ```
//! use pcx::core::config::MachineConfig;
//!
//! let config = MachineConfig::from_toml_str("dram_size = 4194304").unwrap();
//! assert_eq!(config.dram_size, 4 * 1024 * 1024);
//! assert_eq!(config.slice_instructions, 10_000);
//! ```

use crate::core::error::{EmulatorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Machine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// DRAM size in bytes
    pub dram_size: usize,

    /// Instructions executed per scheduler slice before yielding
    pub slice_instructions: usize,

    /// A20 gate state at power-on (false emulates 8086 wraparound)
    pub a20_enabled: bool,

    /// BIOS image to load before the first fetch
    pub bios_path: Option<String>,

    /// Execution trace output file
    pub trace_path: Option<String>,

    /// Maximum number of traced instructions (0 = unlimited)
    pub trace_limit: usize,
}

impl MachineConfig {
    /// Smallest DRAM size accepted (the full real-mode address space)
    pub const MIN_DRAM_SIZE: usize = 1024 * 1024;

    /// DRAM size granularity
    pub const DRAM_GRANULARITY: usize = 64 * 1024;

    /// Parse a configuration from TOML text and validate it
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: MachineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.dram_size < Self::MIN_DRAM_SIZE || self.dram_size % Self::DRAM_GRANULARITY != 0 {
            return Err(EmulatorError::Configuration(format!(
                "dram_size must be at least {} bytes and a multiple of {} (got {})",
                Self::MIN_DRAM_SIZE,
                Self::DRAM_GRANULARITY,
                self.dram_size
            )));
        }
        if self.slice_instructions == 0 {
            return Err(EmulatorError::Configuration(
                "slice_instructions must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            dram_size: 16 * 1024 * 1024,
            slice_instructions: 10_000,
            a20_enabled: false,
            bios_path: None,
            trace_path: None,
            trace_limit: 0,
        }
    }
}
