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

//! Machine scheduler
//!
//! `System` owns the CPU and physical memory and drives execution in
//! bounded slices. Each slice first takes at most one pending external
//! interrupt (if the CPU will accept it), then runs up to
//! `slice_instructions` instructions and reports why it stopped.
//!
//! ```text
//!   Idle --run_slice--> Running --budget spent--> Yielded --run_slice--> Running
//!                          |                                   ^
//!                          +--HLT / shutdown--> Halted --IRQ---+
//!   any --pause--> Paused --resume--> (previous)
//! ```

use super::config::MachineConfig;
use super::cpu::{CpuTracer, CPU, CR0_PG};
use super::cpu::segment::CpuMode;
use super::error::Result;
use super::memory::Memory;
use super::save_state::{CpuState, MemoryState, StateSave};
use std::collections::VecDeque;
use std::path::Path;

#[cfg(test)]
mod tests;

/// Why `run_slice` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceOutcome {
    /// The instruction budget was spent
    Yielded { executed: usize },
    /// The CPU executed HLT or shut down; only an interrupt or reset resumes it
    Halted { executed: usize },
    /// The host paused the machine
    Paused,
}

/// Callback invoked when the CPU halts
pub type HaltListener = Box<dyn FnMut(&CPU)>;

/// PC machine: CPU, memory and the scheduling state around them
///
/// # Example
/// ```
/// use pcx::core::system::{SliceOutcome, System};
///
/// let mut system = System::new();
/// // hlt at the reset vector
/// system.memory_mut().load_rom_image(0xFFFF0, &[0xF4]).unwrap();
/// assert_eq!(system.run_slice().unwrap(), SliceOutcome::Halted { executed: 1 });
/// ```
pub struct System {
    cpu: CPU,
    memory: Memory,
    config: MachineConfig,
    /// External interrupt vectors waiting for IF
    pending_interrupts: VecDeque<u8>,
    /// At least one slice has run since reset
    running: bool,
    paused: bool,
    halt_listeners: Vec<HaltListener>,
    /// CPU tracer for debugging (optional)
    tracer: Option<CpuTracer>,
    /// Slices run since reset
    slices: u64,
}

impl System {
    /// Create a machine with the default configuration
    pub fn new() -> Self {
        Self::with_parts(MachineConfig::default())
    }

    /// Build a machine from a validated configuration
    ///
    /// Loads `bios_path` and opens `trace_path` when they are set.
    ///
    /// # Returns
    ///
    /// - `Ok(System)` ready to run from the reset vector
    /// - `Err(EmulatorError)` if the configuration is invalid or a file
    ///   cannot be read or created
    pub fn from_config(config: MachineConfig) -> Result<Self> {
        config.validate()?;
        let bios_path = config.bios_path.clone();
        let trace_path = config.trace_path.clone();
        let trace_limit = config.trace_limit;

        let mut system = Self::with_parts(config);
        if let Some(path) = bios_path {
            system.load_bios(path)?;
        }
        if let Some(path) = trace_path {
            system.enable_tracing(path, trace_limit)?;
        }
        Ok(system)
    }

    fn with_parts(config: MachineConfig) -> Self {
        log::info!(
            "System: {} KiB DRAM, A20 {}, {} instructions per slice",
            config.dram_size / 1024,
            if config.a20_enabled { "enabled" } else { "disabled" },
            config.slice_instructions
        );
        Self {
            cpu: CPU::new(),
            memory: Memory::with_a20(config.dram_size, config.a20_enabled),
            config,
            pending_interrupts: VecDeque::new(),
            running: false,
            paused: false,
            halt_listeners: Vec::new(),
            tracer: None,
            slices: 0,
        }
    }

    /// Load a BIOS image so that it ends at physical 0xFFFFF
    ///
    /// # Example
    ///
    /// ```no_run
    /// use pcx::core::system::System;
    ///
    /// let mut system = System::new();
    /// system.load_bios("bios.bin").unwrap();
    /// ```
    pub fn load_bios<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.memory.load_bios(path)
    }

    /// Power-cycle the machine
    ///
    /// DRAM is cleared and pending interrupts dropped. ROM contents, MMIO
    /// handlers, halt listeners and the tracer survive.
    pub fn reset(&mut self) {
        self.cpu.reset();
        self.memory.reset();
        self.pending_interrupts.clear();
        self.running = false;
        self.paused = false;
        self.slices = 0;
        log::info!("System: reset");
    }

    /// Run one scheduler slice
    ///
    /// # Returns
    ///
    /// - `Ok(SliceOutcome)` describing why the slice ended
    /// - `Err(EmulatorError)` on a host-level failure (decode error,
    ///   unimplemented feature, real-mode limit fault). CS:EIP is left at the
    ///   failing instruction.
    pub fn run_slice(&mut self) -> Result<SliceOutcome> {
        if self.paused {
            return Ok(SliceOutcome::Paused);
        }
        self.running = true;
        self.slices += 1;

        self.service_interrupt()?;
        if self.cpu.is_halted() {
            return Ok(SliceOutcome::Halted { executed: 0 });
        }

        let budget = self.config.slice_instructions;
        let mut executed = 0;
        while executed < budget {
            self.trace_instruction();
            self.cpu.step(&mut self.memory)?;
            executed += 1;

            if self.cpu.is_halted() {
                self.notify_halt();
                return Ok(SliceOutcome::Halted { executed });
            }
        }
        Ok(SliceOutcome::Yielded { executed })
    }

    /// Run slices until the machine halts or is paused
    ///
    /// Pending interrupts are serviced between slices, so a halted machine
    /// with an interrupt already queued keeps running.
    pub fn run(&mut self) -> Result<SliceOutcome> {
        loop {
            match self.run_slice()? {
                SliceOutcome::Yielded { .. } => continue,
                SliceOutcome::Halted { .. } if self.can_wake() => continue,
                outcome => return Ok(outcome),
            }
        }
    }

    /// Stop at the next slice boundary
    pub fn pause(&mut self) {
        if !self.paused {
            log::info!("System: paused at {} instructions", self.cpu.instruction_count());
        }
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Queue an external interrupt
    ///
    /// It is delivered at the start of a slice once the CPU accepts
    /// interrupts (IF set, no interrupt shadow). One interrupt is taken per
    /// slice.
    pub fn raise_interrupt(&mut self, vector: u8) {
        log::trace!("System: IRQ vector 0x{:02X} pending", vector);
        self.pending_interrupts.push_back(vector);
    }

    /// Register a callback fired whenever the CPU halts
    ///
    /// # Example
    ///
    /// ```
    /// use pcx::core::system::System;
    ///
    /// let mut system = System::new();
    /// system.on_halt(|cpu| println!("halted at {:08X}", cpu.eip()));
    /// ```
    pub fn on_halt<F: FnMut(&CPU) + 'static>(&mut self, listener: F) {
        self.halt_listeners.push(Box::new(listener));
    }

    fn service_interrupt(&mut self) -> Result<()> {
        if self.pending_interrupts.is_empty() || !self.cpu.interrupts_enabled() {
            return Ok(());
        }
        if let Some(vector) = self.pending_interrupts.pop_front() {
            self.cpu.deliver_interrupt(&mut self.memory, vector)?;
        }
        Ok(())
    }

    fn can_wake(&self) -> bool {
        !self.pending_interrupts.is_empty() && self.cpu.interrupts_enabled()
    }

    fn notify_halt(&mut self) {
        if self.cpu.is_shutdown() {
            log::warn!("System: CPU shut down");
        } else {
            log::debug!("System: HLT");
        }
        for listener in &mut self.halt_listeners {
            listener(&self.cpu);
        }
    }

    fn trace_instruction(&mut self) {
        let Some(tracer) = self.tracer.as_mut() else {
            return;
        };
        if tracer.is_enabled() {
            if let Err(e) = tracer.trace(&self.cpu, &mut self.memory) {
                log::warn!("Failed to write trace: {}", e);
            }
            if tracer.lines_written() % 100 == 0 {
                let _ = tracer.flush();
            }
            return;
        }

        log::info!(
            "Trace limit reached ({} instructions), disabling tracer",
            tracer.lines_written()
        );
        let _ = tracer.flush();
        self.tracer = None;
    }

    /// Replace CPU and memory state (save state restore)
    pub(crate) fn restore(&mut self, cpu: &CpuState, memory: &MemoryState) -> Result<()> {
        self.memory.restore_from_state(memory)?;
        self.cpu.restore_from_state(cpu)?;
        self.memory.set_paging(cpu.control[0] & CR0_PG != 0);
        self.pending_interrupts.clear();
        Ok(())
    }

    /// Enable CPU execution tracing
    ///
    /// # Arguments
    ///
    /// * `path` - Trace output file
    /// * `limit` - Maximum instructions to trace (0 = unlimited)
    pub fn enable_tracing<P: AsRef<Path>>(&mut self, path: P, limit: usize) -> Result<()> {
        let display = path.as_ref().display().to_string();
        self.tracer = Some(CpuTracer::new(path)?.with_limit(limit));
        log::info!(
            "CPU tracing enabled: {} (limit: {})",
            display,
            if limit == 0 {
                "unlimited".to_string()
            } else {
                limit.to_string()
            }
        );
        Ok(())
    }

    /// Flush and close the trace file
    pub fn disable_tracing(&mut self) {
        if let Some(mut tracer) = self.tracer.take() {
            let _ = tracer.flush();
            log::info!(
                "CPU tracing disabled (traced {} instructions)",
                tracer.lines_written()
            );
        }
    }

    pub fn is_tracing(&self) -> bool {
        self.tracer.is_some()
    }

    /// Instructions traced so far by the active tracer
    pub fn trace_count(&self) -> usize {
        self.tracer.as_ref().map_or(0, |t| t.lines_written())
    }

    pub fn cpu(&self) -> &CPU {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut CPU {
        &mut self.cpu
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Mutable memory, for MMIO registration and firmware setup
    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Current CPU mode
    pub fn mode(&self) -> CpuMode {
        self.cpu.mode()
    }

    pub fn instruction_count(&self) -> u64 {
        self.cpu.instruction_count()
    }

    /// Slices run since reset
    pub fn slices(&self) -> u64 {
        self.slices
    }

    pub fn pending_interrupts(&self) -> usize {
        self.pending_interrupts.len()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_halted(&self) -> bool {
        self.cpu.is_halted()
    }
}

impl Default for System {
    fn default() -> Self {
        Self::new()
    }
}
