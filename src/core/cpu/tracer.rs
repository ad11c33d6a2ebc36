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

//! CPU execution tracer for debugging
//!
//! Logs CPU execution state to a file for analysis and debugging.

use super::registers::{Register, RegisterRef, SegReg};
use super::CPU;
use crate::core::error::Result;
use crate::core::memory::Memory;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// CPU execution tracer
///
/// Records CPU state before each instruction. Each line in the trace file
/// shows:
/// - CS:EIP
/// - Raw instruction bytes
/// - Disassembled instruction
/// - General registers and EFLAGS
///
/// # Example
/// ```no_run
/// use pcx::core::cpu::{CPU, CpuTracer};
/// use pcx::core::memory::Memory;
///
/// let mut cpu = CPU::new();
/// let mut memory = Memory::new(1024 * 1024);
/// let mut tracer = CpuTracer::new("trace.log").unwrap();
///
/// // Execute and trace
/// tracer.trace(&cpu, &mut memory).unwrap();
/// cpu.step(&mut memory).unwrap();
/// ```
pub struct CpuTracer {
    /// Enable/disable tracing
    enabled: bool,
    /// Output file handle
    output: BufWriter<File>,
    /// Lines written so far
    written: usize,
    /// Stop after this many lines (0 = unlimited)
    limit: usize,
}

impl CpuTracer {
    /// Create a new CPU tracer
    ///
    /// Opens a file for writing trace output. If the file exists, it will be overwritten.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the output trace file
    ///
    /// # Returns
    ///
    /// - `Ok(CpuTracer)` if the file was opened successfully
    /// - `Err(EmulatorError)` if file creation fails
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let output = BufWriter::new(File::create(path)?);
        Ok(Self {
            enabled: true,
            output,
            written: 0,
            limit: 0,
        })
    }

    /// Stop tracing after `limit` instructions (0 = unlimited)
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Enable or disable tracing
    ///
    /// When disabled, trace() calls will return immediately without writing.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Check if tracing is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled && (self.limit == 0 || self.written < self.limit)
    }

    /// Number of trace lines written
    pub fn lines_written(&self) -> usize {
        self.written
    }

    /// Trace current CPU state
    ///
    /// Writes one line for the instruction at CS:EIP. If tracing is disabled,
    /// the limit has been reached or the CPU is halted, this returns
    /// immediately. Bytes that cannot be decoded are traced as `(bad)`
    /// rather than failing, so the trace shows the point where the guest
    /// went astray.
    ///
    /// # Arguments
    ///
    /// * `cpu` - CPU instance to trace
    /// * `memory` - Memory holding the code
    ///
    /// # Returns
    ///
    /// - `Ok(())` if trace was written successfully
    /// - `Err(EmulatorError)` if writing fails
    pub fn trace(&mut self, cpu: &CPU, memory: &mut Memory) -> Result<()> {
        self.trace_with_regs(cpu, memory, &Register::ALL)
    }

    /// Trace with custom register selection
    ///
    /// Like `trace()`, but allows specifying which registers to display.
    ///
    /// # Example
    /// ```no_run
    /// use pcx::core::cpu::registers::Register;
    /// use pcx::core::cpu::{CPU, CpuTracer};
    /// use pcx::core::memory::Memory;
    ///
    /// let cpu = CPU::new();
    /// let mut memory = Memory::new(1024 * 1024);
    /// let mut tracer = CpuTracer::new("trace.log").unwrap();
    ///
    /// tracer
    ///     .trace_with_regs(&cpu, &mut memory, &[Register::Esi, Register::Edi])
    ///     .unwrap();
    /// ```
    pub fn trace_with_regs(&mut self, cpu: &CPU, memory: &mut Memory, regs: &[Register]) -> Result<()> {
        if !self.is_enabled() || cpu.is_halted() {
            return Ok(());
        }

        let (raw, disasm) = match cpu.peek_instruction(memory) {
            Ok(insn) => {
                let bytes = cpu.instruction_bytes(memory, insn.len).unwrap_or_default();
                let raw = bytes
                    .iter()
                    .map(|b| format!("{:02X}", b))
                    .collect::<Vec<_>>()
                    .join("");
                (raw, insn.to_string())
            }
            Err(_) => (String::from("??"), String::from("(bad)")),
        };

        write!(
            self.output,
            "{:04X}:{:08X} [{:<30}] {:32} |",
            cpu.segment(SegReg::Cs).value(),
            cpu.eip(),
            raw,
            disasm
        )?;

        for &reg in regs.iter().take(8) {
            write!(self.output, " {}={:08X}", RegisterRef::dword(reg), cpu.reg(reg))?;
        }
        writeln!(self.output, " eflags={:08X}", cpu.eflags())?;

        self.written += 1;
        Ok(())
    }

    /// Flush the output buffer
    ///
    /// Forces any buffered trace data to be written to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.output.flush()?;
        Ok(())
    }
}
