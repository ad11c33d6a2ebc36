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

use crate::core::error::{EmulatorError, ExceptionVector, Result};
use crate::core::memory::Memory;
use crate::core::save_state::{CpuState, StateSave};

/// x86 CPU core (80386 integer unit, real and protected mode)
///
/// # Reset state
/// - CS:EIP = F000:FFF0, so the first fetch hits the BIOS reset vector at
///   physical 0xFFFF0
/// - CR0 = 0x00000010 (real mode, ET set)
/// - EFLAGS = 0x00000002
/// - IDTR = base 0, limit 0x3FF (the real-mode IVT)
///
/// # Example
/// ```
/// use pcx::core::cpu::registers::{Register, SegReg};
/// use pcx::core::cpu::CPU;
///
/// let cpu = CPU::new();
/// assert_eq!(cpu.eip(), 0xFFF0);
/// assert_eq!(cpu.segment(SegReg::Cs).base(), 0xF0000);
/// assert_eq!(cpu.reg(Register::Eax), 0);
/// ```
pub struct CPU {
    /// EAX..EDI
    regs: GeneralRegisters,

    /// Instruction pointer (offset into CS)
    eip: u32,

    /// EFLAGS with lazily evaluated status flags
    flags: LazyFlagRegister,

    /// ES, CS, SS, DS, FS, GS indexed by `SegReg::index`
    segs: [SegRegister; 6],

    /// CR0, CR2, CR3 and CR4 (CR1 is reserved)
    cr: [u32; 5],

    /// DR0-DR7, stored but never acted upon
    dr: [u32; 8],

    gdtr: DescriptorTableRegister,
    idtr: DescriptorTableRegister,
    ldtr: DescriptorTableRegister,
    ldtr_selector: u16,

    /// Current privilege level
    cpl: u8,

    /// Stopped by HLT until the next interrupt
    halted: bool,

    /// Stopped by a fault during exception delivery; only reset recovers
    shutdown: bool,

    /// Interrupts are held off for one instruction after MOV/POP SS and STI
    interrupt_shadow: bool,

    /// Decoded instructions keyed by physical address
    icache: InstructionCache,

    /// EIP of the instruction being executed (faults rewind to it)
    current_eip: u32,

    /// Instructions retired since reset
    instructions: u64,
}

// Module declarations
pub mod decode;
mod execute;
pub mod flags;
pub mod icache;
pub mod instruction;
pub mod operand;
pub mod registers;
pub mod segment;
#[cfg(test)]
mod tests;
mod tracer;

// Re-exports
use decode::{decode, CodeReader};
use flags::{Eflags, LazyFlagRegister};
use icache::InstructionCache;
use instruction::Instruction;
use registers::{GeneralRegisters, Register, SegReg};
use segment::{AccessKind, CpuMode, DescriptorTableRegister, SegRegister, SegmentEnv};
pub use tracer::CpuTracer;

/// CR0 protection enable
pub const CR0_PE: u32 = 1 << 0;
/// CR0 task switched
pub const CR0_TS: u32 = 1 << 3;
/// CR0 extension type (387 present), hardwired on the 386
pub const CR0_ET: u32 = 1 << 4;
/// CR0 paging enable
pub const CR0_PG: u32 = 1 << 31;

/// Reads instruction bytes through CS with execute-access checks
struct CodeFetch<'a> {
    segment: &'a SegRegister,
    memory: &'a mut Memory,
    mode: CpuMode,
}

impl CodeReader for CodeFetch<'_> {
    fn read_u8(&mut self, offset: u32) -> Result<u8> {
        let linear = self
            .segment
            .linear_address(offset, 1, AccessKind::Execute, self.mode)?;
        Ok(self.memory.read_linear(linear, 1)? as u8)
    }
}

impl CPU {
    /// Create a CPU in its power-on state
    pub fn new() -> Self {
        Self {
            regs: GeneralRegisters::default(),
            eip: 0xFFF0,
            flags: LazyFlagRegister::new(),
            segs: SegReg::ALL.map(SegRegister::new),
            cr: [CR0_ET, 0, 0, 0, 0],
            dr: [0; 8],
            gdtr: DescriptorTableRegister {
                base: 0,
                limit: 0xFFFF,
            },
            idtr: DescriptorTableRegister {
                base: 0,
                limit: 0x3FF,
            },
            ldtr: DescriptorTableRegister::default(),
            ldtr_selector: 0,
            cpl: 0,
            halted: false,
            shutdown: false,
            interrupt_shadow: false,
            icache: InstructionCache::new(),
            current_eip: 0xFFF0,
            instructions: 0,
        }
    }

    /// Return to the power-on state
    ///
    /// Also empties the instruction cache.
    pub fn reset(&mut self) {
        let icache = std::mem::take(&mut self.icache);
        *self = Self {
            icache,
            ..Self::new()
        };
        self.icache.clear();
    }

    /// Read a 32-bit general register
    #[inline(always)]
    pub fn reg(&self, reg: Register) -> u32 {
        self.regs.get(reg)
    }

    /// Write a 32-bit general register
    #[inline(always)]
    pub fn set_reg(&mut self, reg: Register, value: u32) {
        self.regs.set(reg, value);
    }

    /// Current instruction pointer
    #[inline(always)]
    pub fn eip(&self) -> u32 {
        self.eip
    }

    pub fn set_eip(&mut self, eip: u32) {
        self.eip = eip;
    }

    /// Segment register state
    #[inline(always)]
    pub fn segment(&self, seg: SegReg) -> &SegRegister {
        &self.segs[seg.index()]
    }

    /// EFLAGS with every lazy flag computed
    pub fn eflags(&self) -> u32 {
        self.flags.eflags()
    }

    pub fn flags(&self) -> &LazyFlagRegister {
        &self.flags
    }

    pub fn flags_mut(&mut self) -> &mut LazyFlagRegister {
        &mut self.flags
    }

    /// Control register `n` (0, 2, 3 or 4)
    pub fn control(&self, n: u8) -> u32 {
        self.cr.get(n as usize).copied().unwrap_or(0)
    }

    pub fn gdtr(&self) -> DescriptorTableRegister {
        self.gdtr
    }

    pub fn set_gdtr(&mut self, gdtr: DescriptorTableRegister) {
        self.gdtr = gdtr;
    }

    pub fn idtr(&self) -> DescriptorTableRegister {
        self.idtr
    }

    pub fn set_idtr(&mut self, idtr: DescriptorTableRegister) {
        self.idtr = idtr;
    }

    pub fn ldtr(&self) -> DescriptorTableRegister {
        self.ldtr
    }

    #[inline(always)]
    pub fn cpl(&self) -> u8 {
        self.cpl
    }

    /// Operating mode from CR0.PE and EFLAGS.VM
    #[inline]
    pub fn mode(&self) -> CpuMode {
        if self.cr[0] & CR0_PE == 0 {
            CpuMode::Real
        } else if self.flags.contains(Eflags::VM) {
            CpuMode::Virtual8086
        } else {
            CpuMode::Protected
        }
    }

    /// Stopped by HLT (or shutdown)
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Stopped after a fault during exception delivery
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Whether a maskable interrupt may be taken at this boundary
    pub fn interrupts_enabled(&self) -> bool {
        !self.shutdown && !self.interrupt_shadow && self.flags.contains(Eflags::IF)
    }

    pub fn icache(&self) -> &InstructionCache {
        &self.icache
    }

    /// Instructions retired since reset
    pub fn instruction_count(&self) -> u64 {
        self.instructions
    }

    /// Load a segment register and apply its side effects
    ///
    /// A CS load empties the instruction cache, since the code size and
    /// base the cached decodes assumed may have changed. An SS load holds
    /// off interrupts until the following instruction has run.
    ///
    /// # Arguments
    ///
    /// * `memory` - Memory holding the descriptor tables
    /// * `seg` - Register to load
    /// * `value` - Selector (real mode: paragraph)
    pub fn load_segment(&mut self, memory: &mut Memory, seg: SegReg, value: u32) -> Result<()> {
        let mut env = SegmentEnv {
            mode: self.mode(),
            cpl: self.cpl,
            gdtr: self.gdtr,
            ldtr: self.ldtr,
            memory,
        };
        self.segs[seg.index()].set(value, &mut env)?;

        match seg {
            SegReg::Cs => {
                self.icache.clear();
                memory.clear_code_marks();
            }
            SegReg::Ss => self.interrupt_shadow = true,
            _ => {}
        }
        Ok(())
    }

    /// Write a control register
    ///
    /// Toggling CR0.PG switches linear translation in `memory`; toggling
    /// CR0.PE changes the mode but leaves the segment caches alone.
    pub fn write_control(&mut self, memory: &mut Memory, n: u8, value: u32) -> Result<()> {
        match n {
            0 => {
                let old = self.cr[0];
                let value = value | CR0_ET;
                self.cr[0] = value;
                if (old ^ value) & CR0_PG != 0 {
                    memory.set_paging(value & CR0_PG != 0);
                }
                if (old ^ value) & CR0_PE != 0 {
                    log::info!(
                        "CPU: {} mode at {:04X}:{:08X}",
                        if value & CR0_PE != 0 { "protected" } else { "real" },
                        self.segs[SegReg::Cs.index()].value(),
                        self.current_eip
                    );
                    if value & CR0_PE == 0 {
                        self.cpl = 0;
                    }
                }
                Ok(())
            }
            2..=4 => {
                self.cr[n as usize] = value;
                Ok(())
            }
            _ => Err(EmulatorError::exception(ExceptionVector::InvalidOpcode, None)),
        }
    }

    /// Store a FLAGS/EFLAGS image as POPF would
    ///
    /// VM and RF never change. IOPL changes only at CPL 0 and IF only when
    /// CPL <= IOPL. A 2-byte write leaves the upper half alone.
    pub fn write_flags(&mut self, value: u32, size: u8) {
        let mut writable = Eflags::CF
            | Eflags::PF
            | Eflags::AF
            | Eflags::ZF
            | Eflags::SF
            | Eflags::TF
            | Eflags::DF
            | Eflags::OF
            | Eflags::NT
            | Eflags::AC
            | Eflags::ID;
        match self.mode() {
            CpuMode::Real => writable |= Eflags::IOPL | Eflags::IF,
            CpuMode::Protected => {
                if self.cpl == 0 {
                    writable |= Eflags::IOPL;
                }
                if self.cpl <= self.flags.iopl() {
                    writable |= Eflags::IF;
                }
            }
            CpuMode::Virtual8086 => {
                if self.flags.iopl() == 3 {
                    writable |= Eflags::IF;
                }
            }
        }

        let mut mask = writable.bits();
        if size == 2 {
            mask &= 0xFFFF;
        }
        let current = self.flags.eflags();
        self.flags.set_eflags((current & !mask) | (value & mask));
    }

    /// Execute one instruction
    ///
    /// Fetches at CS:EIP (through the instruction cache), executes, then
    /// evicts any cached instruction the execution overwrote. Guest faults
    /// are delivered through the IVT/IDT before returning; a fault during
    /// that delivery shuts the CPU down.
    ///
    /// # Arguments
    ///
    /// * `memory` - Physical memory and MMIO
    ///
    /// # Returns
    ///
    /// - `Ok(())` once the instruction (or one REP iteration) has retired,
    ///   or immediately if the CPU is halted
    /// - `Err(EmulatorError)` for host-level failures; EIP and ESP are left
    ///   at the faulting instruction
    ///
    /// # Example
    ///
    /// ```
    /// use pcx::core::cpu::registers::Register;
    /// use pcx::core::cpu::CPU;
    /// use pcx::core::memory::Memory;
    ///
    /// let mut memory = Memory::new(1024 * 1024);
    /// // mov ax, 0x1234 at the reset vector
    /// memory.load_rom_image(0xFFFF0, &[0xB8, 0x34, 0x12]).unwrap();
    ///
    /// let mut cpu = CPU::new();
    /// cpu.step(&mut memory).unwrap();
    /// assert_eq!(cpu.reg(Register::Eax), 0x1234);
    /// assert_eq!(cpu.eip(), 0xFFF3);
    /// ```
    pub fn step(&mut self, memory: &mut Memory) -> Result<()> {
        if self.halted {
            return Ok(());
        }

        self.interrupt_shadow = false;
        self.current_eip = self.eip;
        let esp = self.regs.get(Register::Esp);

        let result = self.fetch_execute(memory);

        for (start, len) in memory.drain_code_writes() {
            self.icache.invalidate_range(start, len);
        }

        match result {
            Ok(()) => {}
            Err(EmulatorError::Exception(exception)) => {
                self.eip = self.current_eip;
                self.regs.set(Register::Esp, esp);
                log::warn!(
                    "CPU: {} at {:04X}:{:08X}",
                    exception,
                    self.segs[SegReg::Cs.index()].value(),
                    self.current_eip
                );
                self.deliver_exception(memory, exception.vector, exception.error_code)?;
            }
            Err(e) => {
                self.eip = self.current_eip;
                self.regs.set(Register::Esp, esp);
                return Err(e);
            }
        }

        self.instructions += 1;
        Ok(())
    }

    fn fetch_execute(&mut self, memory: &mut Memory) -> Result<()> {
        let insn = self.fetch(memory)?;
        let next = insn.next_offset();
        self.eip = if self.segs[SegReg::Cs.index()].cache().default_big {
            next
        } else {
            next & 0xFFFF
        };
        log::trace!(
            "{:04X}:{:08X}  {}",
            self.segs[SegReg::Cs.index()].value(),
            insn.offset,
            insn
        );
        self.execute(memory, &insn)
    }

    /// Fetch the instruction at CS:EIP, decoding it on a cache miss
    fn fetch(&mut self, memory: &mut Memory) -> Result<Instruction> {
        let cs = self.segs[SegReg::Cs.index()];
        let mode = self.mode();
        let default_big = cs.cache().default_big;

        let linear = cs.linear_address(self.eip, 1, AccessKind::Execute, mode)?;
        let physical = memory.linear_to_physical(linear)?;
        let key = memory.canonical_address(physical)?;

        if let Some(key) = key {
            if let Some(mut insn) = self.icache.fetch(key, default_big) {
                cs.linear_address(self.eip, insn.len, AccessKind::Execute, mode)?;
                insn.offset = self.eip;
                return Ok(insn);
            }
        }

        let mut reader = CodeFetch {
            segment: &cs,
            memory,
            mode,
        };
        let insn = decode(&mut reader, self.eip, default_big, default_big)?;
        if let Some(key) = key {
            memory.mark_code(key, insn.len as u32);
            self.icache.store(key, default_big, insn);
        }
        Ok(insn)
    }

    /// Decode the instruction at CS:EIP without executing or caching it
    pub fn peek_instruction(&self, memory: &mut Memory) -> Result<Instruction> {
        let cs = &self.segs[SegReg::Cs.index()];
        let default_big = cs.cache().default_big;
        let mut reader = CodeFetch {
            segment: cs,
            memory,
            mode: self.mode(),
        };
        decode(&mut reader, self.eip, default_big, default_big)
    }

    /// Raw bytes of the instruction at CS:EIP
    pub fn instruction_bytes(&self, memory: &mut Memory, len: u8) -> Result<Vec<u8>> {
        let cs = &self.segs[SegReg::Cs.index()];
        let mut reader = CodeFetch {
            segment: cs,
            memory,
            mode: self.mode(),
        };
        (0..len as u32)
            .map(|i| reader.read_u8(self.eip.wrapping_add(i)))
            .collect()
    }

    /// Take an external (maskable) interrupt
    ///
    /// The caller checks `interrupts_enabled` first. Wakes the CPU from HLT;
    /// the pushed return address is the instruction after the HLT.
    pub fn deliver_interrupt(&mut self, memory: &mut Memory, vector: u8) -> Result<()> {
        if self.shutdown {
            return Ok(());
        }
        self.halted = false;
        self.current_eip = self.eip;
        log::trace!("CPU: external interrupt 0x{:02X}", vector);

        let esp = self.regs.get(Register::Esp);
        match self.interrupt(memory, vector, None, self.eip, false) {
            Err(EmulatorError::Exception(exception)) => {
                self.regs.set(Register::Esp, esp);
                self.deliver_exception(memory, exception.vector, exception.error_code)
            }
            other => other,
        }
    }

    /// Deliver a CPU exception
    ///
    /// A contributory fault raised while delivering a contributory fault
    /// becomes #DF; any other nested fault is delivered in its place. A fault
    /// while delivering #DF shuts the CPU down.
    fn deliver_exception(
        &mut self,
        memory: &mut Memory,
        vector: ExceptionVector,
        error_code: Option<u16>,
    ) -> Result<()> {
        let code = if vector.has_error_code() {
            Some(error_code.unwrap_or(0))
        } else {
            None
        };
        let esp = self.regs.get(Register::Esp);
        match self.interrupt(memory, vector.number(), code, self.eip, false) {
            Err(EmulatorError::Exception(nested)) => {
                self.regs.set(Register::Esp, esp);
                if vector == ExceptionVector::DoubleFault {
                    log::warn!("CPU: {} while delivering #DF, shutting down", nested);
                    self.shutdown = true;
                    self.halted = true;
                    Ok(())
                } else if vector.is_contributory() && nested.vector.is_contributory() {
                    log::warn!("CPU: {} while delivering {}", nested, vector);
                    self.deliver_exception(memory, ExceptionVector::DoubleFault, Some(0))
                } else {
                    self.deliver_exception(memory, nested.vector, nested.error_code)
                }
            }
            other => other,
        }
    }

    /// Print all CPU registers for debugging
    ///
    /// # Example
    ///
    /// ```no_run
    /// use pcx::core::cpu::CPU;
    ///
    /// let cpu = CPU::new();
    /// cpu.dump_registers();
    /// ```
    pub fn dump_registers(&self) {
        println!("CPU Registers ({:?} mode, CPL {}):", self.mode(), self.cpl);
        println!(
            "EIP: 0x{:08X}  EFLAGS: 0x{:08X}",
            self.eip,
            self.flags.eflags()
        );
        println!();

        for (i, reg) in Register::ALL.iter().enumerate() {
            if i % 4 == 0 && i > 0 {
                println!();
            }
            print!("{:?}: 0x{:08X}  ", reg, self.regs.get(*reg));
        }
        println!("\n");

        for seg in SegReg::ALL {
            let s = &self.segs[seg.index()];
            println!(
                "{}: {:04X}  base=0x{:08X} limit=0x{:08X} dpl={}",
                seg,
                s.value(),
                s.base(),
                s.cache().limit_scaled,
                s.cache().dpl
            );
        }
        println!();

        println!("CR0: 0x{:08X}  CR2: 0x{:08X}  CR3: 0x{:08X}", self.cr[0], self.cr[2], self.cr[3]);
        println!(
            "GDTR: 0x{:08X}/0x{:04X}  IDTR: 0x{:08X}/0x{:04X}  LDTR: {:04X}",
            self.gdtr.base, self.gdtr.limit, self.idtr.base, self.idtr.limit, self.ldtr_selector
        );
    }
}

impl StateSave for CPU {
    type State = CpuState;

    fn to_state(&self) -> CpuState {
        CpuState {
            regs: self.regs.as_array(),
            eip: self.eip,
            eflags: self.flags.eflags(),
            segments: self.segs,
            control: self.cr,
            debug: self.dr,
            gdtr: self.gdtr,
            idtr: self.idtr,
            ldtr: self.ldtr,
            ldtr_selector: self.ldtr_selector,
            cpl: self.cpl,
            halted: self.halted,
            shutdown: self.shutdown,
            instruction_count: self.instructions,
        }
    }

    /// Cached decodes are dropped since memory is restored alongside.
    fn restore_from_state(&mut self, state: &CpuState) -> Result<()> {
        self.regs = GeneralRegisters::from_array(state.regs);
        self.eip = state.eip;
        self.current_eip = state.eip;
        self.flags.set_eflags(state.eflags);
        self.segs = state.segments;
        self.cr = state.control;
        self.dr = state.debug;
        self.gdtr = state.gdtr;
        self.idtr = state.idtr;
        self.ldtr = state.ldtr;
        self.ldtr_selector = state.ldtr_selector;
        self.cpl = state.cpl;
        self.halted = state.halted;
        self.shutdown = state.shutdown;
        self.interrupt_shadow = false;
        self.instructions = state.instruction_count;
        self.icache.clear();
        Ok(())
    }
}

impl Default for CPU {
    fn default() -> Self {
        Self::new()
    }
}
