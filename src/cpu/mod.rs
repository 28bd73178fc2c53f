pub mod compressed;
pub mod decode;
pub mod exec;
pub mod trap;

use std::fmt;

use thiserror::Error;
use tracing::{Level, trace};

use crate::csr::{CsrFile, PrivMode};
use crate::device::Bus;
use crate::mem::{AccessKind, DRAM_BASE, MemError, Width};
use crate::mmu::{Mmu, PAGE_SIZE};
use trap::{Trap, WithPc};

/// Register width, fixed when the machine is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Xlen {
    Bit32,
    #[default]
    Bit64,
}

impl Xlen {
    pub const fn bits(self) -> u32 {
        match self {
            Xlen::Bit32 => 32,
            Xlen::Bit64 => 64,
        }
    }

    /// Drops everything above XLEN. Used for addresses and the PC.
    pub fn truncate(self, value: u64) -> u64 {
        match self {
            Xlen::Bit32 => value & 0xffff_ffff,
            Xlen::Bit64 => value,
        }
    }

    /// Canonical register form: RV32 values are kept sign-extended from bit 31.
    pub fn sign_extend(self, value: u64) -> u64 {
        match self {
            Xlen::Bit32 => value as i32 as i64 as u64,
            Xlen::Bit64 => value,
        }
    }

    pub fn shamt_mask(self) -> u64 {
        (self.bits() - 1) as u64
    }
}

pub struct Cpu {
    pub regs: [u64; 32],
    pub pc: u64,
    pub csrs: CsrFile,
    xlen: Xlen,
}

impl Cpu {
    pub fn new(xlen: Xlen) -> Self {
        Self {
            regs: [0; 32],
            pc: DRAM_BASE,
            csrs: CsrFile::new(xlen),
            xlen,
        }
    }

    pub fn xlen(&self) -> Xlen {
        self.xlen
    }

    pub fn read_reg(&self, idx: u8) -> u64 {
        self.regs[idx as usize & 0x1f]
    }

    pub fn write_reg(&mut self, idx: u8, value: u64) {
        if idx != 0 {
            self.regs[idx as usize & 0x1f] = self.xlen.sign_extend(value);
        } // x0 hardwired
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// The guest wrote `code` to its `tohost` word. 1 means the test passed.
    HostExit { code: u64 },
}

impl HaltReason {
    /// riscv-tests convention: 1 passes, `(n << 1) | 1` reports failing test `n`.
    pub fn passed(self) -> bool {
        matches!(self, HaltReason::HostExit { code: 1 })
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HaltReason::HostExit { code: 1 } => write!(f, "tohost = 1 (pass)"),
            HaltReason::HostExit { code } => {
                write!(f, "tohost = 0x{code:x} (fail, test {})", code >> 1)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continued,
    Trapped(Trap),
    Halted(HaltReason),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineError {
    #[error("unrecoverable {trap}: handler at 0x{handler:x} cannot run")]
    Fatal { trap: Trap, handler: u64 },
}

pub struct Machine {
    pub cpu: Cpu,
    pub bus: Bus,
    pub mmu: Mmu,
    /// Physical address held by the last `lr`.
    pub(crate) reservation: Option<u64>,
    tohost: Option<u64>,
    exit_code: Option<u64>,
}

impl Machine {
    pub fn new(ram_bytes: usize, xlen: Xlen) -> Self {
        Self {
            cpu: Cpu::new(xlen),
            bus: Bus::new(ram_bytes),
            mmu: Mmu::new(),
            reservation: None,
            tohost: None,
            exit_code: None,
        }
    }

    pub fn xlen(&self) -> Xlen {
        self.cpu.xlen()
    }

    /// Physical address whose stores end the run.
    pub fn set_tohost(&mut self, addr: Option<u64>) {
        self.tohost = addr;
    }

    pub fn tohost(&self) -> Option<u64> {
        self.tohost
    }

    pub fn exit_code(&self) -> Option<u64> {
        self.exit_code
    }

    pub fn halt_reason(&self) -> Option<HaltReason> {
        self.exit_code.map(|code| HaltReason::HostExit { code })
    }

    pub fn is_halted(&self) -> bool {
        self.exit_code.is_some()
    }

    /// Executes one instruction, or takes one pending interrupt.
    pub fn step(&mut self) -> Result<StepOutcome, MachineError> {
        if let Some(reason) = self.halt_reason() {
            return Ok(StepOutcome::Halted(reason));
        }

        self.bus.tick(&mut self.cpu.csrs);
        let csrs = &mut self.cpu.csrs;
        if csrs.mcountinhibit & 0b001 == 0 {
            csrs.cycle = csrs.cycle.wrapping_add(1);
        }

        if let Some(trap) = csrs
            .check_pending_interrupt()
            .and_then(|cause| Trap::interrupt(cause, self.cpu.pc))
        {
            self.take_trap(trap)?;
            return Ok(StepOutcome::Trapped(trap));
        }

        match self.execute_next() {
            Ok(()) => {
                let xlen = self.xlen();
                let csrs = &mut self.cpu.csrs;
                if csrs.mcountinhibit & 0b100 == 0 {
                    csrs.instret = csrs.instret.wrapping_add(1);
                }
                self.cpu.pc = xlen.truncate(self.cpu.pc);
                Ok(match self.halt_reason() {
                    Some(reason) => StepOutcome::Halted(reason),
                    None => StepOutcome::Continued,
                })
            }
            Err(trap) => {
                self.take_trap(trap)?;
                Ok(StepOutcome::Trapped(trap))
            }
        }
    }

    fn execute_next(&mut self) -> Result<(), Trap> {
        let pc = self.cpu.pc;
        let (raw, len) = self.fetch(pc)?;
        let instr = if len == 2 {
            compressed::expand(raw as u16, self.xlen()).with_pc(pc)?
        } else {
            decode::decode(raw, self.xlen()).with_pc(pc)?
        };
        if tracing::enabled!(Level::TRACE) {
            crate::debug::trace_instruction(&self.cpu, raw, len, &instr);
        }
        exec::execute(self, instr, raw, len)
    }

    /// Returns the raw instruction bits and their length in bytes.
    fn fetch(&mut self, pc: u64) -> Result<(u32, u64), Trap> {
        if pc & 1 != 0 {
            return Err(Trap::InstructionMisaligned { pc, addr: pc });
        }
        let low = self.fetch_half(pc, pc)?;
        if low & 0b11 != 0b11 {
            return Ok((low as u32, 2));
        }
        let high = self.fetch_half(pc, self.xlen().truncate(pc.wrapping_add(2)))?;
        Ok(((high as u32) << 16 | low as u32, 4))
    }

    fn fetch_half(&mut self, pc: u64, vaddr: u64) -> Result<u16, Trap> {
        let paddr = self.translate(vaddr, AccessKind::Fetch).with_pc(pc)?;
        self.bus
            .peek(paddr, Width::H)
            .map(|half| half as u16)
            .map_err(|_| Trap::InstructionAccessFault { pc, addr: vaddr })
    }

    /// Dispatches `trap`, or reports it as fatal when machine mode traps into
    /// a handler that cannot make progress. A fatal trap changes nothing.
    fn take_trap(&mut self, trap: Trap) -> Result<(), MachineError> {
        let route = trap::route(&self.cpu.csrs, &trap);
        if self.cpu.csrs.priv_mode == PrivMode::Machine && route.target == PrivMode::Machine {
            let loops = !trap.is_interrupt() && route.handler_pc == trap.pc();
            let unbacked = !self.bus.ram.contains(route.handler_pc, 2);
            if loops || unbacked {
                return Err(MachineError::Fatal {
                    trap,
                    handler: route.handler_pc,
                });
            }
        }
        self.reservation = None;
        trap::enter(&mut self.cpu, &trap, route);
        Ok(())
    }

    pub(crate) fn translate(&mut self, vaddr: u64, kind: AccessKind) -> Result<u64, MemError> {
        self.mmu.translate(&mut self.bus, &self.cpu.csrs, vaddr, kind)
    }

    /// Translates an access, and the following page too when the access
    /// crosses into it. Both translations happen before any byte moves.
    fn translate_span(
        &mut self,
        vaddr: u64,
        width: Width,
        kind: AccessKind,
    ) -> Result<Span, MemError> {
        let offset = vaddr & (PAGE_SIZE - 1);
        let first = self.translate(vaddr, kind)?;
        if offset + width.bytes() <= PAGE_SIZE {
            return Ok(Span::Contiguous(first));
        }
        let next = self.xlen().truncate((vaddr | (PAGE_SIZE - 1)).wrapping_add(1));
        let second = self.translate(next, kind)?;
        Ok(Span::Split {
            first,
            second,
            split: PAGE_SIZE - offset,
        })
    }

    /// Virtual load, zero-extended. Misaligned accesses are allowed.
    pub(crate) fn load(&mut self, vaddr: u64, width: Width) -> Result<u64, MemError> {
        let vaddr = self.xlen().truncate(vaddr);
        match self.translate_span(vaddr, width, AccessKind::Load)? {
            Span::Contiguous(paddr) => self.load_phys(paddr, vaddr, width, AccessKind::Load),
            Span::Split { first, second, split } => {
                let mut value = 0;
                for i in (0..width.bytes()).rev() {
                    let paddr = if i < split { first + i } else { second + (i - split) };
                    let byte = self.load_phys(paddr, vaddr, Width::B, AccessKind::Load)?;
                    value = (value << 8) | byte;
                }
                Ok(value)
            }
        }
    }

    /// Virtual store of the low `width` bytes of `value`.
    pub(crate) fn store(&mut self, vaddr: u64, width: Width, value: u64) -> Result<(), MemError> {
        let vaddr = self.xlen().truncate(vaddr);
        match self.translate_span(vaddr, width, AccessKind::Store)? {
            Span::Contiguous(paddr) => self.store_phys(paddr, vaddr, width, value),
            Span::Split { first, second, split } => {
                let byte_addr = |i| if i < split { first + i } else { second + (i - split) };
                // both halves must be writable before the first byte lands
                let rejected = (0..width.bytes())
                    .map(byte_addr)
                    .find(|&paddr| !self.bus.accepts_store(paddr, Width::B));
                if let Some(paddr) = rejected {
                    trace!(paddr, "split store rejected");
                    return Err(MemError::AccessFault {
                        kind: AccessKind::Store,
                        addr: vaddr,
                    });
                }
                for i in 0..width.bytes() {
                    self.bus
                        .store(byte_addr(i), Width::B, (value >> (8 * i)) & 0xff)
                        .map_err(|_| MemError::AccessFault {
                            kind: AccessKind::Store,
                            addr: vaddr,
                        })?;
                }
                self.check_tohost(first, truncate_to(width, value));
                Ok(())
            }
        }
    }

    /// Physical load. Bus misses become access faults on `vaddr`.
    pub(crate) fn load_phys(
        &mut self,
        paddr: u64,
        vaddr: u64,
        width: Width,
        kind: AccessKind,
    ) -> Result<u64, MemError> {
        self.bus
            .load(paddr, width)
            .map_err(|_| MemError::AccessFault { kind, addr: vaddr })
    }

    /// Physical store. A store to `tohost` halts the machine once it lands.
    pub(crate) fn store_phys(
        &mut self,
        paddr: u64,
        vaddr: u64,
        width: Width,
        value: u64,
    ) -> Result<(), MemError> {
        let value = truncate_to(width, value);
        self.bus
            .store(paddr, width, value)
            .map_err(|_| MemError::AccessFault {
                kind: AccessKind::Store,
                addr: vaddr,
            })?;
        self.check_tohost(paddr, value);
        Ok(())
    }

    fn check_tohost(&mut self, paddr: u64, value: u64) {
        if self.tohost == Some(paddr) && value != 0 {
            self.exit_code = Some(value);
        }
    }
}

fn truncate_to(width: Width, value: u64) -> u64 {
    match width {
        Width::D => value,
        _ => value & ((1 << (8 * width.bytes())) - 1),
    }
}

enum Span {
    Contiguous(u64),
    Split { first: u64, second: u64, split: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::addr;

    const RAM: usize = 0x10_0000;

    fn machine_with(words: &[u32]) -> Machine {
        let mut m = Machine::new(RAM, Xlen::Bit64);
        for (i, word) in words.iter().enumerate() {
            m.bus
                .ram
                .write_u32(DRAM_BASE + 4 * i as u64, *word)
                .unwrap();
        }
        m
    }

    #[test]
    fn rv32_registers_stay_sign_extended() {
        let mut cpu = Cpu::new(Xlen::Bit32);
        cpu.write_reg(5, 0x8000_0000);
        assert_eq!(cpu.read_reg(5), 0xffff_ffff_8000_0000);
        cpu.write_reg(0, 7);
        assert_eq!(cpu.read_reg(0), 0);
        assert_eq!(Xlen::Bit32.truncate(cpu.read_reg(5)), 0x8000_0000);
    }

    #[test]
    fn step_runs_one_instruction() {
        // addi x1, x0, 5
        let mut m = machine_with(&[0x0050_0093]);
        assert_eq!(m.step(), Ok(StepOutcome::Continued));
        assert_eq!(m.cpu.regs[1], 5);
        assert_eq!(m.cpu.pc, DRAM_BASE + 4);
        assert_eq!(m.cpu.csrs.instret, 1);
    }

    #[test]
    fn illegal_instruction_traps_without_advancing() {
        let mut m = machine_with(&[0xffff_ffff]);
        m.cpu.csrs.mtvec = DRAM_BASE + 0x100;
        let outcome = m.step().unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Trapped(Trap::IllegalInstruction {
                pc: DRAM_BASE,
                inst: 0xffff_ffff
            })
        );
        assert_eq!(m.cpu.csrs.mepc, DRAM_BASE);
        assert_eq!(m.cpu.pc, DRAM_BASE + 0x100);
        assert_eq!(m.cpu.csrs.instret, 0);
    }

    #[test]
    fn machine_trap_into_unbacked_handler_is_fatal() {
        // ecall with mtvec = 0
        let mut m = machine_with(&[0x0000_0073]);
        let err = m.step().unwrap_err();
        assert_eq!(
            err,
            MachineError::Fatal {
                trap: Trap::EcallFromM { pc: DRAM_BASE },
                handler: 0
            }
        );
        // nothing was saved
        assert_eq!(m.cpu.pc, DRAM_BASE);
        assert_eq!(m.cpu.csrs.mepc, 0);
    }

    #[test]
    fn handler_that_faults_on_itself_is_fatal() {
        let mut m = machine_with(&[0xffff_ffff]);
        m.cpu.csrs.write(addr::MTVEC, DRAM_BASE).unwrap();
        assert!(matches!(m.step(), Err(MachineError::Fatal { .. })));
    }

    #[test]
    fn tohost_store_halts() {
        // addi x1, x0, 1 ; sw x1, 0x40(gp)
        let mut m = machine_with(&[0x0010_0093, 0x0411_a023]);
        m.cpu.regs[3] = DRAM_BASE + 0x1000;
        m.set_tohost(Some(DRAM_BASE + 0x1040));
        assert_eq!(m.step(), Ok(StepOutcome::Continued));
        let halted = StepOutcome::Halted(HaltReason::HostExit { code: 1 });
        assert_eq!(m.step(), Ok(halted));
        assert_eq!(m.step(), Ok(halted));
        assert_eq!(m.cpu.pc, DRAM_BASE + 8);
    }

    #[test]
    fn page_crossing_load_is_assembled_bytewise() {
        let mut m = Machine::new(RAM, Xlen::Bit64);
        let addr = DRAM_BASE + PAGE_SIZE - 2;
        m.bus.ram.write_u32(addr, 0xdead_beef).unwrap();
        assert_eq!(m.load(addr, Width::W), Ok(0xdead_beef));
        m.store(addr, Width::W, 0x1234_5678).unwrap();
        assert_eq!(m.bus.ram.read_u32(addr), Ok(0x1234_5678));
    }

    #[test]
    fn page_crossing_store_past_ram_writes_nothing() {
        let mut m = Machine::new(RAM, Xlen::Bit64);
        let addr = DRAM_BASE + RAM as u64 - 4;
        m.bus.ram.write_u32(addr, 0xaaaa_aaaa).unwrap();
        assert_eq!(
            m.store(addr, Width::D, 0x1122_3344_5566_7788),
            Err(MemError::AccessFault {
                kind: AccessKind::Store,
                addr
            })
        );
        assert_eq!(m.bus.ram.read_u32(addr), Ok(0xaaaa_aaaa));
    }

    #[test]
    fn page_crossing_tohost_store_keeps_the_whole_code() {
        let mut m = Machine::new(RAM, Xlen::Bit64);
        let tohost = DRAM_BASE + PAGE_SIZE - 2;
        m.set_tohost(Some(tohost));
        m.store(tohost, Width::W, 0x0003_0101).unwrap();
        assert_eq!(m.exit_code(), Some(0x0003_0101));
    }
}
