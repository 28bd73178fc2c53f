//! Introspection for debuggers and test harnesses.
//!
//! Nothing here changes guest-visible state: memory is read through a
//! side-effect-free walk and device reads never dequeue or claim.

pub mod disasm;

use fnv::FnvHashSet;
use thiserror::Error;
use tracing::trace;

use crate::cpu::compressed;
use crate::cpu::decode::{self, Instr};
use crate::cpu::{Cpu, HaltReason, Machine, MachineError, StepOutcome};
use crate::mem::{AccessKind, MemError, Width};
use crate::mmu::PAGE_SIZE;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugError {
    #[error("no such register: x{0}")]
    InvalidRegister(usize),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeError {
    #[error("page fault at 0x{0:x}")]
    PageFault(u64),

    #[error("nothing backs 0x{0:x}")]
    InvalidAddress(u64),
}

/// Why a bounded run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunUntil {
    /// The PC reached this breakpoint after a step.
    Breakpoint(u64),
    /// The step budget ran out. The machine can be resumed.
    Exhausted,
    Halted(HaltReason),
}

/// Per-instruction trace line, emitted at TRACE level just before execution.
pub fn trace_instruction(cpu: &Cpu, raw: u32, len: u64, instr: &Instr) {
    let digits = (len * 2) as usize;
    trace!(
        pc = format_args!("0x{:x}", cpu.pc),
        inst = format_args!("{raw:0digits$x}"),
        mode = ?cpu.csrs.priv_mode,
        "{instr}"
    );
}

/// Architectural value of `x<index>`, zero-extended from XLEN.
pub fn read_register(m: &Machine, index: usize) -> Result<u64, DebugError> {
    m.cpu
        .regs
        .get(index)
        .map(|&value| m.xlen().truncate(value))
        .ok_or(DebugError::InvalidRegister(index))
}

pub fn read_pc(m: &Machine) -> u64 {
    m.cpu.pc
}

fn probe(m: &Machine, vaddr: u64, kind: AccessKind) -> Result<u64, ProbeError> {
    m.mmu
        .probe(&m.bus, &m.cpu.csrs, vaddr, kind)
        .map_err(|err| match err {
            MemError::PageFault { .. } => ProbeError::PageFault(vaddr),
            _ => ProbeError::InvalidAddress(vaddr),
        })
}

/// Reads `width` bytes at a virtual address, translating the way a load from
/// the current mode would.
fn peek_virtual(m: &Machine, vaddr: u64, width: Width, kind: AccessKind) -> Result<u64, ProbeError> {
    let vaddr = m.xlen().truncate(vaddr);
    if (vaddr & (PAGE_SIZE - 1)) + width.bytes() <= PAGE_SIZE {
        let paddr = probe(m, vaddr, kind)?;
        if let Ok(value) = m.bus.peek(paddr, width) {
            return Ok(value);
        }
    }
    // crosses a page or a device window: go byte by byte
    (0..width.bytes()).try_fold(0, |acc, i| {
        let byte_addr = m.xlen().truncate(vaddr.wrapping_add(i));
        let paddr = probe(m, byte_addr, kind)?;
        let byte = m
            .bus
            .peek(paddr, Width::B)
            .map_err(|_| ProbeError::InvalidAddress(byte_addr))?;
        Ok(acc | byte << (8 * i))
    })
}

/// Eight bytes, little-endian, at a virtual address.
pub fn read_memory(m: &Machine, vaddr: u64) -> Result<u64, ProbeError> {
    peek_virtual(m, vaddr, Width::D, AccessKind::Load)
}

/// Runs at most `n` steps. Stops early, returning the reason, if the machine
/// halts.
pub fn step_n(m: &mut Machine, n: u64) -> Result<Option<HaltReason>, MachineError> {
    for _ in 0..n {
        if let StepOutcome::Halted(reason) = m.step()? {
            return Ok(Some(reason));
        }
    }
    Ok(None)
}

/// Steps until the PC lands on one of `breakpoints`, checking after every
/// step, or until `max_steps` steps have run.
pub fn run_until(
    m: &mut Machine,
    breakpoints: &[u64],
    max_steps: u64,
) -> Result<RunUntil, MachineError> {
    let breakpoints: FnvHashSet<u64> = breakpoints.iter().copied().collect();
    for _ in 0..max_steps {
        if let StepOutcome::Halted(reason) = m.step()? {
            return Ok(RunUntil::Halted(reason));
        }
        if breakpoints.contains(&m.cpu.pc) {
            return Ok(RunUntil::Breakpoint(m.cpu.pc));
        }
    }
    Ok(RunUntil::Exhausted)
}

/// Disassembles the instruction at a virtual address without executing it.
pub fn disassemble_at(m: &Machine, vaddr: u64) -> String {
    let low = match peek_virtual(m, vaddr, Width::H, AccessKind::Fetch) {
        Ok(half) => half as u32,
        Err(err) => return format!("<{err}>"),
    };
    let (raw, decoded) = if low & 0b11 != 0b11 {
        (low, compressed::expand(low as u16, m.xlen()))
    } else {
        match peek_virtual(m, vaddr.wrapping_add(2), Width::H, AccessKind::Fetch) {
            Ok(high) => {
                let raw = (high as u32) << 16 | low;
                (raw, decode::decode(raw, m.xlen()))
            }
            Err(err) => return format!("<{err}>"),
        }
    };
    match decoded {
        Ok(instr) => instr.to_string(),
        Err(_) if raw & 0b11 != 0b11 => format!("<illegal 0x{raw:04x}>"),
        Err(_) => format!("<illegal 0x{raw:08x}>"),
    }
}
