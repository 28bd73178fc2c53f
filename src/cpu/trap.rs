use thiserror::Error;
use tracing::debug;

use super::{Cpu, Xlen};
use crate::csr::{CsrFile, PrivMode, mstatus};
use crate::mem::{AccessKind, MemError};

/// Exception cause codes (RISC-V Privileged Spec)
pub mod causes {
    pub const INSTRUCTION_ADDRESS_MISALIGNED: u64 = 0;
    pub const INSTRUCTION_ACCESS_FAULT: u64 = 1;
    pub const ILLEGAL_INSTRUCTION: u64 = 2;
    pub const BREAKPOINT: u64 = 3;
    pub const LOAD_ADDRESS_MISALIGNED: u64 = 4;
    pub const LOAD_ACCESS_FAULT: u64 = 5;
    pub const STORE_ADDRESS_MISALIGNED: u64 = 6;
    pub const STORE_ACCESS_FAULT: u64 = 7;
    pub const ECALL_U: u64 = 8;
    pub const ECALL_S: u64 = 9;
    pub const ECALL_M: u64 = 11;
    pub const INSTRUCTION_PAGE_FAULT: u64 = 12;
    pub const LOAD_PAGE_FAULT: u64 = 13;
    pub const STORE_PAGE_FAULT: u64 = 15;

    // Interrupt causes (high bit set when interrupt)
    pub const SSI: u64 = 1;
    pub const MSI: u64 = 3;
    pub const STI: u64 = 5;
    pub const MTI: u64 = 7;
    pub const SEI: u64 = 9;
    pub const MEI: u64 = 11;
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    #[error("instruction address misaligned at pc=0x{pc:x}, addr=0x{addr:x}")]
    InstructionMisaligned { pc: u64, addr: u64 },

    #[error("instruction access fault at pc=0x{pc:x}, addr=0x{addr:x}")]
    InstructionAccessFault { pc: u64, addr: u64 },

    #[error("illegal instruction at pc=0x{pc:x} inst=0x{inst:08x}")]
    IllegalInstruction { pc: u64, inst: u32 },

    #[error("breakpoint at pc=0x{pc:x}")]
    Breakpoint { pc: u64 },

    #[error("load address misaligned at pc=0x{pc:x}, addr=0x{addr:x}")]
    LoadMisaligned { pc: u64, addr: u64 },

    #[error("load access fault at pc=0x{pc:x}, addr=0x{addr:x}")]
    LoadAccessFault { pc: u64, addr: u64 },

    #[error("store address misaligned at pc=0x{pc:x}, addr=0x{addr:x}")]
    StoreMisaligned { pc: u64, addr: u64 },

    #[error("store access fault at pc=0x{pc:x}, addr=0x{addr:x}")]
    StoreAccessFault { pc: u64, addr: u64 },

    #[error("user environment call at pc=0x{pc:x}")]
    EcallFromU { pc: u64 },

    #[error("supervisor environment call at pc=0x{pc:x}")]
    EcallFromS { pc: u64 },

    #[error("machine environment call at pc=0x{pc:x}")]
    EcallFromM { pc: u64 },

    #[error("instruction page fault at pc=0x{pc:x}, addr=0x{addr:x}")]
    InstructionPageFault { pc: u64, addr: u64 },

    #[error("load page fault at pc=0x{pc:x}, addr=0x{addr:x}")]
    LoadPageFault { pc: u64, addr: u64 },

    #[error("store page fault at pc=0x{pc:x}, addr=0x{addr:x}")]
    StorePageFault { pc: u64, addr: u64 },

    // Interrupts
    #[error("machine software interrupt")]
    MachineSoftwareInterrupt { pc: u64 },

    #[error("machine timer interrupt")]
    MachineTimerInterrupt { pc: u64 },

    #[error("machine external interrupt")]
    MachineExternalInterrupt { pc: u64 },

    #[error("supervisor software interrupt")]
    SupervisorSoftwareInterrupt { pc: u64 },

    #[error("supervisor timer interrupt")]
    SupervisorTimerInterrupt { pc: u64 },

    #[error("supervisor external interrupt")]
    SupervisorExternalInterrupt { pc: u64 },
}

impl Trap {
    /// Interrupt for a `mip` bit number, taken at `pc`.
    pub fn interrupt(cause: u64, pc: u64) -> Option<Self> {
        Some(match cause {
            causes::SSI => Trap::SupervisorSoftwareInterrupt { pc },
            causes::MSI => Trap::MachineSoftwareInterrupt { pc },
            causes::STI => Trap::SupervisorTimerInterrupt { pc },
            causes::MTI => Trap::MachineTimerInterrupt { pc },
            causes::SEI => Trap::SupervisorExternalInterrupt { pc },
            causes::MEI => Trap::MachineExternalInterrupt { pc },
            _ => return None,
        })
    }

    /// Environment call from the given privilege mode.
    pub fn ecall(mode: PrivMode, pc: u64) -> Self {
        match mode {
            PrivMode::User => Trap::EcallFromU { pc },
            PrivMode::Supervisor => Trap::EcallFromS { pc },
            PrivMode::Machine => Trap::EcallFromM { pc },
        }
    }

    /// Returns the exception/interrupt cause code
    pub fn cause(&self) -> u64 {
        match self {
            // Exceptions (no interrupt bit)
            Trap::InstructionMisaligned { .. } => causes::INSTRUCTION_ADDRESS_MISALIGNED,
            Trap::InstructionAccessFault { .. } => causes::INSTRUCTION_ACCESS_FAULT,
            Trap::IllegalInstruction { .. } => causes::ILLEGAL_INSTRUCTION,
            Trap::Breakpoint { .. } => causes::BREAKPOINT,
            Trap::LoadMisaligned { .. } => causes::LOAD_ADDRESS_MISALIGNED,
            Trap::LoadAccessFault { .. } => causes::LOAD_ACCESS_FAULT,
            Trap::StoreMisaligned { .. } => causes::STORE_ADDRESS_MISALIGNED,
            Trap::StoreAccessFault { .. } => causes::STORE_ACCESS_FAULT,
            Trap::EcallFromU { .. } => causes::ECALL_U,
            Trap::EcallFromS { .. } => causes::ECALL_S,
            Trap::EcallFromM { .. } => causes::ECALL_M,
            Trap::InstructionPageFault { .. } => causes::INSTRUCTION_PAGE_FAULT,
            Trap::LoadPageFault { .. } => causes::LOAD_PAGE_FAULT,
            Trap::StorePageFault { .. } => causes::STORE_PAGE_FAULT,

            // Interrupts (cause without interrupt bit)
            Trap::SupervisorSoftwareInterrupt { .. } => causes::SSI,
            Trap::MachineSoftwareInterrupt { .. } => causes::MSI,
            Trap::SupervisorTimerInterrupt { .. } => causes::STI,
            Trap::MachineTimerInterrupt { .. } => causes::MTI,
            Trap::SupervisorExternalInterrupt { .. } => causes::SEI,
            Trap::MachineExternalInterrupt { .. } => causes::MEI,
        }
    }

    /// Returns true if this is an interrupt (vs synchronous exception)
    pub fn is_interrupt(&self) -> bool {
        matches!(
            self,
            Trap::MachineSoftwareInterrupt { .. }
                | Trap::MachineTimerInterrupt { .. }
                | Trap::MachineExternalInterrupt { .. }
                | Trap::SupervisorSoftwareInterrupt { .. }
                | Trap::SupervisorTimerInterrupt { .. }
                | Trap::SupervisorExternalInterrupt { .. }
        )
    }

    /// Returns the trap value (mtval/stval)
    pub fn tval(&self) -> u64 {
        match self {
            Trap::IllegalInstruction { inst, .. } => *inst as u64,
            Trap::Breakpoint { pc } => *pc,
            Trap::InstructionMisaligned { addr, .. }
            | Trap::InstructionAccessFault { addr, .. }
            | Trap::LoadMisaligned { addr, .. }
            | Trap::LoadAccessFault { addr, .. }
            | Trap::StoreMisaligned { addr, .. }
            | Trap::StoreAccessFault { addr, .. }
            | Trap::InstructionPageFault { addr, .. }
            | Trap::LoadPageFault { addr, .. }
            | Trap::StorePageFault { addr, .. } => *addr,
            _ => 0,
        }
    }

    /// Returns the PC where the trap occurred
    pub fn pc(&self) -> u64 {
        match self {
            Trap::InstructionMisaligned { pc, .. }
            | Trap::InstructionAccessFault { pc, .. }
            | Trap::IllegalInstruction { pc, .. }
            | Trap::Breakpoint { pc }
            | Trap::LoadMisaligned { pc, .. }
            | Trap::LoadAccessFault { pc, .. }
            | Trap::StoreMisaligned { pc, .. }
            | Trap::StoreAccessFault { pc, .. }
            | Trap::EcallFromU { pc }
            | Trap::EcallFromS { pc }
            | Trap::EcallFromM { pc }
            | Trap::InstructionPageFault { pc, .. }
            | Trap::LoadPageFault { pc, .. }
            | Trap::StorePageFault { pc, .. }
            | Trap::MachineSoftwareInterrupt { pc }
            | Trap::MachineTimerInterrupt { pc }
            | Trap::MachineExternalInterrupt { pc }
            | Trap::SupervisorSoftwareInterrupt { pc }
            | Trap::SupervisorTimerInterrupt { pc }
            | Trap::SupervisorExternalInterrupt { pc } => *pc,
        }
    }

    /// Value written to mcause/scause.
    pub fn xcause(&self, xlen: Xlen) -> u64 {
        if self.is_interrupt() {
            (1 << (xlen.bits() - 1)) | self.cause()
        } else {
            self.cause()
        }
    }
}

/// Trait for adding PC context to errors that can become Traps
pub trait WithPc<T> {
    fn with_pc(self, pc: u64) -> Result<T, Trap>;
}

impl<T> WithPc<T> for Result<T, MemError> {
    fn with_pc(self, pc: u64) -> Result<T, Trap> {
        self.map_err(|err| match err {
            MemError::PageFault { kind, addr } => match kind {
                AccessKind::Fetch => Trap::InstructionPageFault { pc, addr },
                AccessKind::Load => Trap::LoadPageFault { pc, addr },
                AccessKind::Store => Trap::StorePageFault { pc, addr },
            },
            MemError::AccessFault { kind, addr } => match kind {
                AccessKind::Fetch => Trap::InstructionAccessFault { pc, addr },
                AccessKind::Load => Trap::LoadAccessFault { pc, addr },
                AccessKind::Store => Trap::StoreAccessFault { pc, addr },
            },
            // callers map physical misses to a kind first
            MemError::Oob(addr) => Trap::LoadAccessFault { pc, addr },
        })
    }
}

impl<T> WithPc<T> for Result<T, crate::cpu::decode::DecodeError> {
    fn with_pc(self, pc: u64) -> Result<T, Trap> {
        self.map_err(|err| Trap::IllegalInstruction {
            pc,
            inst: err.inst(),
        })
    }
}

/// Where a trap will be taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapRoute {
    pub target: PrivMode,
    pub handler_pc: u64,
}

/// Decides the target mode and handler address for `trap` without changing
/// any state.
pub fn route(csrs: &CsrFile, trap: &Trap) -> TrapRoute {
    let cause = trap.cause();
    let delegated = if trap.is_interrupt() {
        csrs.should_delegate_interrupt(cause)
    } else {
        csrs.should_delegate_exception(cause)
    };
    let (target, tvec) = if delegated {
        (PrivMode::Supervisor, csrs.stvec)
    } else {
        (PrivMode::Machine, csrs.mtvec)
    };

    let base = tvec & !0b11;
    let vectored = tvec & 0b11 == 1;
    let handler_pc = if vectored && trap.is_interrupt() {
        base.wrapping_add(4 * cause)
    } else {
        base
    };
    TrapRoute {
        target,
        handler_pc: csrs.xlen().truncate(handler_pc),
    }
}

/// Takes `trap` along `route`: saves state into the target mode's CSRs and
/// jumps to the handler.
pub fn enter(cpu: &mut Cpu, trap: &Trap, route: TrapRoute) {
    let csrs = &mut cpu.csrs;
    let from = csrs.priv_mode;
    let xcause = trap.xcause(csrs.xlen());

    match route.target {
        PrivMode::Supervisor => {
            csrs.sepc = trap.pc();
            csrs.scause = xcause;
            csrs.stval = trap.tval();
            let sie = csrs.mstatus_bit(mstatus::SIE);
            csrs.set_mstatus_bit(mstatus::SPIE, sie);
            csrs.set_mstatus_bit(mstatus::SIE, false);
            csrs.set_spp(from);
        }
        _ => {
            csrs.mepc = trap.pc();
            csrs.mcause = xcause;
            csrs.mtval = trap.tval();
            let mie = csrs.mstatus_bit(mstatus::MIE);
            csrs.set_mstatus_bit(mstatus::MPIE, mie);
            csrs.set_mstatus_bit(mstatus::MIE, false);
            csrs.set_mpp(from);
        }
    }
    csrs.priv_mode = route.target;
    cpu.pc = route.handler_pc;

    debug!(
        %trap,
        from = ?from,
        to = ?route.target,
        handler = format_args!("0x{:x}", route.handler_pc),
        "trap taken"
    );
}

/// Returns from a machine-mode trap handler.
pub fn mret(cpu: &mut Cpu) {
    let csrs = &mut cpu.csrs;
    let to = csrs.mpp();
    let mpie = csrs.mstatus_bit(mstatus::MPIE);
    csrs.set_mstatus_bit(mstatus::MIE, mpie);
    csrs.set_mstatus_bit(mstatus::MPIE, true);
    csrs.set_mpp(PrivMode::User);
    if to != PrivMode::Machine {
        csrs.set_mstatus_bit(mstatus::MPRV, false);
    }
    csrs.priv_mode = to;
    cpu.pc = csrs.mepc;
    debug!(to = ?to, pc = format_args!("0x{:x}", cpu.pc), "mret");
}

/// Returns from a supervisor-mode trap handler.
pub fn sret(cpu: &mut Cpu) {
    let csrs = &mut cpu.csrs;
    let to = csrs.spp();
    let spie = csrs.mstatus_bit(mstatus::SPIE);
    csrs.set_mstatus_bit(mstatus::SIE, spie);
    csrs.set_mstatus_bit(mstatus::SPIE, true);
    csrs.set_spp(PrivMode::User);
    csrs.set_mstatus_bit(mstatus::MPRV, false);
    csrs.priv_mode = to;
    cpu.pc = csrs.sepc;
    debug!(to = ?to, pc = format_args!("0x{:x}", cpu.pc), "sret");
}
