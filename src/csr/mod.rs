use thiserror::Error;
use tracing::debug;

use crate::cpu::Xlen;
use crate::mem::AccessKind;
use crate::mmu::AddressingMode;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CsrError {
    #[error("unsupported CSR read: 0x{0:03x}")]
    UnsupportedRead(u16),
    #[error("unsupported CSR write: 0x{0:03x}")]
    UnsupportedWrite(u16),
    #[error("privilege violation accessing CSR: 0x{0:03x}")]
    PrivilegeViolation(u16),
    #[error("write to read-only CSR: 0x{0:03x}")]
    ReadOnly(u16),
    #[error("counter CSR 0x{0:03x} not enabled for this mode")]
    CounterDisabled(u16),
}

/// CSR numbers
pub mod addr {
    pub const SSTATUS: u16 = 0x100;
    pub const SIE: u16 = 0x104;
    pub const STVEC: u16 = 0x105;
    pub const SCOUNTEREN: u16 = 0x106;
    pub const SENVCFG: u16 = 0x10a;
    pub const SSCRATCH: u16 = 0x140;
    pub const SEPC: u16 = 0x141;
    pub const SCAUSE: u16 = 0x142;
    pub const STVAL: u16 = 0x143;
    pub const SIP: u16 = 0x144;
    pub const SATP: u16 = 0x180;

    pub const MSTATUS: u16 = 0x300;
    pub const MISA: u16 = 0x301;
    pub const MEDELEG: u16 = 0x302;
    pub const MIDELEG: u16 = 0x303;
    pub const MIE: u16 = 0x304;
    pub const MTVEC: u16 = 0x305;
    pub const MCOUNTEREN: u16 = 0x306;
    pub const MENVCFG: u16 = 0x30a;
    pub const MSTATUSH: u16 = 0x310;
    pub const MCOUNTINHIBIT: u16 = 0x320;
    pub const MSCRATCH: u16 = 0x340;
    pub const MEPC: u16 = 0x341;
    pub const MCAUSE: u16 = 0x342;
    pub const MTVAL: u16 = 0x343;
    pub const MIP: u16 = 0x344;

    pub const MCYCLE: u16 = 0xb00;
    pub const MINSTRET: u16 = 0xb02;
    pub const MCYCLEH: u16 = 0xb80;
    pub const MINSTRETH: u16 = 0xb82;
    pub const CYCLE: u16 = 0xc00;
    pub const TIME: u16 = 0xc01;
    pub const INSTRET: u16 = 0xc02;
    pub const CYCLEH: u16 = 0xc80;
    pub const TIMEH: u16 = 0xc81;
    pub const INSTRETH: u16 = 0xc82;

    pub const MVENDORID: u16 = 0xf11;
    pub const MARCHID: u16 = 0xf12;
    pub const MIMPID: u16 = 0xf13;
    pub const MHARTID: u16 = 0xf14;
    pub const MCONFIGPTR: u16 = 0xf15;
}

/// mstatus fields
pub mod mstatus {
    pub const SIE: u64 = 1 << 1;
    pub const MIE: u64 = 1 << 3;
    pub const SPIE: u64 = 1 << 5;
    pub const MPIE: u64 = 1 << 7;
    pub const SPP: u64 = 1 << 8;
    pub const MPP: u64 = 0b11 << 11;
    pub const MPRV: u64 = 1 << 17;
    pub const SUM: u64 = 1 << 18;
    pub const MXR: u64 = 1 << 19;
    pub const TVM: u64 = 1 << 20;
    pub const TW: u64 = 1 << 21;
    pub const TSR: u64 = 1 << 22;
    pub const UXL: u64 = 0b11 << 32;
    pub const SXL: u64 = 0b11 << 34;
}

/// mip/mie bits
pub mod irq {
    pub const SSIP: u64 = 1 << 1;
    pub const MSIP: u64 = 1 << 3;
    pub const STIP: u64 = 1 << 5;
    pub const MTIP: u64 = 1 << 7;
    pub const SEIP: u64 = 1 << 9;
    pub const MEIP: u64 = 1 << 11;
}

const SUPERVISOR_IRQS: u64 = irq::SSIP | irq::STIP | irq::SEIP;
const ALL_IRQS: u64 = SUPERVISOR_IRQS | irq::MSIP | irq::MTIP | irq::MEIP;

const MSTATUS_WRITABLE: u64 = mstatus::SIE
    | mstatus::MIE
    | mstatus::SPIE
    | mstatus::MPIE
    | mstatus::SPP
    | mstatus::MPP
    | mstatus::MPRV
    | mstatus::SUM
    | mstatus::MXR
    | mstatus::TVM
    | mstatus::TW
    | mstatus::TSR;

const SSTATUS_READABLE: u64 = mstatus::SIE
    | mstatus::SPIE
    | mstatus::SPP
    | mstatus::SUM
    | mstatus::MXR
    | mstatus::UXL;

const SSTATUS_WRITABLE: u64 =
    mstatus::SIE | mstatus::SPIE | mstatus::SPP | mstatus::SUM | mstatus::MXR;

/// Privilege modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PrivMode {
    User = 0,
    Supervisor = 1,
    #[default]
    Machine = 3,
}

impl PrivMode {
    pub fn from_u64(val: u64) -> Option<Self> {
        match val {
            0 => Some(PrivMode::User),
            1 => Some(PrivMode::Supervisor),
            3 => Some(PrivMode::Machine),
            _ => None,
        }
    }
}

pub struct CsrFile {
    // Current privilege mode
    pub priv_mode: PrivMode,
    xlen: Xlen,

    // Machine-mode CSRs
    pub mstatus: u64,
    pub mtvec: u64,
    pub mepc: u64,
    pub mcause: u64,
    pub mtval: u64,
    pub mie: u64,
    pub mip: u64,
    pub medeleg: u64,
    pub mideleg: u64,
    pub mscratch: u64,
    pub mcounteren: u64,
    pub mcountinhibit: u64,

    // Supervisor-mode CSRs
    pub stvec: u64,
    pub sepc: u64,
    pub scause: u64,
    pub stval: u64,
    pub sscratch: u64,
    pub satp: u64,
    pub scounteren: u64,

    // Counters
    pub cycle: u64,
    pub instret: u64,
    pub time: u64,

    // Physical Memory Protection, stored but not enforced
    pmpaddr: [u64; 64],
    pmpcfg: [u64; 16],

    mhartid: u64,
}

impl CsrFile {
    pub fn new(xlen: Xlen) -> Self {
        let mstatus = match xlen {
            // UXL = SXL = 64
            Xlen::Bit64 => (2 << 32) | (2 << 34),
            Xlen::Bit32 => 0,
        };
        Self {
            priv_mode: PrivMode::Machine,
            xlen,
            mstatus,
            mtvec: 0,
            mepc: 0,
            mcause: 0,
            mtval: 0,
            mie: 0,
            mip: 0,
            medeleg: 0,
            mideleg: 0,
            mscratch: 0,
            mcounteren: 0,
            mcountinhibit: 0,
            stvec: 0,
            sepc: 0,
            scause: 0,
            stval: 0,
            sscratch: 0,
            satp: 0,
            scounteren: 0,
            cycle: 0,
            instret: 0,
            time: 0,
            pmpaddr: [0; 64],
            pmpcfg: [0; 16],
            mhartid: 0,
        }
    }

    pub fn xlen(&self) -> Xlen {
        self.xlen
    }

    /// RV32/RV64 IMACSU
    pub fn misa(&self) -> u64 {
        const EXTENSIONS: u64 = (1 << 0)  // A
            | (1 << 2)  // C
            | (1 << 8)  // I
            | (1 << 12) // M
            | (1 << 18) // S
            | (1 << 20); // U
        match self.xlen {
            Xlen::Bit32 => (1 << 30) | EXTENSIONS,
            Xlen::Bit64 => (2 << 62) | EXTENSIONS,
        }
    }

    pub fn mstatus_bit(&self, mask: u64) -> bool {
        self.mstatus & mask != 0
    }

    pub fn set_mstatus_bit(&mut self, mask: u64, on: bool) {
        if on {
            self.mstatus |= mask;
        } else {
            self.mstatus &= !mask;
        }
    }

    /// Extract MPP field from mstatus
    pub fn mpp(&self) -> PrivMode {
        let mpp = (self.mstatus >> 11) & 0b11;
        PrivMode::from_u64(mpp).unwrap_or(PrivMode::User)
    }

    /// Set MPP field in mstatus
    pub fn set_mpp(&mut self, mode: PrivMode) {
        self.mstatus = (self.mstatus & !mstatus::MPP) | ((mode as u64) << 11);
    }

    /// Extract SPP field from mstatus
    pub fn spp(&self) -> PrivMode {
        if self.mstatus_bit(mstatus::SPP) {
            PrivMode::Supervisor
        } else {
            PrivMode::User
        }
    }

    /// Set SPP field in mstatus
    pub fn set_spp(&mut self, mode: PrivMode) {
        self.set_mstatus_bit(mstatus::SPP, mode == PrivMode::Supervisor);
    }

    /// Privilege that loads and stores are checked against (MPRV aware).
    pub fn effective_priv(&self, kind: AccessKind) -> PrivMode {
        if kind != AccessKind::Fetch && self.mstatus_bit(mstatus::MPRV) {
            self.mpp()
        } else {
            self.priv_mode
        }
    }

    pub fn addressing_mode(&self) -> AddressingMode {
        match self.xlen {
            Xlen::Bit32 => {
                if (self.satp >> 31) & 1 == 1 {
                    AddressingMode::Sv32
                } else {
                    AddressingMode::Bare
                }
            }
            Xlen::Bit64 => match self.satp >> 60 {
                8 => AddressingMode::Sv39,
                9 => AddressingMode::Sv48,
                _ => AddressingMode::Bare,
            },
        }
    }

    /// Physical page number of the root page table
    pub fn root_ppn(&self) -> u64 {
        match self.xlen {
            Xlen::Bit32 => self.satp & 0x3f_ffff,
            Xlen::Bit64 => self.satp & 0xfff_ffff_ffff,
        }
    }

    /// Check if an exception should be delegated to S-mode
    pub fn should_delegate_exception(&self, cause: u64) -> bool {
        if self.priv_mode == PrivMode::Machine {
            return false; // No delegation from M-mode
        }
        (self.medeleg >> cause) & 1 != 0
    }

    /// Check if an interrupt should be delegated to S-mode
    pub fn should_delegate_interrupt(&self, cause: u64) -> bool {
        if self.priv_mode == PrivMode::Machine {
            return false;
        }
        (self.mideleg >> cause) & 1 != 0
    }

    fn sstatus(&self) -> u64 {
        self.mstatus & SSTATUS_READABLE
    }

    fn write_sstatus(&mut self, value: u64) {
        self.mstatus = (self.mstatus & !SSTATUS_WRITABLE) | (value & SSTATUS_WRITABLE);
    }

    fn sip(&self) -> u64 {
        self.mip & self.mideleg & SUPERVISOR_IRQS
    }

    fn write_sip(&mut self, value: u64) {
        let writable = irq::SSIP & self.mideleg;
        self.mip = (self.mip & !writable) | (value & writable);
    }

    fn sie(&self) -> u64 {
        self.mie & self.mideleg & SUPERVISOR_IRQS
    }

    fn write_sie(&mut self, value: u64) {
        let writable = self.mideleg & SUPERVISOR_IRQS;
        self.mie = (self.mie & !writable) | (value & writable);
    }

    /// Check privilege level for CSR access
    fn check_csr_privilege(&self, csr: u16) -> Result<(), CsrError> {
        let priv_level = (csr >> 8) & 0x3;
        let required = match priv_level {
            0 => PrivMode::User,
            1 => PrivMode::Supervisor,
            3 => PrivMode::Machine,
            // hypervisor CSRs
            _ => return Err(CsrError::UnsupportedRead(csr)),
        };

        if self.priv_mode < required {
            return Err(CsrError::PrivilegeViolation(csr));
        }
        if csr == addr::SATP
            && self.priv_mode == PrivMode::Supervisor
            && self.mstatus_bit(mstatus::TVM)
        {
            return Err(CsrError::PrivilegeViolation(csr));
        }
        Ok(())
    }

    /// User counters are gated by mcounteren (below M) and scounteren (in U).
    fn check_counter_enabled(&self, csr: u16) -> Result<(), CsrError> {
        let bit = (csr & 0x1f) as u64;
        if self.priv_mode < PrivMode::Machine && (self.mcounteren >> bit) & 1 == 0 {
            return Err(CsrError::CounterDisabled(csr));
        }
        if self.priv_mode == PrivMode::User && (self.scounteren >> bit) & 1 == 0 {
            return Err(CsrError::CounterDisabled(csr));
        }
        Ok(())
    }

    fn rv32_only(&self, csr: u16) -> Result<(), CsrError> {
        match self.xlen {
            Xlen::Bit32 => Ok(()),
            Xlen::Bit64 => Err(CsrError::UnsupportedRead(csr)),
        }
    }

    pub fn read(&self, csr: u16) -> Result<u64, CsrError> {
        self.check_csr_privilege(csr)?;

        match csr {
            // Supervisor trap setup
            addr::SSTATUS => Ok(self.sstatus()),
            addr::SIE => Ok(self.sie()),
            addr::STVEC => Ok(self.stvec),
            addr::SCOUNTEREN => Ok(self.scounteren),
            addr::SENVCFG => Ok(0),

            // Supervisor trap handling
            addr::SSCRATCH => Ok(self.sscratch),
            addr::SEPC => Ok(self.sepc),
            addr::SCAUSE => Ok(self.scause),
            addr::STVAL => Ok(self.stval),
            addr::SIP => Ok(self.sip()),

            // Supervisor address translation
            addr::SATP => Ok(self.satp),

            // Machine information registers
            addr::MVENDORID | addr::MARCHID | addr::MIMPID | addr::MCONFIGPTR => Ok(0),
            addr::MHARTID => Ok(self.mhartid),

            // Machine trap setup
            addr::MSTATUS => Ok(self.mstatus),
            addr::MISA => Ok(self.misa()),
            addr::MEDELEG => Ok(self.medeleg),
            addr::MIDELEG => Ok(self.mideleg),
            addr::MIE => Ok(self.mie),
            addr::MTVEC => Ok(self.mtvec),
            addr::MCOUNTEREN => Ok(self.mcounteren),
            addr::MENVCFG => Ok(0),
            addr::MSTATUSH => self.rv32_only(csr).map(|_| 0),
            addr::MCOUNTINHIBIT => Ok(self.mcountinhibit),
            0x323..=0x33f => Ok(0), // mhpmevent3..31

            // Machine trap handling
            addr::MSCRATCH => Ok(self.mscratch),
            addr::MEPC => Ok(self.mepc),
            addr::MCAUSE => Ok(self.mcause),
            addr::MTVAL => Ok(self.mtval),
            addr::MIP => Ok(self.mip),

            // Physical memory protection
            0x3a0..=0x3af => Ok(self.pmpcfg[(csr - 0x3a0) as usize]),
            0x3b0..=0x3ef => Ok(self.pmpaddr[(csr - 0x3b0) as usize]),

            // Machine counters
            addr::MCYCLE => Ok(self.cycle),
            addr::MINSTRET => Ok(self.instret),
            0xb03..=0xb1f => Ok(0),
            addr::MCYCLEH => self.rv32_only(csr).map(|_| self.cycle >> 32),
            addr::MINSTRETH => self.rv32_only(csr).map(|_| self.instret >> 32),
            0xb83..=0xb9f => self.rv32_only(csr).map(|_| 0),

            // User counters
            addr::CYCLE | addr::TIME | addr::INSTRET | 0xc03..=0xc1f => {
                self.check_counter_enabled(csr)?;
                Ok(match csr {
                    addr::CYCLE => self.cycle,
                    addr::TIME => self.time,
                    addr::INSTRET => self.instret,
                    _ => 0,
                })
            }
            addr::CYCLEH | addr::TIMEH | addr::INSTRETH | 0xc83..=0xc9f => {
                self.rv32_only(csr)?;
                self.check_counter_enabled(csr)?;
                Ok(match csr {
                    addr::CYCLEH => self.cycle >> 32,
                    addr::TIMEH => self.time >> 32,
                    addr::INSTRETH => self.instret >> 32,
                    _ => 0,
                })
            }

            _ => Err(CsrError::UnsupportedRead(csr)),
        }
    }

    pub fn write(&mut self, csr: u16, value: u64) -> Result<(), CsrError> {
        self.check_csr_privilege(csr)?;

        // Read-only CSRs have the top 2 bits set
        if (csr >> 10) == 0b11 {
            return Err(CsrError::ReadOnly(csr));
        }

        let value = match self.xlen {
            Xlen::Bit32 => value & 0xffff_ffff,
            Xlen::Bit64 => value,
        };

        match csr {
            // Supervisor trap setup
            addr::SSTATUS => self.write_sstatus(value),
            addr::SIE => self.write_sie(value),
            addr::STVEC => self.stvec = legal_tvec(value),
            addr::SCOUNTEREN => self.scounteren = value & 0xffff_ffff,
            addr::SENVCFG => {}

            // Supervisor trap handling
            addr::SSCRATCH => self.sscratch = value,
            addr::SEPC => self.sepc = value & !0b1,
            addr::SCAUSE => self.scause = value,
            addr::STVAL => self.stval = value,
            addr::SIP => self.write_sip(value),

            // Supervisor address translation
            addr::SATP => self.write_satp(value),

            // Machine trap setup
            addr::MSTATUS => {
                let mut next = (self.mstatus & !MSTATUS_WRITABLE) | (value & MSTATUS_WRITABLE);
                // MPP is WARL, 2 is reserved
                if (next & mstatus::MPP) >> 11 == 2 {
                    next = (next & !mstatus::MPP) | (self.mstatus & mstatus::MPP);
                }
                self.mstatus = next;
            }
            addr::MISA => {}
            // ecall from M can never be delegated
            addr::MEDELEG => self.medeleg = value & 0xb3ff,
            addr::MIDELEG => self.mideleg = value & SUPERVISOR_IRQS,
            addr::MIE => self.mie = value & ALL_IRQS,
            addr::MTVEC => self.mtvec = legal_tvec(value),
            addr::MCOUNTEREN => self.mcounteren = value & 0xffff_ffff,
            addr::MENVCFG => {}
            addr::MSTATUSH => self.rv32_only(csr)?,
            addr::MCOUNTINHIBIT => self.mcountinhibit = value & 0xffff_fffd,
            0x323..=0x33f => {}

            // Machine trap handling
            addr::MSCRATCH => self.mscratch = value,
            addr::MEPC => self.mepc = value & !0b1,
            addr::MCAUSE => self.mcause = value,
            addr::MTVAL => self.mtval = value,
            addr::MIP => {
                // MSIP, MTIP and MEIP are driven by the CLINT and PLIC
                self.mip = (self.mip & !SUPERVISOR_IRQS) | (value & SUPERVISOR_IRQS);
            }

            // Physical memory protection
            0x3a0..=0x3af => self.pmpcfg[(csr - 0x3a0) as usize] = value,
            0x3b0..=0x3ef => self.pmpaddr[(csr - 0x3b0) as usize] = value,

            // Machine counters
            addr::MCYCLE => self.cycle = self.replace_low(self.cycle, value),
            addr::MINSTRET => self.instret = self.replace_low(self.instret, value),
            0xb03..=0xb1f => {}
            addr::MCYCLEH => {
                self.rv32_only(csr)?;
                self.cycle = (self.cycle & 0xffff_ffff) | (value << 32);
            }
            addr::MINSTRETH => {
                self.rv32_only(csr)?;
                self.instret = (self.instret & 0xffff_ffff) | (value << 32);
            }
            0xb83..=0xb9f => self.rv32_only(csr)?,

            _ => return Err(CsrError::UnsupportedWrite(csr)),
        }
        Ok(())
    }

    fn replace_low(&self, current: u64, value: u64) -> u64 {
        match self.xlen {
            Xlen::Bit32 => (current & !0xffff_ffff) | value,
            Xlen::Bit64 => value,
        }
    }

    fn write_satp(&mut self, value: u64) {
        let supported = match self.xlen {
            Xlen::Bit32 => true,
            Xlen::Bit64 => matches!(value >> 60, 0 | 8 | 9),
        };
        // WARL: unsupported modes leave satp unchanged
        if supported {
            self.satp = value;
            debug!(satp = format_args!("0x{value:x}"), mode = ?self.addressing_mode(), "satp written");
        }
    }

    pub fn set_bits(&mut self, csr: u16, mask: u64) -> Result<(), CsrError> {
        let current = self.read(csr)?;
        self.write(csr, current | mask)
    }

    pub fn clear_bits(&mut self, csr: u16, mask: u64) -> Result<(), CsrError> {
        let current = self.read(csr)?;
        self.write(csr, current & !mask)
    }

    /// Highest priority interrupt that is pending, enabled and deliverable in
    /// the current mode.
    pub fn check_pending_interrupt(&self) -> Option<u64> {
        let pending_enabled = self.mip & self.mie;
        if pending_enabled == 0 {
            return None;
        }

        let m_enabled = self.priv_mode < PrivMode::Machine || self.mstatus_bit(mstatus::MIE);
        let s_enabled = self.priv_mode < PrivMode::Supervisor
            || (self.priv_mode == PrivMode::Supervisor && self.mstatus_bit(mstatus::SIE));

        let m_level = pending_enabled & !self.mideleg;
        let s_level = pending_enabled & self.mideleg;

        let candidates = if m_enabled && m_level != 0 {
            m_level
        } else if s_enabled && s_level != 0 {
            s_level
        } else {
            return None;
        };

        // Priority order: MEI, MSI, MTI, SEI, SSI, STI
        [11, 3, 7, 9, 1, 5]
            .into_iter()
            .find(|&cause| (candidates >> cause) & 1 != 0)
    }

    /// Sets or clears an interrupt-pending bit driven by a device.
    pub fn set_pending(&mut self, bit: u64, on: bool) {
        if on {
            self.mip |= bit;
        } else {
            self.mip &= !bit;
        }
    }
}

fn legal_tvec(value: u64) -> u64 {
    // modes >= 2 are reserved, fall back to direct
    if value & 0b11 >= 2 { value & !0b11 } else { value }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_mode_cannot_touch_machine_csrs() {
        let mut csr = CsrFile::new(Xlen::Bit64);
        csr.priv_mode = PrivMode::User;
        assert_eq!(
            csr.read(addr::MSTATUS),
            Err(CsrError::PrivilegeViolation(addr::MSTATUS))
        );
        csr.priv_mode = PrivMode::Supervisor;
        assert!(csr.read(addr::SSTATUS).is_ok());
        assert!(csr.write(addr::MEPC, 4).is_err());
    }

    #[test]
    fn sstatus_is_a_view_of_mstatus() {
        let mut csr = CsrFile::new(Xlen::Bit64);
        csr.write(addr::MSTATUS, mstatus::MIE | mstatus::SIE).unwrap();
        assert_eq!(csr.read(addr::SSTATUS).unwrap() & mstatus::MIE, 0);
        assert_ne!(csr.read(addr::SSTATUS).unwrap() & mstatus::SIE, 0);

        csr.write(addr::SSTATUS, mstatus::SUM).unwrap();
        assert!(csr.mstatus_bit(mstatus::MIE));
        assert!(csr.mstatus_bit(mstatus::SUM));
        assert!(!csr.mstatus_bit(mstatus::SIE));
    }

    #[test]
    fn read_only_csrs_reject_writes() {
        let mut csr = CsrFile::new(Xlen::Bit64);
        assert_eq!(
            csr.write(addr::MHARTID, 1),
            Err(CsrError::ReadOnly(addr::MHARTID))
        );
        assert_eq!(csr.read(addr::MISA).unwrap() >> 62, 2);
    }

    #[test]
    fn satp_ignores_unsupported_modes() {
        let mut csr = CsrFile::new(Xlen::Bit64);
        csr.write(addr::SATP, (8 << 60) | 0x80123).unwrap();
        assert_eq!(csr.addressing_mode(), AddressingMode::Sv39);
        assert_eq!(csr.root_ppn(), 0x80123);

        csr.write(addr::SATP, 10 << 60).unwrap();
        assert_eq!(csr.addressing_mode(), AddressingMode::Sv39);

        let mut csr32 = CsrFile::new(Xlen::Bit32);
        csr32.write(addr::SATP, (1 << 31) | 0x80000).unwrap();
        assert_eq!(csr32.addressing_mode(), AddressingMode::Sv32);
        assert_eq!(csr32.root_ppn(), 0x80000);
    }

    #[test]
    fn machine_interrupts_need_mie_in_machine_mode() {
        let mut csr = CsrFile::new(Xlen::Bit64);
        csr.mie = irq::MTIP;
        csr.set_pending(irq::MTIP, true);
        assert_eq!(csr.check_pending_interrupt(), None);

        csr.set_mstatus_bit(mstatus::MIE, true);
        assert_eq!(csr.check_pending_interrupt(), Some(7));

        // lower modes always take machine interrupts
        csr.set_mstatus_bit(mstatus::MIE, false);
        csr.priv_mode = PrivMode::Supervisor;
        assert_eq!(csr.check_pending_interrupt(), Some(7));
    }

    #[test]
    fn delegated_interrupts_are_masked_in_machine_mode() {
        let mut csr = CsrFile::new(Xlen::Bit64);
        csr.write(addr::MIDELEG, irq::SEIP).unwrap();
        csr.mie = irq::SEIP | irq::MTIP;
        csr.set_mstatus_bit(mstatus::MIE, true);
        csr.set_mstatus_bit(mstatus::SIE, true);
        csr.set_pending(irq::SEIP, true);
        assert_eq!(csr.check_pending_interrupt(), None);

        csr.priv_mode = PrivMode::User;
        assert_eq!(csr.check_pending_interrupt(), Some(9));

        // machine-level interrupt wins over supervisor-level
        csr.set_pending(irq::MTIP, true);
        assert_eq!(csr.check_pending_interrupt(), Some(7));
    }

    #[test]
    fn counters_are_gated_below_machine_mode() {
        let mut csr = CsrFile::new(Xlen::Bit64);
        csr.time = 42;
        csr.priv_mode = PrivMode::Supervisor;
        assert_eq!(
            csr.read(addr::TIME),
            Err(CsrError::CounterDisabled(addr::TIME))
        );
        csr.mcounteren = 0b010;
        assert_eq!(csr.read(addr::TIME), Ok(42));
    }

    #[test]
    fn high_counter_halves_exist_only_on_rv32() {
        let mut csr = CsrFile::new(Xlen::Bit32);
        csr.cycle = 0x1_0000_0002;
        assert_eq!(csr.read(addr::CYCLEH), Ok(1));
        let csr64 = CsrFile::new(Xlen::Bit64);
        assert!(csr64.read(addr::CYCLEH).is_err());
    }
}
