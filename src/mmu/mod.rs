//! Virtual to physical address translation (Sv32, Sv39, Sv48).

pub mod tlb;

use tracing::trace;

use crate::csr::{CsrFile, PrivMode, mstatus};
use crate::device::Bus;
use crate::mem::{AccessKind, MemError, Width};
use tlb::{Tlb, TlbEntry};

pub const PAGE_SHIFT: u64 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Page table entry bits
pub mod pte {
    pub const V: u64 = 1 << 0;
    pub const R: u64 = 1 << 1;
    pub const W: u64 = 1 << 2;
    pub const X: u64 = 1 << 3;
    pub const U: u64 = 1 << 4;
    pub const G: u64 = 1 << 5;
    pub const A: u64 = 1 << 6;
    pub const D: u64 = 1 << 7;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    Bare,
    Sv32,
    Sv39,
    Sv48,
}

impl AddressingMode {
    fn levels(self) -> u32 {
        match self {
            AddressingMode::Bare => 0,
            AddressingMode::Sv32 => 2,
            AddressingMode::Sv39 => 3,
            AddressingMode::Sv48 => 4,
        }
    }

    fn vpn_bits(self) -> u64 {
        match self {
            AddressingMode::Sv32 => 10,
            _ => 9,
        }
    }

    fn pte_width(self) -> Width {
        match self {
            AddressingMode::Sv32 => Width::W,
            _ => Width::D,
        }
    }

    fn ppn(self, pte: u64) -> u64 {
        match self {
            AddressingMode::Sv32 => (pte >> 10) & 0x3f_ffff,
            _ => (pte >> 10) & 0xfff_ffff_ffff,
        }
    }

    /// Upper bits must copy the top VPN bit.
    fn is_canonical(self, vaddr: u64) -> bool {
        let va_bits = match self {
            AddressingMode::Sv39 => 39,
            AddressingMode::Sv48 => 48,
            _ => return true,
        };
        let shifted = ((vaddr << (64 - va_bits)) as i64) >> (64 - va_bits);
        shifted as u64 == vaddr
    }
}

/// Outcome of a successful page table walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Walk {
    pub paddr: u64,
    pub leaf: u64,
    pub pte_addr: u64,
    /// Leaf with A (and D for stores) set, when it differs from `leaf`.
    pub ad_update: Option<u64>,
}

/// Permission check for a leaf PTE against the effective privilege and the
/// current SUM/MXR settings.
fn leaf_permits(leaf: u64, kind: AccessKind, priv_mode: PrivMode, csrs: &CsrFile) -> bool {
    let user_page = leaf & pte::U != 0;
    match priv_mode {
        PrivMode::User if !user_page => return false,
        PrivMode::Supervisor if user_page => {
            if kind == AccessKind::Fetch || !csrs.mstatus_bit(mstatus::SUM) {
                return false;
            }
        }
        _ => {}
    }
    match kind {
        AccessKind::Fetch => leaf & pte::X != 0,
        AccessKind::Load => {
            leaf & pte::R != 0 || (csrs.mstatus_bit(mstatus::MXR) && leaf & pte::X != 0)
        }
        AccessKind::Store => leaf & pte::W != 0,
    }
}

/// Walks the page tables without modifying anything.
pub fn walk(
    bus: &Bus,
    csrs: &CsrFile,
    vaddr: u64,
    kind: AccessKind,
    priv_mode: PrivMode,
) -> Result<Walk, MemError> {
    let mode = csrs.addressing_mode();
    let page_fault = MemError::PageFault { kind, addr: vaddr };
    let access_fault = MemError::AccessFault { kind, addr: vaddr };

    if !mode.is_canonical(vaddr) {
        return Err(page_fault);
    }

    let vpn_bits = mode.vpn_bits();
    let vpn_mask = (1u64 << vpn_bits) - 1;
    let width = mode.pte_width();

    let mut table = csrs.root_ppn() << PAGE_SHIFT;
    for level in (0..mode.levels()).rev() {
        let shift = PAGE_SHIFT + vpn_bits * level as u64;
        let vpn = (vaddr >> shift) & vpn_mask;
        let pte_addr = table + vpn * width.bytes();
        let entry = bus.ram.load(pte_addr, width).map_err(|_| access_fault)?;

        if entry & pte::V == 0 || (entry & pte::R == 0 && entry & pte::W != 0) {
            return Err(page_fault);
        }
        // reserved / Svpbmt / Svnapot bits
        if width == Width::D && entry >> 54 != 0 {
            return Err(page_fault);
        }

        let ppn = mode.ppn(entry);
        if entry & (pte::R | pte::X) == 0 {
            // pointer to the next level
            if level == 0 {
                return Err(page_fault);
            }
            table = ppn << PAGE_SHIFT;
            continue;
        }

        if !leaf_permits(entry, kind, priv_mode, csrs) {
            return Err(page_fault);
        }
        // misaligned superpage
        let low_ppn_bits = vpn_bits * level as u64;
        if ppn & ((1u64 << low_ppn_bits) - 1) != 0 {
            return Err(page_fault);
        }

        let mut updated = entry | pte::A;
        if kind == AccessKind::Store {
            updated |= pte::D;
        }

        let offset_mask = (1u64 << shift) - 1;
        let paddr = ((ppn << PAGE_SHIFT) & !offset_mask) | (vaddr & offset_mask);
        return Ok(Walk {
            paddr,
            leaf: entry,
            pte_addr,
            ad_update: (updated != entry).then_some(updated),
        });
    }
    Err(page_fault)
}

#[derive(Debug, Default)]
pub struct Mmu {
    tlb: Tlb,
    cache_enabled: bool,
}

impl Mmu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled
    }

    pub fn set_cache_enabled(&mut self, enabled: bool) {
        self.cache_enabled = enabled;
        self.tlb.flush();
    }

    /// Called on satp writes and sfence.vma.
    pub fn flush(&mut self) {
        self.tlb.flush();
    }

    pub fn tlb(&self) -> &Tlb {
        &self.tlb
    }

    /// Translates `vaddr` for an access of `kind`, setting A/D bits in the
    /// leaf PTE as hardware would.
    pub fn translate(
        &mut self,
        bus: &mut Bus,
        csrs: &CsrFile,
        vaddr: u64,
        kind: AccessKind,
    ) -> Result<u64, MemError> {
        let vaddr = csrs.xlen().truncate(vaddr);
        let priv_mode = csrs.effective_priv(kind);
        if priv_mode == PrivMode::Machine || csrs.addressing_mode() == AddressingMode::Bare {
            return Ok(vaddr);
        }

        let vpn = vaddr >> PAGE_SHIFT;
        let offset = vaddr & (PAGE_SIZE - 1);
        if self.cache_enabled {
            if let Some(entry) = self.tlb.lookup(vpn, kind, priv_mode) {
                if !leaf_permits(entry.perms as u64, kind, priv_mode, csrs) {
                    return Err(MemError::PageFault { kind, addr: vaddr });
                }
                return Ok((entry.ppn << PAGE_SHIFT) | offset);
            }
        }

        let walk = walk(bus, csrs, vaddr, kind, priv_mode)?;
        if let Some(updated) = walk.ad_update {
            let width = csrs.addressing_mode().pte_width();
            bus.ram
                .store(walk.pte_addr, width, updated)
                .map_err(|_| MemError::AccessFault { kind, addr: vaddr })?;
            trace!(
                pte_addr = format_args!("0x{:x}", walk.pte_addr),
                pte = format_args!("0x{updated:x}"),
                "set A/D"
            );
        }

        if self.cache_enabled {
            let leaf = walk.ad_update.unwrap_or(walk.leaf);
            self.tlb.insert(
                vpn,
                kind,
                priv_mode,
                TlbEntry {
                    ppn: walk.paddr >> PAGE_SHIFT,
                    perms: leaf as u8,
                },
            );
        }
        Ok(walk.paddr)
    }

    /// Side-effect-free translation for debuggers: no A/D writes, no cache
    /// fill.
    pub fn probe(&self, bus: &Bus, csrs: &CsrFile, vaddr: u64, kind: AccessKind) -> Result<u64, MemError> {
        let vaddr = csrs.xlen().truncate(vaddr);
        let priv_mode = csrs.effective_priv(kind);
        if priv_mode == PrivMode::Machine || csrs.addressing_mode() == AddressingMode::Bare {
            return Ok(vaddr);
        }
        walk(bus, csrs, vaddr, kind, priv_mode).map(|w| w.paddr)
    }
}
