//! Physical address space: RAM plus a fixed set of memory-mapped devices.

pub mod clint;
pub mod fdt;
pub mod plic;
pub mod uart;
pub mod virtio;

use tracing::debug;

use crate::csr::{CsrFile, irq};
use crate::mem::{MemError, Memory, Width};
use clint::Clint;
use plic::{Plic, UART_IRQ, VIRTIO_IRQ};
use uart::Uart;
use virtio::VirtioBlock;

pub const DTB_BASE: u64 = 0x0000_1020;
pub const DTB_SIZE: u64 = 0xfe0;
pub const CLINT_BASE: u64 = 0x0200_0000;
pub const CLINT_SIZE: u64 = 0x1_0000;
pub const PLIC_BASE: u64 = 0x0c00_0000;
pub const PLIC_SIZE: u64 = 0x400_0000;
pub const UART_BASE: u64 = 0x1000_0000;
pub const UART_SIZE: u64 = 0x100;
pub const VIRTIO_BASE: u64 = 0x1000_1000;
pub const VIRTIO_SIZE: u64 = 0x1000;

/// PLIC context wired to MEIP / SEIP.
const PLIC_CONTEXT_M: usize = 0;
const PLIC_CONTEXT_S: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Dtb,
    Clint,
    Plic,
    Uart,
    Virtio,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 5] = [
        DeviceKind::Dtb,
        DeviceKind::Clint,
        DeviceKind::Plic,
        DeviceKind::Uart,
        DeviceKind::Virtio,
    ];

    /// `(base, size)` of the device's physical window.
    pub const fn window(self) -> (u64, u64) {
        match self {
            DeviceKind::Dtb => (DTB_BASE, DTB_SIZE),
            DeviceKind::Clint => (CLINT_BASE, CLINT_SIZE),
            DeviceKind::Plic => (PLIC_BASE, PLIC_SIZE),
            DeviceKind::Uart => (UART_BASE, UART_SIZE),
            DeviceKind::Virtio => (VIRTIO_BASE, VIRTIO_SIZE),
        }
    }

    /// Device whose window contains `addr`, with the offset into it.
    pub fn find(addr: u64) -> Option<(DeviceKind, u64)> {
        Self::ALL.into_iter().find_map(|kind| {
            let (base, size) = kind.window();
            let offset = addr.checked_sub(base)?;
            (offset < size).then_some((kind, offset))
        })
    }
}

fn width_mask(width: Width) -> u64 {
    match width {
        Width::D => u64::MAX,
        w => (1u64 << (w.bytes() * 8)) - 1,
    }
}

/// Extracts `width` bytes at byte `offset` of a little-endian register.
pub(crate) fn read_field(reg: u64, offset: u64, width: Width) -> u64 {
    if offset >= 8 {
        return 0;
    }
    (reg >> (offset * 8)) & width_mask(width)
}

/// Replaces `width` bytes at byte `offset` of a little-endian register.
pub(crate) fn write_field(reg: u64, offset: u64, width: Width, value: u64) -> u64 {
    if offset >= 8 {
        return reg;
    }
    let shift = offset * 8;
    let mask = width_mask(width) << shift;
    (reg & !mask) | ((value << shift) & mask)
}

/// RAM and devices as seen from physical addresses. Every failure is reported
/// as [`MemError::Oob`]; callers turn it into an access fault of the right
/// kind.
pub struct Bus {
    pub ram: Memory,
    dtb: Vec<u8>,
    pub clint: Clint,
    pub plic: Plic,
    pub uart: Uart,
    pub virtio: VirtioBlock,
}

impl Bus {
    pub fn new(ram_bytes: usize) -> Self {
        Self {
            ram: Memory::new(ram_bytes),
            dtb: Vec::new(),
            clint: Clint::new(),
            plic: Plic::new(),
            uart: Uart::new(),
            virtio: VirtioBlock::default(),
        }
    }

    /// Installs the hardware description blob. Callers check it fits.
    pub fn set_dtb(&mut self, blob: Vec<u8>) {
        debug!(bytes = blob.len(), "dtb installed");
        self.dtb = blob;
    }

    pub fn dtb(&self) -> &[u8] {
        &self.dtb
    }

    /// Resolves `[addr, addr + width)` to a single device window.
    fn device(addr: u64, width: Width) -> Result<(DeviceKind, u64), MemError> {
        let (kind, offset) = DeviceKind::find(addr).ok_or(MemError::Oob(addr))?;
        let (_, size) = kind.window();
        if offset + width.bytes() > size {
            return Err(MemError::Oob(addr));
        }
        Ok((kind, offset))
    }

    fn dtb_read(&self, offset: u64, width: Width) -> u64 {
        (0..width.bytes()).rev().fold(0, |acc, i| {
            let byte = self.dtb.get((offset + i) as usize).copied().unwrap_or(0);
            (acc << 8) | byte as u64
        })
    }

    pub fn load(&mut self, addr: u64, width: Width) -> Result<u64, MemError> {
        if self.ram.contains(addr, width.bytes()) {
            return self.ram.load(addr, width);
        }
        let (kind, offset) = Self::device(addr, width)?;
        Ok(match kind {
            DeviceKind::Dtb => self.dtb_read(offset, width),
            DeviceKind::Clint => self.clint.load(offset, width),
            DeviceKind::Plic => self.plic.load(offset, width),
            DeviceKind::Uart => self.uart.load(offset) as u64,
            DeviceKind::Virtio => self.virtio.load(offset, width),
        })
    }

    /// Like [`Bus::load`] but never changes device state (no UART dequeue, no
    /// PLIC claim).
    pub fn peek(&self, addr: u64, width: Width) -> Result<u64, MemError> {
        if self.ram.contains(addr, width.bytes()) {
            return self.ram.load(addr, width);
        }
        let (kind, offset) = Self::device(addr, width)?;
        Ok(match kind {
            DeviceKind::Dtb => self.dtb_read(offset, width),
            DeviceKind::Clint => self.clint.load(offset, width),
            DeviceKind::Plic => self.plic.peek(offset, width),
            DeviceKind::Uart => self.uart.peek(offset) as u64,
            DeviceKind::Virtio => self.virtio.load(offset, width),
        })
    }

    /// True when a store of `width` bytes at `addr` would land somewhere.
    pub fn accepts_store(&self, addr: u64, width: Width) -> bool {
        if self.ram.contains(addr, width.bytes()) {
            return true;
        }
        matches!(Self::device(addr, width), Ok((kind, _)) if kind != DeviceKind::Dtb)
    }

    pub fn store(&mut self, addr: u64, width: Width, value: u64) -> Result<(), MemError> {
        if self.ram.contains(addr, width.bytes()) {
            return self.ram.store(addr, width, value);
        }
        let (kind, offset) = Self::device(addr, width)?;
        match kind {
            DeviceKind::Dtb => return Err(MemError::Oob(addr)),
            DeviceKind::Clint => self.clint.store(offset, width, value),
            DeviceKind::Plic => self.plic.store(offset, width, value),
            DeviceKind::Uart => self.uart.store(offset, value as u8),
            DeviceKind::Virtio => self.virtio.store(offset, width, value),
        }
        Ok(())
    }

    /// Advances device time by one step and mirrors interrupt lines into `mip`.
    pub fn tick(&mut self, csrs: &mut CsrFile) {
        self.clint.tick();
        csrs.time = self.clint.mtime();
        csrs.set_pending(irq::MTIP, self.clint.timer_pending());
        csrs.set_pending(irq::MSIP, self.clint.software_pending());

        self.virtio.tick(&mut self.ram);

        let mut lines = 0;
        if self.uart.interrupting() {
            lines |= 1 << UART_IRQ;
        }
        if self.virtio.interrupting() {
            lines |= 1 << VIRTIO_IRQ;
        }
        self.plic.update(lines);
        csrs.set_pending(irq::MEIP, self.plic.context_pending(PLIC_CONTEXT_M));
        csrs.set_pending(irq::SEIP, self.plic.context_pending(PLIC_CONTEXT_S));
    }

    pub fn put_input(&mut self, byte: u8) {
        self.uart.push_input(byte);
    }

    pub fn get_output(&mut self) -> u8 {
        self.uart.take_output()
    }
}
