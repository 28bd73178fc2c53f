//! Legacy (version 1) virtio-mmio block device backed by an in-memory disk
//! image.
//!
//! Queue layout starting at `queue_pfn * guest_page_size`:
//!
//! ```text
//! desc[queue_num]     16 bytes each: addr u64, len u32, flags u16, next u16
//! avail               flags u16, idx u16, ring[queue_num] u16
//! (pad to queue_align)
//! used                flags u16, idx u16, ring[queue_num] { id u32, len u32 }
//! ```

use tracing::{debug, warn};

use super::{read_field, write_field};
use crate::mem::{Memory, MemError, Width};

const MAGIC: u32 = 0x7472_6976; // "virt"
const VERSION: u32 = 1;
const DEVICE_ID_BLOCK: u32 = 2;
const VENDOR_ID: u32 = 0x554d_4551; // "QEMU"

const QUEUE_NUM_MAX: u32 = 0x2000;
pub const SECTOR_SIZE: u64 = 512;

// Notify-to-completion latency in device clocks.
const ACCESS_DELAY: u64 = 500;

const VIRTQ_DESC_F_NEXT: u16 = 1;
const VIRTQ_DESC_F_WRITE: u16 = 2;

const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;

const VIRTIO_BLK_S_OK: u8 = 0;
const VIRTIO_BLK_S_IOERR: u8 = 1;
const VIRTIO_BLK_S_UNSUPP: u8 = 2;

mod reg {
    pub const MAGIC: u64 = 0x000;
    pub const VERSION: u64 = 0x004;
    pub const DEVICE_ID: u64 = 0x008;
    pub const VENDOR_ID: u64 = 0x00c;
    pub const DEVICE_FEATURES: u64 = 0x010;
    pub const DEVICE_FEATURES_SEL: u64 = 0x014;
    pub const DRIVER_FEATURES: u64 = 0x020;
    pub const DRIVER_FEATURES_SEL: u64 = 0x024;
    pub const GUEST_PAGE_SIZE: u64 = 0x028;
    pub const QUEUE_SEL: u64 = 0x030;
    pub const QUEUE_NUM_MAX: u64 = 0x034;
    pub const QUEUE_NUM: u64 = 0x038;
    pub const QUEUE_ALIGN: u64 = 0x03c;
    pub const QUEUE_PFN: u64 = 0x040;
    pub const QUEUE_NOTIFY: u64 = 0x050;
    pub const INTERRUPT_STATUS: u64 = 0x060;
    pub const INTERRUPT_ACK: u64 = 0x064;
    pub const STATUS: u64 = 0x070;
    pub const CONFIG: u64 = 0x100;
}

#[derive(Debug, Clone, Copy)]
struct Descriptor {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

#[derive(Debug)]
pub struct VirtioBlock {
    disk: Vec<u8>,
    clock: u64,
    device_features_sel: u32,
    driver_features: u32,
    driver_features_sel: u32,
    guest_page_size: u32,
    queue_sel: u32,
    queue_num: u32,
    queue_align: u32,
    queue_pfn: u32,
    interrupt_status: u32,
    status: u32,
    last_avail: u16,
    used_idx: u16,
    // clocks at which the driver notified
    notifications: Vec<u64>,
}

impl Default for VirtioBlock {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl VirtioBlock {
    pub fn new(disk: Vec<u8>) -> Self {
        Self {
            disk,
            clock: 0,
            device_features_sel: 0,
            driver_features: 0,
            driver_features_sel: 0,
            guest_page_size: 0,
            queue_sel: 0,
            queue_num: 0,
            // xv6 relies on this default
            queue_align: 0x1000,
            queue_pfn: 0,
            interrupt_status: 0,
            status: 0,
            last_avail: 0,
            used_idx: 0,
            notifications: Vec::new(),
        }
    }

    pub fn attach(&mut self, disk: Vec<u8>) {
        debug!(bytes = disk.len(), "virtio block image attached");
        self.disk = disk;
    }

    pub fn disk(&self) -> &[u8] {
        &self.disk
    }

    fn capacity_sectors(&self) -> u64 {
        self.disk.len() as u64 / SECTOR_SIZE
    }

    pub fn interrupting(&self) -> bool {
        self.interrupt_status & 1 != 0
    }

    fn reset(&mut self) {
        let disk = std::mem::take(&mut self.disk);
        let clock = self.clock;
        *self = Self::new(disk);
        self.clock = clock;
    }

    pub fn tick(&mut self, ram: &mut Memory) {
        self.clock = self.clock.wrapping_add(1);
        let due = self
            .notifications
            .first()
            .is_some_and(|&at| self.clock.wrapping_sub(at) >= ACCESS_DELAY);
        if due {
            self.notifications.remove(0);
            self.process_queue(ram);
        }
    }

    pub fn load(&self, offset: u64, width: Width) -> u64 {
        let aligned = offset & !0x3;
        let value: u64 = match aligned {
            reg::MAGIC => MAGIC as u64,
            reg::VERSION => VERSION as u64,
            reg::DEVICE_ID => DEVICE_ID_BLOCK as u64,
            reg::VENDOR_ID => VENDOR_ID as u64,
            // no optional features offered
            reg::DEVICE_FEATURES => 0,
            reg::QUEUE_NUM_MAX => QUEUE_NUM_MAX as u64,
            reg::QUEUE_PFN => self.queue_pfn as u64,
            reg::INTERRUPT_STATUS => self.interrupt_status as u64,
            reg::STATUS => self.status as u64,
            // capacity, in sectors
            reg::CONFIG => self.capacity_sectors() & 0xffff_ffff,
            0x104 => self.capacity_sectors() >> 32,
            _ => 0,
        };
        read_field(value, offset & 0x3, width)
    }

    pub fn store(&mut self, offset: u64, width: Width, value: u64) {
        let aligned = offset & !0x3;
        let merge = |old: u32| write_field(old as u64, offset & 0x3, width, value) as u32;
        match aligned {
            reg::DEVICE_FEATURES_SEL => self.device_features_sel = merge(self.device_features_sel),
            reg::DRIVER_FEATURES => self.driver_features = merge(self.driver_features),
            reg::DRIVER_FEATURES_SEL => self.driver_features_sel = merge(self.driver_features_sel),
            reg::GUEST_PAGE_SIZE => self.guest_page_size = merge(self.guest_page_size),
            reg::QUEUE_SEL => {
                self.queue_sel = merge(self.queue_sel);
                if self.queue_sel != 0 {
                    warn!(queue = self.queue_sel, "virtio: only queue 0 exists");
                }
            }
            reg::QUEUE_NUM => self.queue_num = merge(self.queue_num).min(QUEUE_NUM_MAX),
            reg::QUEUE_ALIGN => self.queue_align = merge(self.queue_align),
            reg::QUEUE_PFN => {
                self.queue_pfn = merge(self.queue_pfn);
                debug!(
                    pfn = self.queue_pfn,
                    page_size = self.guest_page_size,
                    num = self.queue_num,
                    "virtio queue configured"
                );
            }
            reg::QUEUE_NOTIFY => {
                if self.queue_sel == 0 {
                    self.notifications.push(self.clock);
                }
            }
            reg::INTERRUPT_ACK => self.interrupt_status &= !(value as u32),
            reg::STATUS => {
                self.status = merge(self.status);
                if self.status == 0 {
                    self.reset();
                }
            }
            _ => {}
        }
    }

    fn queue_base(&self) -> u64 {
        self.queue_pfn as u64 * self.guest_page_size as u64
    }

    fn avail_base(&self) -> u64 {
        self.queue_base() + self.queue_num as u64 * 16
    }

    fn used_base(&self) -> u64 {
        let align = (self.queue_align as u64).max(1);
        let avail_end = self.avail_base() + 4 + self.queue_num as u64 * 2;
        avail_end.div_ceil(align) * align
    }

    fn read_descriptor(&self, ram: &Memory, index: u16) -> Result<Descriptor, MemError> {
        let at = self.queue_base() + 16 * index as u64;
        Ok(Descriptor {
            addr: ram.read_u64(at)?,
            len: ram.read_u32(at + 8)?,
            flags: ram.read_u16(at + 12)?,
            next: ram.read_u16(at + 14)?,
        })
    }

    /// Service every chain the driver has made available since the last call.
    fn process_queue(&mut self, ram: &mut Memory) {
        if self.queue_num == 0 || self.guest_page_size == 0 {
            warn!("virtio: notify before the queue was configured");
            return;
        }
        let avail_idx = match ram.read_u16(self.avail_base() + 2) {
            Ok(idx) => idx,
            Err(err) => {
                warn!(%err, "virtio: avail ring unreadable");
                return;
            }
        };

        let num = self.queue_num as u16;
        while self.last_avail != avail_idx {
            let slot = self.avail_base() + 4 + 2 * (self.last_avail % num) as u64;
            let result = ram
                .read_u16(slot)
                .and_then(|head| self.process_chain(ram, head % num).map(|len| (head, len)));
            match result {
                Ok((head, len)) => {
                    if let Err(err) = self.push_used(ram, head, len) {
                        warn!(%err, "virtio: used ring unwritable");
                        return;
                    }
                }
                Err(err) => warn!(%err, "virtio: dropping malformed request"),
            }
            self.last_avail = self.last_avail.wrapping_add(1);
        }
        self.interrupt_status |= 1;
    }

    fn push_used(&mut self, ram: &mut Memory, head: u16, len: u32) -> Result<(), MemError> {
        let used = self.used_base();
        let slot = used + 4 + 8 * (self.used_idx % self.queue_num as u16) as u64;
        ram.write_u32(slot, head as u32)?;
        ram.write_u32(slot + 4, len)?;
        self.used_idx = self.used_idx.wrapping_add(1);
        ram.write_u16(used + 2, self.used_idx)
    }

    /// Returns the number of bytes written into guest buffers.
    fn process_chain(&mut self, ram: &mut Memory, head: u16) -> Result<u32, MemError> {
        let mut chain = Vec::new();
        let mut index = head;
        loop {
            let desc = self.read_descriptor(ram, index)?;
            chain.push(desc);
            if desc.flags & VIRTQ_DESC_F_NEXT == 0 || chain.len() >= self.queue_num as usize {
                break;
            }
            index = desc.next % self.queue_num as u16;
        }

        let (Some(header), Some(status)) = (chain.first().copied(), chain.last().copied()) else {
            return Ok(0);
        };
        if chain.len() < 2 {
            warn!(len = chain.len(), "virtio: request chain too short");
            return Ok(0);
        }

        let kind = ram.read_u32(header.addr)?;
        let sector = ram.read_u64(header.addr + 8)?;
        let data = &chain[1..chain.len() - 1];

        let mut written = 0u32;
        let mut offset = sector.saturating_mul(SECTOR_SIZE);
        let mut outcome = VIRTIO_BLK_S_OK;
        for desc in data {
            let len = desc.len as u64;
            let range = offset
                .checked_add(len)
                .filter(|&end| end <= self.disk.len() as u64)
                .map(|end| offset as usize..end as usize);
            let Some(range) = range else {
                warn!(sector, len, "virtio: request past end of disk");
                outcome = VIRTIO_BLK_S_IOERR;
                break;
            };
            match kind {
                VIRTIO_BLK_T_IN if desc.flags & VIRTQ_DESC_F_WRITE != 0 => {
                    ram.write_bytes(desc.addr, &self.disk[range])?;
                    written = written.saturating_add(desc.len);
                }
                VIRTIO_BLK_T_OUT if desc.flags & VIRTQ_DESC_F_WRITE == 0 => {
                    let bytes = ram.read_bytes(desc.addr, desc.len as usize)?;
                    self.disk[range].copy_from_slice(bytes);
                }
                _ => {
                    warn!(kind, flags = desc.flags, "virtio: unsupported request");
                    outcome = VIRTIO_BLK_S_UNSUPP;
                    break;
                }
            }
            offset += len;
        }

        if status.flags & VIRTQ_DESC_F_WRITE == 0 {
            warn!("virtio: status descriptor is not device-writable");
        }
        ram.write_u8(status.addr, outcome)?;
        Ok(written.saturating_add(1))
    }
}
