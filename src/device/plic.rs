//! Platform-level interrupt controller with two hart contexts:
//! context 0 is machine mode, context 1 supervisor mode.
//!
//! Register layout follows the SiFive/QEMU `virt` PLIC.

use super::{read_field, write_field};
use crate::mem::Width;

pub const UART_IRQ: u32 = 10;
pub const VIRTIO_IRQ: u32 = 1;

const NUM_SOURCES: usize = 32;
const NUM_CONTEXTS: usize = 2;

const PRIORITY_BASE: u64 = 0x0;
const PENDING_BASE: u64 = 0x1000;
const ENABLE_BASE: u64 = 0x2000;
const ENABLE_STRIDE: u64 = 0x80;
const CONTEXT_BASE: u64 = 0x20_0000;
const CONTEXT_STRIDE: u64 = 0x1000;

#[derive(Debug, Default)]
pub struct Plic {
    priority: [u32; NUM_SOURCES],
    pending: u32,
    // claimed but not completed
    in_service: u32,
    enable: [u32; NUM_CONTEXTS],
    threshold: [u32; NUM_CONTEXTS],
}

impl Plic {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch level-triggered source lines into the pending bits.
    pub fn update(&mut self, lines: u32) {
        self.pending |= lines & !self.in_service & !1;
    }

    /// Highest priority source deliverable to `context`, if any.
    fn best(&self, context: usize) -> Option<u32> {
        let candidates = self.pending & self.enable[context];
        let mut best: Option<(u32, u32)> = None;
        for source in 1..NUM_SOURCES as u32 {
            if (candidates >> source) & 1 == 0 {
                continue;
            }
            let prio = self.priority[source as usize];
            if prio <= self.threshold[context] {
                continue;
            }
            // ties go to the lowest source id
            if best.is_none_or(|(_, p)| prio > p) {
                best = Some((source, prio));
            }
        }
        best.map(|(source, _)| source)
    }

    /// Whether `context` has an interrupt to deliver (drives MEIP / SEIP).
    pub fn context_pending(&self, context: usize) -> bool {
        self.best(context).is_some()
    }

    fn claim(&mut self, context: usize) -> u32 {
        match self.best(context) {
            Some(source) => {
                self.pending &= !(1 << source);
                self.in_service |= 1 << source;
                source
            }
            None => 0,
        }
    }

    fn complete(&mut self, source: u32) {
        if (source as usize) < NUM_SOURCES {
            self.in_service &= !(1 << source);
        }
    }

    fn context_of(offset: u64, base: u64, stride: u64) -> Option<(usize, u64)> {
        let rel = offset.checked_sub(base)?;
        let context = (rel / stride) as usize;
        (context < NUM_CONTEXTS).then_some((context, rel % stride))
    }

    pub fn load(&mut self, offset: u64, width: Width) -> u64 {
        if let Some((context, 4..=7)) = Self::context_of(offset, CONTEXT_BASE, CONTEXT_STRIDE) {
            return self.claim(context) as u64;
        }
        self.peek(offset, width)
    }

    /// Register read without claiming.
    pub fn peek(&self, offset: u64, width: Width) -> u64 {
        match offset {
            PRIORITY_BASE..0x80 => {
                let source = (offset / 4) as usize;
                read_field(self.priority[source] as u64, offset % 4, width)
            }
            PENDING_BASE..0x1004 => read_field(self.pending as u64, offset % 4, width),
            _ => {
                if let Some((context, 0..=3)) = Self::context_of(offset, ENABLE_BASE, ENABLE_STRIDE) {
                    return read_field(self.enable[context] as u64, offset % 4, width);
                }
                match Self::context_of(offset, CONTEXT_BASE, CONTEXT_STRIDE) {
                    Some((context, reg @ 0..=3)) => {
                        read_field(self.threshold[context] as u64, reg, width)
                    }
                    Some((context, 4..=7)) => self.best(context).unwrap_or(0) as u64,
                    _ => 0,
                }
            }
        }
    }

    pub fn store(&mut self, offset: u64, width: Width, value: u64) {
        match offset {
            PRIORITY_BASE..0x80 => {
                let source = (offset / 4) as usize;
                let old = self.priority[source] as u64;
                // 3 priority bits, as on the SiFive PLIC
                self.priority[source] = write_field(old, offset % 4, width, value) as u32 & 0x7;
            }
            _ => {
                if let Some((context, 0..=3)) = Self::context_of(offset, ENABLE_BASE, ENABLE_STRIDE) {
                    let old = self.enable[context] as u64;
                    self.enable[context] = write_field(old, offset % 4, width, value) as u32 & !1;
                    return;
                }
                match Self::context_of(offset, CONTEXT_BASE, CONTEXT_STRIDE) {
                    Some((context, reg @ 0..=3)) => {
                        let old = self.threshold[context] as u64;
                        self.threshold[context] = write_field(old, reg, width, value) as u32 & 0x7;
                    }
                    Some((_, 4..=7)) => self.complete(value as u32),
                    _ => {}
                }
            }
        }
    }
}
