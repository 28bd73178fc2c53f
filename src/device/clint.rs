//! Core-local interruptor for a single hart.

use super::{read_field, write_field};
use crate::mem::Width;

const MSIP: u64 = 0x0000;
const MTIMECMP: u64 = 0x4000;
const MTIME: u64 = 0xbff8;

#[derive(Debug)]
pub struct Clint {
    msip: u32,
    mtimecmp: u64,
    mtime: u64,
}

impl Default for Clint {
    fn default() -> Self {
        // no timer interrupt until the guest programs mtimecmp
        Self {
            msip: 0,
            mtimecmp: u64::MAX,
            mtime: 0,
        }
    }
}

impl Clint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&mut self) {
        self.mtime = self.mtime.wrapping_add(1);
    }

    pub fn mtime(&self) -> u64 {
        self.mtime
    }

    pub fn timer_pending(&self) -> bool {
        self.mtime >= self.mtimecmp
    }

    pub fn software_pending(&self) -> bool {
        self.msip & 1 != 0
    }

    pub fn load(&self, offset: u64, width: Width) -> u64 {
        match offset {
            MSIP..=0x3 => read_field(self.msip as u64, offset - MSIP, width),
            MTIMECMP..=0x4007 => read_field(self.mtimecmp, offset - MTIMECMP, width),
            MTIME..=0xbfff => read_field(self.mtime, offset - MTIME, width),
            _ => 0,
        }
    }

    pub fn store(&mut self, offset: u64, width: Width, value: u64) {
        match offset {
            MSIP..=0x3 => {
                self.msip = write_field(self.msip as u64, offset - MSIP, width, value) as u32 & 1;
            }
            MTIMECMP..=0x4007 => {
                self.mtimecmp = write_field(self.mtimecmp, offset - MTIMECMP, width, value);
            }
            MTIME..=0xbfff => {
                self.mtime = write_field(self.mtime, offset - MTIME, width, value);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_fires_when_mtime_reaches_mtimecmp() {
        let mut clint = Clint::new();
        clint.store(MTIMECMP, Width::D, 3);
        assert!(!clint.timer_pending());
        for _ in 0..3 {
            clint.tick();
        }
        assert!(clint.timer_pending());
        assert_eq!(clint.load(MTIME, Width::D), 3);
    }

    #[test]
    fn mtimecmp_halves_are_independent() {
        let mut clint = Clint::new();
        clint.store(MTIMECMP, Width::W, 0x1234);
        clint.store(MTIMECMP + 4, Width::W, 0);
        assert_eq!(clint.load(MTIMECMP, Width::D), 0x1234);
        assert_eq!(clint.load(MTIMECMP + 4, Width::W), 0);
    }

    #[test]
    fn msip_keeps_only_bit_zero() {
        let mut clint = Clint::new();
        clint.store(MSIP, Width::W, 0xff);
        assert!(clint.software_pending());
        assert_eq!(clint.load(MSIP, Width::W), 1);
        clint.store(MSIP, Width::W, 0);
        assert!(!clint.software_pending());
    }
}
