//! 16550-compatible UART, reduced to what a console driver needs.
//!
//! Transmitted bytes land in an output queue the host drains with
//! [`Uart::take_output`]; the host pushes keystrokes with
//! [`Uart::push_input`]. The transmitter is always empty, so `LSR.THRE` and
//! `LSR.TEMT` stay set.

use std::collections::VecDeque;

const RBR_THR: u64 = 0;
const IER: u64 = 1;
const IIR_FCR: u64 = 2;
const LCR: u64 = 3;
const MCR: u64 = 4;
const LSR: u64 = 5;
const MSR: u64 = 6;
const SCR: u64 = 7;

const IER_RX_AVAILABLE: u8 = 0x01;
const IER_THR_EMPTY: u8 = 0x02;

const IIR_NO_INTERRUPT: u8 = 0x01;
const IIR_THR_EMPTY: u8 = 0x02;
const IIR_RX_AVAILABLE: u8 = 0x04;
const IIR_FIFO_ENABLED: u8 = 0xc0;

const LSR_DATA_READY: u8 = 0x01;
const LSR_THR_EMPTY: u8 = 0x20;
const LSR_TX_EMPTY: u8 = 0x40;

const LCR_DLAB: u8 = 0x80;

#[derive(Debug, Default)]
pub struct Uart {
    input: VecDeque<u8>,
    output: VecDeque<u8>,
    ier: u8,
    lcr: u8,
    mcr: u8,
    scr: u8,
    fcr: u8,
    divisor: u16,
    // THRE interrupt is edge-like: raised on THR write or IER enable,
    // cleared when IIR reports it.
    thre_pending: bool,
}

impl Uart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_input(&mut self, byte: u8) {
        self.input.push_back(byte);
    }

    /// Next transmitted byte, 0 when nothing is queued.
    pub fn take_output(&mut self) -> u8 {
        self.output.pop_front().unwrap_or(0)
    }

    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    fn dlab(&self) -> bool {
        self.lcr & LCR_DLAB != 0
    }

    fn lsr(&self) -> u8 {
        let mut lsr = LSR_THR_EMPTY | LSR_TX_EMPTY;
        if !self.input.is_empty() {
            lsr |= LSR_DATA_READY;
        }
        lsr
    }

    fn iir(&self) -> u8 {
        let fifo = if self.fcr & 1 != 0 { IIR_FIFO_ENABLED } else { 0 };
        let id = if self.ier & IER_RX_AVAILABLE != 0 && !self.input.is_empty() {
            IIR_RX_AVAILABLE
        } else if self.ier & IER_THR_EMPTY != 0 && self.thre_pending {
            IIR_THR_EMPTY
        } else {
            IIR_NO_INTERRUPT
        };
        fifo | id
    }

    /// Level of the interrupt line towards the PLIC.
    pub fn interrupting(&self) -> bool {
        self.iir() & IIR_NO_INTERRUPT == 0
    }

    pub fn load(&mut self, offset: u64) -> u8 {
        match offset {
            RBR_THR if !self.dlab() => self.input.pop_front().unwrap_or(0),
            IIR_FCR => {
                let iir = self.iir();
                if iir & 0x0f == IIR_THR_EMPTY {
                    self.thre_pending = false;
                }
                iir
            }
            _ => self.peek(offset),
        }
    }

    /// Register read without the side effects of [`Uart::load`].
    pub fn peek(&self, offset: u64) -> u8 {
        match offset {
            RBR_THR if self.dlab() => self.divisor as u8,
            RBR_THR => self.input.front().copied().unwrap_or(0),
            IER if self.dlab() => (self.divisor >> 8) as u8,
            IER => self.ier,
            IIR_FCR => self.iir(),
            LCR => self.lcr,
            MCR => self.mcr,
            LSR => self.lsr(),
            // CTS, DSR, DCD asserted
            MSR => 0xb0,
            SCR => self.scr,
            _ => 0,
        }
    }

    pub fn store(&mut self, offset: u64, value: u8) {
        match offset {
            RBR_THR if self.dlab() => self.divisor = (self.divisor & 0xff00) | value as u16,
            RBR_THR => {
                self.output.push_back(value);
                self.thre_pending = true;
            }
            IER if self.dlab() => {
                self.divisor = (self.divisor & 0x00ff) | ((value as u16) << 8);
            }
            IER => {
                if value & IER_THR_EMPTY != 0 && self.ier & IER_THR_EMPTY == 0 {
                    self.thre_pending = true;
                }
                self.ier = value & 0x0f;
            }
            IIR_FCR => {
                self.fcr = value;
                // receiver FIFO reset
                if value & 0x02 != 0 {
                    self.input.clear();
                }
            }
            LCR => self.lcr = value,
            MCR => self.mcr = value,
            SCR => self.scr = value,
            _ => {}
        }
    }
}
