//! Host-facing wrapper: image loading, bounded runs, console I/O and
//! introspection over a single [`Machine`].

use thiserror::Error;
use tracing::info;

use crate::config::Config;
use crate::cpu::{HaltReason, Machine, MachineError, StepOutcome, Xlen};
use crate::debug::{self, DebugError, ProbeError, RunUntil};
use crate::device::{DTB_BASE, DTB_SIZE, fdt};
use crate::elf::{self, LoadError, Symbols};

#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Machine(#[from] MachineError),

    #[error("breakpoint 0x{0:x} does not fit in a 32-bit address")]
    InvalidBreakpoint(u64),
}

pub struct Emulator {
    machine: Machine,
    symbols: Symbols,
}

impl Emulator {
    /// Builds a machine from `image`, either an ELF file or a flat binary
    /// that is placed at the start of RAM.
    pub fn new(config: &Config, image: &[u8]) -> Result<Self, EmulatorError> {
        let is_elf = elf::is_elf(image);
        let xlen = match config.xlen {
            Some(xlen) => xlen,
            None if is_elf => elf::elf_xlen(image)?,
            None => Xlen::default(),
        };

        let mut machine = Machine::new(config.ram_bytes, xlen);
        let (entry, symbols, tohost) = if is_elf {
            let loaded = elf::load_elf(image, &mut machine.bus.ram)?;
            (loaded.entry, loaded.symbols, loaded.tohost)
        } else {
            let entry = elf::load_raw(image, &mut machine.bus.ram)?;
            (entry, Symbols::default(), None)
        };

        machine.cpu.pc = xlen.truncate(entry);
        // boot protocol: a0 = hart id, a1 = device tree
        machine.cpu.write_reg(10, 0);
        machine.cpu.write_reg(11, DTB_BASE);
        let dtb = fdt::build(&fdt::FdtParams {
            ram_size: config.ram_bytes as u64,
            xlen,
            bootargs: &config.bootargs,
        });
        check_dtb_size(&dtb)?;
        machine.bus.set_dtb(dtb);
        machine.mmu.set_cache_enabled(config.page_cache);
        machine.set_tohost(tohost);

        info!(
            entry = format_args!("0x{entry:x}"),
            xlen = xlen.bits(),
            ram = config.ram_bytes,
            symbols = symbols.len(),
            "image loaded"
        );
        if let Some(addr) = tohost {
            info!(tohost = format_args!("0x{addr:x}"), "test mode");
        }

        Ok(Self { machine, symbols })
    }

    /// Installs a disk image behind the virtio block device.
    pub fn attach_filesystem(&mut self, bytes: Vec<u8>) {
        self.machine.bus.virtio.attach(bytes);
    }

    /// Replaces the generated device tree.
    pub fn attach_dtb(&mut self, bytes: Vec<u8>) -> Result<(), EmulatorError> {
        check_dtb_size(&bytes)?;
        self.machine.bus.set_dtb(bytes);
        Ok(())
    }

    /// Runs until the guest halts. Never returns for guests that don't.
    pub fn run(&mut self) -> Result<HaltReason, EmulatorError> {
        loop {
            if let StepOutcome::Halted(reason) = self.machine.step()? {
                return Ok(reason);
            }
        }
    }

    /// Runs `n` steps, trapping steps included. Stops early on halt.
    pub fn run_cycles(&mut self, n: u64) -> Result<Option<HaltReason>, EmulatorError> {
        Ok(debug::step_n(&mut self.machine, n)?)
    }

    pub fn run_until_breakpoints(
        &mut self,
        addresses: &[u64],
        max_cycles: u64,
    ) -> Result<RunUntil, EmulatorError> {
        if self.machine.xlen() == Xlen::Bit32 {
            if let Some(&addr) = addresses.iter().find(|&&addr| addr > u32::MAX as u64) {
                return Err(EmulatorError::InvalidBreakpoint(addr));
            }
        }
        Ok(debug::run_until(&mut self.machine, addresses, max_cycles)?)
    }

    pub fn read_register(&self, index: usize) -> Result<u64, DebugError> {
        debug::read_register(&self.machine, index)
    }

    pub fn read_pc(&self) -> u64 {
        debug::read_pc(&self.machine)
    }

    /// Eight bytes at a virtual address, read without side effects.
    pub fn load_doubleword(&self, addr: u64) -> Result<u64, ProbeError> {
        debug::read_memory(&self.machine, addr)
    }

    pub fn resolve_symbol(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    pub fn disassemble_next_instruction(&self) -> String {
        debug::disassemble_at(&self.machine, self.machine.cpu.pc)
    }

    pub fn put_input(&mut self, byte: u8) {
        self.machine.bus.put_input(byte);
    }

    /// Next console byte, or 0 when nothing is pending. A 0x00 written by the
    /// guest is indistinguishable from an empty queue.
    pub fn get_output(&mut self) -> u8 {
        self.machine.bus.get_output()
    }

    pub fn enable_page_cache(&mut self, enabled: bool) {
        self.machine.mmu.set_cache_enabled(enabled);
    }

    pub fn halt_reason(&self) -> Option<HaltReason> {
        self.machine.halt_reason()
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }
}

fn check_dtb_size(blob: &[u8]) -> Result<(), LoadError> {
    if blob.len() as u64 > DTB_SIZE {
        return Err(LoadError::DtbTooLarge {
            size: blob.len() as u64,
            max: DTB_SIZE,
        });
    }
    Ok(())
}
