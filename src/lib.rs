pub mod config;
pub mod cpu;
pub mod csr;
pub mod debug;
pub mod device;
pub mod elf;
pub mod emulator;
pub mod mem;
pub mod mmu;

pub use config::Config;
pub use cpu::{HaltReason, Machine, MachineError, StepOutcome, Xlen};
pub use emulator::{Emulator, EmulatorError};
