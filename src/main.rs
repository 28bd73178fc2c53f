use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use crossbeam_channel as cbc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use riscv_emu::{Config, Emulator, Xlen};

/// Instructions per burst between console polls.
const QUANTUM: u64 = 10_000;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum XlenArg {
    #[value(name = "32")]
    Rv32,
    #[value(name = "64")]
    Rv64,
}

impl From<XlenArg> for Xlen {
    fn from(arg: XlenArg) -> Self {
        match arg {
            XlenArg::Rv32 => Xlen::Bit32,
            XlenArg::Rv64 => Xlen::Bit64,
        }
    }
}

#[derive(Parser, Debug)]
#[command(version, about = "RISC-V RV32/RV64 IMAC system emulator")]
struct Args {
    /// Path to a RISC-V ELF or raw binary to load
    #[arg(long, value_name = "PATH")]
    elf: Option<PathBuf>,

    /// Same as --elf
    #[arg(value_name = "IMAGE", conflicts_with = "elf")]
    image: Option<PathBuf>,

    /// Disk image for the virtio block device
    #[arg(long, value_name = "PATH")]
    fs: Option<PathBuf>,

    /// Device tree blob to use instead of the generated one
    #[arg(long, value_name = "PATH")]
    dtb: Option<PathBuf>,

    /// Register width (default: from the ELF class, 64 for raw images)
    #[arg(long, value_enum)]
    xlen: Option<XlenArg>,

    /// RAM size in MiB
    #[arg(long, default_value_t = 128)]
    ram_mib: usize,

    /// Stop after N instructions (0 = run forever)
    #[arg(long, default_value_t = 0)]
    max_insns: u64,

    /// Translation cache on or off
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    page_cache: bool,

    /// Kernel command line placed in the generated device tree
    #[arg(long)]
    bootargs: Option<String>,

    /// Enable instruction trace
    #[arg(long, default_value_t = false)]
    trace: bool,
}

impl Args {
    fn config(&self) -> Config {
        let mut config = Config::default().with_ram_mib(self.ram_mib);
        config.xlen = self.xlen.map(Xlen::from);
        config.page_cache = self.page_cache;
        if let Some(bootargs) = &self.bootargs {
            config.bootargs = bootargs.clone();
        }
        config
    }
}

/// Forwards stdin to the run loop one byte at a time. Exits when the
/// receiver goes away or stdin closes.
fn spawn_stdin_reader() -> cbc::Receiver<u8> {
    let (tx, rx) = cbc::unbounded();
    thread::spawn(move || {
        let mut stdin = io::stdin().lock();
        loop {
            let byte = match stdin.fill_buf() {
                Ok(&[byte, ..]) => byte,
                _ => return,
            };
            stdin.consume(1);
            let Ok(()) = tx.send(byte) else { return };
        }
    });
    rx
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let filter = if args.trace {
        EnvFilter::new("trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let Some(path) = args.elf.as_ref().or(args.image.as_ref()) else {
        bail!("no image given (use --elf <PATH> or a positional IMAGE)");
    };
    let image = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut emu = Emulator::new(&args.config(), &image)
        .with_context(|| format!("loading {}", path.display()))?;

    if let Some(fs) = &args.fs {
        let disk = std::fs::read(fs).with_context(|| format!("reading {}", fs.display()))?;
        emu.attach_filesystem(disk);
    }
    if let Some(dtb) = &args.dtb {
        let blob = std::fs::read(dtb).with_context(|| format!("reading {}", dtb.display()))?;
        emu.attach_dtb(blob)
            .with_context(|| format!("installing {}", dtb.display()))?;
    }

    let test_mode = emu.machine().tohost().is_some();
    let input = spawn_stdin_reader();
    let mut stdout = io::stdout().lock();
    let mut executed = 0u64;

    loop {
        while let Ok(byte) = input.try_recv() {
            emu.put_input(byte);
        }

        let budget = match args.max_insns {
            0 => QUANTUM,
            max => QUANTUM.min(max - executed),
        };
        if budget == 0 {
            stdout.flush()?;
            if test_mode {
                bail!("no verdict after {} instructions", args.max_insns);
            }
            eprintln!("instruction limit ({}) reached", args.max_insns);
            return Ok(ExitCode::SUCCESS);
        }

        let result = emu.run_cycles(budget);

        loop {
            match emu.get_output() {
                0 => break,
                byte => stdout.write_all(&[byte])?,
            }
        }
        stdout.flush()?;

        let halted = result.with_context(|| {
            format!(
                "at pc 0x{:x}, gp(x3)=0x{:x}",
                emu.read_pc(),
                emu.machine().cpu.regs[3]
            )
        })?;
        if let Some(reason) = halted {
            let (hits, misses) = emu.machine().mmu.tlb().stats();
            let instret = emu.machine().cpu.csrs.instret;
            debug!(instret, tlb_hits = hits, tlb_misses = misses, "run finished");
            if test_mode {
                let verdict = if reason.passed() { "[PASS]" } else { "[FAIL]" };
                writeln!(stdout, "{verdict}")?;
            }
            writeln!(stdout, "CPU halted: {reason}")?;
            return Ok(if reason.passed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            });
        }
        // run_cycles only stops short on a halt
        executed += budget;
    }
}
