mod common;

use common::*;
use riscv_emu::cpu::trap::Trap;
use riscv_emu::debug::{ProbeError, RunUntil};
use riscv_emu::mem::DRAM_BASE;
use riscv_emu::{EmulatorError, HaltReason, MachineError, StepOutcome, Xlen};

#[test]
fn store_then_load() {
    let mut emu = emulator(&[sd(T1, T0, 0), ld(RA, T0, 0)], Xlen::Bit64);
    let cpu = &mut emu.machine_mut().cpu;
    cpu.write_reg(T0 as u8, DRAM_BASE + 0x1000);
    cpu.write_reg(T1 as u8, 5);

    assert_eq!(emu.run_cycles(2).unwrap(), None);
    assert_eq!(emu.read_register(1), Ok(5));
    assert_eq!(emu.load_doubleword(DRAM_BASE + 0x1000), Ok(5));
}

#[test]
fn register_zero_ignores_writes() {
    let mut emu = emulator(
        &[addi(ZERO, ZERO, 5), lui(ZERO, 0x12345), add(ZERO, A0, A0)],
        Xlen::Bit64,
    );
    emu.machine_mut().cpu.write_reg(A0 as u8, 7);
    for _ in 0..3 {
        emu.run_cycles(1).unwrap();
        assert_eq!(emu.read_register(0), Ok(0));
    }
    assert_eq!(emu.read_pc(), DRAM_BASE + 12);
}

#[test]
fn echoes_console_input() {
    let mut emu = emulator(
        &[
            lui(T0, 0x10000),   // uart
            lbu(T1, T0, 0),     // 1: read a byte, 0 when empty
            beq(T1, ZERO, -4),  //    nothing yet
            sb(T1, T0, 0),      //    echo it
            jal(ZERO, -12),     //    back to 1
        ],
        Xlen::Bit64,
    );
    emu.put_input(72);
    emu.put_input(105);
    emu.run_cycles(100).unwrap();

    let mut output = Vec::new();
    loop {
        match emu.get_output() {
            0 => break,
            byte => output.push(byte),
        }
    }
    assert_eq!(output, [72, 105]);
}

#[test]
fn compressed_matches_full_width() {
    // c.li a0, 5 ; c.addi a0, 3 ; c.mv a1, a0 ; c.add a1, a0
    let compressed: Vec<u8> = [0x4515u16, 0x050d, 0x85aa, 0x95aa]
        .iter()
        .flat_map(|h| h.to_le_bytes())
        .collect();
    let full = [
        addi(A0, ZERO, 5),
        addi(A0, A0, 3),
        add(A1, ZERO, A0),
        add(A1, A1, A0),
    ];

    let mut short = image_emulator(&compressed, Xlen::Bit64);
    let mut long = emulator(&full, Xlen::Bit64);
    short.run_cycles(4).unwrap();
    long.run_cycles(4).unwrap();

    for reg in 0..32 {
        assert_eq!(short.read_register(reg), long.read_register(reg), "x{reg}");
    }
    assert_eq!(short.read_register(A1 as usize), Ok(16));
    assert_eq!(short.read_pc(), DRAM_BASE + 8);
    assert_eq!(long.read_pc(), DRAM_BASE + 16);
}

#[test]
fn rv32_arithmetic_wraps_at_32_bits() {
    let mut emu = emulator(&[lui(RA, 0x80000), addi(RA, RA, -1)], Xlen::Bit32);
    emu.run_cycles(1).unwrap();
    assert_eq!(emu.read_register(1), Ok(0x8000_0000));
    // kept sign-extended internally
    assert_eq!(emu.machine().cpu.regs[1], 0xffff_ffff_8000_0000);
    emu.run_cycles(1).unwrap();
    assert_eq!(emu.read_register(1), Ok(0x7fff_ffff));
}

#[test]
fn breakpoints_stop_on_the_target() {
    // a0 += 1 forever
    let mut emu = emulator(&[addi(A0, A0, 1), jal(ZERO, -4)], Xlen::Bit64);

    let target = DRAM_BASE + 4;
    assert_eq!(
        emu.run_until_breakpoints(&[target], 10).unwrap(),
        RunUntil::Breakpoint(target)
    );
    assert_eq!(emu.read_pc(), target);
    assert_eq!(emu.read_register(A0 as usize), Ok(1));

    assert_eq!(
        emu.run_until_breakpoints(&[DRAM_BASE + 0x100], 50).unwrap(),
        RunUntil::Exhausted
    );
    // still resumable
    assert_eq!(
        emu.run_until_breakpoints(&[DRAM_BASE], 2).unwrap(),
        RunUntil::Breakpoint(DRAM_BASE)
    );
    assert_eq!(emu.read_register(A0 as usize), Ok(26));
}

#[test]
fn tohost_write_halts_the_run() {
    let mut emu = emulator(
        &[addi(RA, ZERO, 1), sw(RA, GP, 0), jal(ZERO, 0)],
        Xlen::Bit64,
    );
    let tohost = DRAM_BASE + 0x1000;
    emu.machine_mut().cpu.write_reg(GP as u8, tohost);
    emu.machine_mut().set_tohost(Some(tohost));

    let reason = emu.run().unwrap();
    assert_eq!(reason, HaltReason::HostExit { code: 1 });
    assert!(reason.passed());
    assert_eq!(emu.read_pc(), DRAM_BASE + 8);
    assert_eq!(emu.run_cycles(10).unwrap(), Some(reason));
    assert_eq!(emu.read_pc(), DRAM_BASE + 8);
}

#[test]
fn unrecoverable_trap_stops_the_run() {
    // all-zero halfword is illegal and mtvec points at nothing
    let mut emu = image_emulator(&[0; 4], Xlen::Bit64);
    let err = emu.run_cycles(5).unwrap_err();
    assert!(matches!(
        err,
        EmulatorError::Machine(MachineError::Fatal {
            trap: Trap::IllegalInstruction { pc: DRAM_BASE, .. },
            handler: 0,
        })
    ));
    assert_eq!(emu.read_pc(), DRAM_BASE);
    assert_eq!(emu.machine().cpu.csrs.mcause, 0);
}

#[test]
fn illegal_instruction_reaches_the_handler() {
    let mut emu = image_emulator(&[0; 4], Xlen::Bit64);
    emu.machine_mut().cpu.csrs.mtvec = DRAM_BASE + 0x100;
    let outcome = emu.machine_mut().step().unwrap();
    assert!(matches!(
        outcome,
        StepOutcome::Trapped(Trap::IllegalInstruction { pc: DRAM_BASE, .. })
    ));
    assert_eq!(emu.read_pc(), DRAM_BASE + 0x100);
    assert_eq!(emu.machine().cpu.csrs.mepc, DRAM_BASE);
}

#[test]
fn load_doubleword_reports_unbacked_addresses() {
    let emu = emulator(&[jal(ZERO, 0)], Xlen::Bit64);
    assert_eq!(emu.load_doubleword(DRAM_BASE), Ok(jal(ZERO, 0) as u64));
    assert_eq!(
        emu.load_doubleword(0x10),
        Err(ProbeError::InvalidAddress(0x10))
    );
}
