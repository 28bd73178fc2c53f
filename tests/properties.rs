mod common;

use common::*;
use proptest::prelude::*;
use riscv_emu::mem::DRAM_BASE;
use riscv_emu::{Emulator, Xlen};

const SCRATCH: u64 = DRAM_BASE + 0x4000;
const HANDLER: u64 = DRAM_BASE + 0x8000;

/// Registers, PC, counters and the trap CSRs: everything a run can change
/// apart from memory.
fn snapshot(emu: &Emulator) -> (Vec<u64>, u64, u64, u64, u64) {
    let m = emu.machine();
    let csrs = &m.cpu.csrs;
    (m.cpu.regs.to_vec(), m.cpu.pc, csrs.instret, csrs.mcause, csrs.mepc)
}

fn counting_loop() -> Emulator {
    let mut emu = emulator(
        &[
            addi(A0, A0, 1),
            mul(A1, A0, A0),
            sd(A1, T0, 0),
            add(A2, A2, A1),
            jal(ZERO, -16),
        ],
        Xlen::Bit64,
    );
    emu.machine_mut().cpu.write_reg(T0 as u8, SCRATCH);
    emu
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Load { base: u32, off: i32, rd: u32 },
    Store { base: u32, off: i32, rs: u32 },
}

impl Op {
    fn encode(self) -> u32 {
        match self {
            Op::Load { base, off, rd } => ld(rd, base, off),
            Op::Store { base, off, rs } => sd(rs, base, off),
        }
    }
}

fn op() -> impl Strategy<Value = Op> {
    // a0: identity RW, a1: read-only alias, a2: unmapped
    let base = prop::sample::select(vec![A0, A1, A2]);
    let off = (0i32..256).prop_map(|slot| slot * 8);
    let reg = 20u32..28;
    prop_oneof![
        (base.clone(), off.clone(), reg.clone()).prop_map(|(base, off, rd)| Op::Load { base, off, rd }),
        (base, off, reg).prop_map(|(base, off, rs)| Op::Store { base, off, rs }),
    ]
}

fn paged_program(ops: &[Op], page_cache: bool) -> Emulator {
    let mut words: Vec<u32> = ops.iter().map(|op| op.encode()).collect();
    words.push(jal(ZERO, 0));
    let mut emu = emulator(&words, Xlen::Bit64);
    write_words(&mut emu, HANDLER, &SKIP_HANDLER);
    emu.machine_mut().cpu.csrs.mtvec = HANDLER;
    for (reg, value) in [(A0, SCRATCH), (A1, RO_ALIAS + 0x4000), (A2, UNMAPPED)] {
        emu.machine_mut().cpu.write_reg(reg as u8, value);
    }
    for reg in 20..28u8 {
        emu.machine_mut().cpu.write_reg(reg, 0x1111 * reg as u64);
    }
    enter_sv39_supervisor(&mut emu);
    emu.enable_page_cache(page_cache);
    emu
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn run_cycles_composes(n in 0u64..200, m in 0u64..200) {
        let mut split = counting_loop();
        split.run_cycles(n).unwrap();
        split.run_cycles(m).unwrap();

        let mut whole = counting_loop();
        whole.run_cycles(n + m).unwrap();

        prop_assert_eq!(snapshot(&split), snapshot(&whole));
        prop_assert_eq!(split.load_doubleword(SCRATCH), whole.load_doubleword(SCRATCH));
    }

    #[test]
    fn page_cache_never_changes_results(ops in prop::collection::vec(op(), 1..24)) {
        let budget = ops.len() as u64 * (1 + SKIP_HANDLER.len() as u64) + 4;

        let mut cached = paged_program(&ops, true);
        let mut uncached = paged_program(&ops, false);
        cached.run_cycles(budget).unwrap();
        uncached.run_cycles(budget).unwrap();

        prop_assert_eq!(snapshot(&cached), snapshot(&uncached));
        for slot in 0..256 {
            let addr = SCRATCH + slot * 8;
            prop_assert_eq!(cached.load_doubleword(addr), uncached.load_doubleword(addr));
        }
        prop_assert!(!uncached.machine().mmu.cache_enabled());
        prop_assert!(uncached.machine().mmu.tlb().is_empty());
    }
}
