use super::Machine;
use super::decode::{AmoOp, Instr, sign_extend};
use super::trap::{self, Trap, WithPc};
use crate::csr::{PrivMode, addr, mstatus};
use crate::mem::{AccessKind, Width};

/// Executes one decoded instruction of `len` bytes at the current PC.
/// `raw` is reported as the trap value when the instruction turns out to be
/// illegal at run time (CSR or privilege checks).
pub fn execute(m: &mut Machine, instr: Instr, raw: u32, len: u64) -> Result<(), Trap> {
    let pc = m.cpu.pc;
    let xlen = m.xlen();
    let mut next_pc = pc.wrapping_add(len);
    let illegal = Trap::IllegalInstruction { pc, inst: raw };
    let priv_mode = m.cpu.csrs.priv_mode;

    let r = |m: &Machine, idx: u8| -> u64 { m.cpu.read_reg(idx) };
    let w = |m: &mut Machine, idx: u8, val: u64| m.cpu.write_reg(idx, val);

    let load = move |m: &mut Machine, rs1: u8, off: i64, width: Width| -> Result<u64, Trap> {
        let addr = m.cpu.read_reg(rs1).wrapping_add(off as u64);
        m.load(addr, width).with_pc(pc)
    };
    let store = move |m: &mut Machine, rs1: u8, off: i64, width: Width, val: u64| {
        let addr = m.cpu.read_reg(rs1).wrapping_add(off as u64);
        m.store(addr, width, val).with_pc(pc)
    };

    let word = |val: u64| -> u64 { val as i32 as i64 as u64 };

    match instr {
        Instr::Addi { rd, rs1, imm } => {
            w(m, rd, r(m, rs1).wrapping_add(imm as u64));
        }
        Instr::Add { rd, rs1, rs2 } => {
            w(m, rd, r(m, rs1).wrapping_add(r(m, rs2)));
        }
        Instr::Sub { rd, rs1, rs2 } => {
            w(m, rd, r(m, rs1).wrapping_sub(r(m, rs2)));
        }
        Instr::Xor { rd, rs1, rs2 } => {
            w(m, rd, r(m, rs1) ^ r(m, rs2));
        }
        Instr::Or { rd, rs1, rs2 } => {
            w(m, rd, r(m, rs1) | r(m, rs2));
        }
        Instr::And { rd, rs1, rs2 } => {
            w(m, rd, r(m, rs1) & r(m, rs2));
        }
        Instr::Sll { rd, rs1, rs2 } => {
            let shamt = (r(m, rs2) & xlen.shamt_mask()) as u32;
            w(m, rd, r(m, rs1).wrapping_shl(shamt));
        }
        Instr::Srl { rd, rs1, rs2 } => {
            let shamt = (r(m, rs2) & xlen.shamt_mask()) as u32;
            w(m, rd, xlen.truncate(r(m, rs1)).wrapping_shr(shamt));
        }
        Instr::Sra { rd, rs1, rs2 } => {
            // RV32 values are already sign-extended, so a 64-bit shift works
            let shamt = (r(m, rs2) & xlen.shamt_mask()) as u32;
            w(m, rd, (r(m, rs1) as i64).wrapping_shr(shamt) as u64);
        }
        Instr::Slt { rd, rs1, rs2 } => {
            w(m, rd, ((r(m, rs1) as i64) < (r(m, rs2) as i64)) as u64);
        }
        Instr::Sltu { rd, rs1, rs2 } => {
            w(m, rd, (r(m, rs1) < r(m, rs2)) as u64);
        }
        Instr::Xori { rd, rs1, imm } => {
            w(m, rd, r(m, rs1) ^ (imm as u64));
        }
        Instr::Ori { rd, rs1, imm } => {
            w(m, rd, r(m, rs1) | (imm as u64));
        }
        Instr::Andi { rd, rs1, imm } => {
            w(m, rd, r(m, rs1) & (imm as u64));
        }
        Instr::Slli { rd, rs1, shamt } => {
            w(m, rd, r(m, rs1).wrapping_shl(shamt as u32));
        }
        Instr::Srli { rd, rs1, shamt } => {
            w(m, rd, xlen.truncate(r(m, rs1)).wrapping_shr(shamt as u32));
        }
        Instr::Srai { rd, rs1, shamt } => {
            w(m, rd, (r(m, rs1) as i64).wrapping_shr(shamt as u32) as u64);
        }
        Instr::Slti { rd, rs1, imm } => {
            w(m, rd, ((r(m, rs1) as i64) < imm) as u64);
        }
        Instr::Sltiu { rd, rs1, imm } => {
            w(m, rd, (r(m, rs1) < imm as u64) as u64);
        }

        Instr::LB { rd, rs1, off } => {
            let byte = load(m, rs1, off, Width::B)?;
            w(m, rd, sign_extend(byte as i64, 8) as u64);
        }
        Instr::LBU { rd, rs1, off } => {
            let byte = load(m, rs1, off, Width::B)?;
            w(m, rd, byte);
        }
        Instr::LH { rd, rs1, off } => {
            let half = load(m, rs1, off, Width::H)?;
            w(m, rd, sign_extend(half as i64, 16) as u64);
        }
        Instr::LHU { rd, rs1, off } => {
            let half = load(m, rs1, off, Width::H)?;
            w(m, rd, half);
        }
        Instr::LW { rd, rs1, off } => {
            let value = load(m, rs1, off, Width::W)?;
            w(m, rd, word(value));
        }
        Instr::LWU { rd, rs1, off } => {
            let value = load(m, rs1, off, Width::W)?;
            w(m, rd, value);
        }
        Instr::LD { rd, rs1, off } => {
            let value = load(m, rs1, off, Width::D)?;
            w(m, rd, value);
        }
        Instr::SB { rs1, rs2, off } => {
            store(m, rs1, off, Width::B, r(m, rs2))?;
        }
        Instr::SH { rs1, rs2, off } => {
            store(m, rs1, off, Width::H, r(m, rs2))?;
        }
        Instr::SW { rs1, rs2, off } => {
            store(m, rs1, off, Width::W, r(m, rs2))?;
        }
        Instr::SD { rs1, rs2, off } => {
            store(m, rs1, off, Width::D, r(m, rs2))?;
        }

        Instr::Beq { rs1, rs2, off } => {
            if r(m, rs1) == r(m, rs2) {
                next_pc = pc.wrapping_add(off as u64);
            }
        }
        Instr::Bne { rs1, rs2, off } => {
            if r(m, rs1) != r(m, rs2) {
                next_pc = pc.wrapping_add(off as u64);
            }
        }
        Instr::Blt { rs1, rs2, off } => {
            if (r(m, rs1) as i64) < (r(m, rs2) as i64) {
                next_pc = pc.wrapping_add(off as u64);
            }
        }
        Instr::Bge { rs1, rs2, off } => {
            if (r(m, rs1) as i64) >= (r(m, rs2) as i64) {
                next_pc = pc.wrapping_add(off as u64);
            }
        }
        Instr::Bltu { rs1, rs2, off } => {
            if r(m, rs1) < r(m, rs2) {
                next_pc = pc.wrapping_add(off as u64);
            }
        }
        Instr::Bgeu { rs1, rs2, off } => {
            if r(m, rs1) >= r(m, rs2) {
                next_pc = pc.wrapping_add(off as u64);
            }
        }
        Instr::Jal { rd, off } => {
            w(m, rd, next_pc);
            next_pc = pc.wrapping_add(off as u64);
        }
        Instr::Jalr { rd, rs1, off } => {
            let target = r(m, rs1).wrapping_add(off as u64) & !1;
            w(m, rd, next_pc);
            next_pc = target;
        }
        Instr::Lui { rd, imm } => {
            w(m, rd, imm as u64);
        }
        Instr::Auipc { rd, imm } => {
            w(m, rd, pc.wrapping_add(imm as u64));
        }

        Instr::Ecall => return Err(Trap::ecall(priv_mode, pc)),
        Instr::Ebreak => return Err(Trap::Breakpoint { pc }),

        // RV64-only word forms; the decoder rejects them on RV32
        Instr::Addiw { rd, rs1, imm } => {
            w(m, rd, word(r(m, rs1).wrapping_add(imm as u64)));
        }
        Instr::Slliw { rd, rs1, shamt } => {
            w(m, rd, word((r(m, rs1) as u32).wrapping_shl(shamt as u32) as u64));
        }
        Instr::Srliw { rd, rs1, shamt } => {
            w(m, rd, word((r(m, rs1) as u32).wrapping_shr(shamt as u32) as u64));
        }
        Instr::Sraiw { rd, rs1, shamt } => {
            let result = (r(m, rs1) as i32).wrapping_shr(shamt as u32);
            w(m, rd, result as i64 as u64);
        }
        Instr::Addw { rd, rs1, rs2 } => {
            let result = (r(m, rs1) as i32).wrapping_add(r(m, rs2) as i32);
            w(m, rd, result as i64 as u64);
        }
        Instr::Subw { rd, rs1, rs2 } => {
            let result = (r(m, rs1) as i32).wrapping_sub(r(m, rs2) as i32);
            w(m, rd, result as i64 as u64);
        }
        Instr::Sllw { rd, rs1, rs2 } => {
            let result = (r(m, rs1) as u32).wrapping_shl((r(m, rs2) & 0x1f) as u32);
            w(m, rd, word(result as u64));
        }
        Instr::Srlw { rd, rs1, rs2 } => {
            let result = (r(m, rs1) as u32).wrapping_shr((r(m, rs2) & 0x1f) as u32);
            w(m, rd, word(result as u64));
        }
        Instr::Sraw { rd, rs1, rs2 } => {
            let result = (r(m, rs1) as i32).wrapping_shr((r(m, rs2) & 0x1f) as u32);
            w(m, rd, result as i64 as u64);
        }

        // M extension: no traps, division by zero and overflow have fixed results
        Instr::Mul { rd, rs1, rs2 } => {
            w(m, rd, r(m, rs1).wrapping_mul(r(m, rs2)));
        }
        Instr::Mulh { rd, rs1, rs2 } => {
            let product = (r(m, rs1) as i64 as i128) * (r(m, rs2) as i64 as i128);
            w(m, rd, (product >> xlen.bits()) as u64);
        }
        Instr::Mulhsu { rd, rs1, rs2 } => {
            let product = (r(m, rs1) as i64 as i128) * (xlen.truncate(r(m, rs2)) as i128);
            w(m, rd, (product >> xlen.bits()) as u64);
        }
        Instr::Mulhu { rd, rs1, rs2 } => {
            let product =
                (xlen.truncate(r(m, rs1)) as u128) * (xlen.truncate(r(m, rs2)) as u128);
            w(m, rd, (product >> xlen.bits()) as u64);
        }
        Instr::Div { rd, rs1, rs2 } => {
            let (a, b) = (r(m, rs1) as i64, r(m, rs2) as i64);
            w(m, rd, if b == 0 { u64::MAX } else { a.wrapping_div(b) as u64 });
        }
        Instr::Divu { rd, rs1, rs2 } => {
            let (a, b) = (xlen.truncate(r(m, rs1)), xlen.truncate(r(m, rs2)));
            w(m, rd, if b == 0 { u64::MAX } else { a / b });
        }
        Instr::Rem { rd, rs1, rs2 } => {
            let (a, b) = (r(m, rs1) as i64, r(m, rs2) as i64);
            w(m, rd, if b == 0 { a as u64 } else { a.wrapping_rem(b) as u64 });
        }
        Instr::Remu { rd, rs1, rs2 } => {
            let (a, b) = (xlen.truncate(r(m, rs1)), xlen.truncate(r(m, rs2)));
            w(m, rd, if b == 0 { a } else { a % b });
        }
        Instr::Mulw { rd, rs1, rs2 } => {
            let result = (r(m, rs1) as i32).wrapping_mul(r(m, rs2) as i32);
            w(m, rd, result as i64 as u64);
        }
        Instr::Divw { rd, rs1, rs2 } => {
            let (a, b) = (r(m, rs1) as i32, r(m, rs2) as i32);
            let result = if b == 0 { -1 } else { a.wrapping_div(b) };
            w(m, rd, result as i64 as u64);
        }
        Instr::Divuw { rd, rs1, rs2 } => {
            let (a, b) = (r(m, rs1) as u32, r(m, rs2) as u32);
            let result = if b == 0 { u32::MAX } else { a / b };
            w(m, rd, word(result as u64));
        }
        Instr::Remw { rd, rs1, rs2 } => {
            let (a, b) = (r(m, rs1) as i32, r(m, rs2) as i32);
            let result = if b == 0 { a } else { a.wrapping_rem(b) };
            w(m, rd, result as i64 as u64);
        }
        Instr::Remuw { rd, rs1, rs2 } => {
            let (a, b) = (r(m, rs1) as u32, r(m, rs2) as u32);
            let result = if b == 0 { a } else { a % b };
            w(m, rd, word(result as u64));
        }

        // A extension
        Instr::Lr { rd, rs1, width } => {
            let (vaddr, paddr) = atomic_addr(m, pc, rs1, width, AccessKind::Load)?;
            let value = m
                .load_phys(paddr, vaddr, width, AccessKind::Load)
                .with_pc(pc)?;
            m.reservation = Some(paddr);
            w(m, rd, extend(value, width));
        }
        Instr::Sc { rd, rs1, rs2, width } => {
            let (vaddr, paddr) = atomic_addr(m, pc, rs1, width, AccessKind::Store)?;
            let held = m.reservation.take() == Some(paddr);
            if held {
                m.store_phys(paddr, vaddr, width, r(m, rs2)).with_pc(pc)?;
            }
            w(m, rd, (!held) as u64);
        }
        Instr::Amo { op, rd, rs1, rs2, width } => {
            let (vaddr, paddr) = atomic_addr(m, pc, rs1, width, AccessKind::Store)?;
            let old = m
                .load_phys(paddr, vaddr, width, AccessKind::Store)
                .with_pc(pc)?;
            let old = extend(old, width);
            let new = amo(op, old, r(m, rs2), width);
            m.store_phys(paddr, vaddr, width, new).with_pc(pc)?;
            w(m, rd, old);
        }

        // Zicsr: rd = x0 skips the read of csrrw, rs1 = x0 / uimm = 0 skips
        // the write of the set/clear forms
        Instr::Csrrw { rd, csr, rs1 } => {
            let value = r(m, rs1);
            let old = if rd != 0 {
                Some(m.cpu.csrs.read(csr).map_err(|_| illegal)?)
            } else {
                None
            };
            m.cpu.csrs.write(csr, value).map_err(|_| illegal)?;
            csr_written(m, csr);
            if let Some(old) = old {
                w(m, rd, old);
            }
        }
        Instr::Csrrs { rd, csr, rs1 } => {
            let old = m.cpu.csrs.read(csr).map_err(|_| illegal)?;
            if rs1 != 0 {
                m.cpu.csrs.set_bits(csr, r(m, rs1)).map_err(|_| illegal)?;
                csr_written(m, csr);
            }
            w(m, rd, old);
        }
        Instr::Csrrc { rd, csr, rs1 } => {
            let old = m.cpu.csrs.read(csr).map_err(|_| illegal)?;
            if rs1 != 0 {
                m.cpu.csrs.clear_bits(csr, r(m, rs1)).map_err(|_| illegal)?;
                csr_written(m, csr);
            }
            w(m, rd, old);
        }
        Instr::Csrrwi { rd, csr, uimm } => {
            let old = if rd != 0 {
                Some(m.cpu.csrs.read(csr).map_err(|_| illegal)?)
            } else {
                None
            };
            m.cpu.csrs.write(csr, uimm as u64).map_err(|_| illegal)?;
            csr_written(m, csr);
            if let Some(old) = old {
                w(m, rd, old);
            }
        }
        Instr::Csrrsi { rd, csr, uimm } => {
            let old = m.cpu.csrs.read(csr).map_err(|_| illegal)?;
            if uimm != 0 {
                m.cpu.csrs.set_bits(csr, uimm as u64).map_err(|_| illegal)?;
                csr_written(m, csr);
            }
            w(m, rd, old);
        }
        Instr::Csrrci { rd, csr, uimm } => {
            let old = m.cpu.csrs.read(csr).map_err(|_| illegal)?;
            if uimm != 0 {
                m.cpu.csrs.clear_bits(csr, uimm as u64).map_err(|_| illegal)?;
                csr_written(m, csr);
            }
            w(m, rd, old);
        }

        // Privileged
        Instr::Mret => {
            if priv_mode != PrivMode::Machine {
                return Err(illegal);
            }
            trap::mret(&mut m.cpu);
            return Ok(());
        }
        Instr::Sret => {
            let trapped = m.cpu.csrs.mstatus_bit(mstatus::TSR);
            if priv_mode == PrivMode::User || (priv_mode == PrivMode::Supervisor && trapped) {
                return Err(illegal);
            }
            trap::sret(&mut m.cpu);
            return Ok(());
        }
        Instr::Wfi => {
            let trapped = m.cpu.csrs.mstatus_bit(mstatus::TW);
            if priv_mode == PrivMode::User || (priv_mode == PrivMode::Supervisor && trapped) {
                return Err(illegal);
            }
        }
        Instr::SfenceVma { .. } => {
            let trapped = m.cpu.csrs.mstatus_bit(mstatus::TVM);
            if priv_mode == PrivMode::User || (priv_mode == PrivMode::Supervisor && trapped) {
                return Err(illegal);
            }
            m.mmu.flush();
        }
        Instr::Fence | Instr::FenceI => {
            // single in-order hart, nothing to order
        }
    }

    m.cpu.pc = next_pc;
    Ok(())
}

/// LR/SC/AMO need natural alignment. Returns `(vaddr, paddr)`.
fn atomic_addr(
    m: &mut Machine,
    pc: u64,
    rs1: u8,
    width: Width,
    kind: AccessKind,
) -> Result<(u64, u64), Trap> {
    let vaddr = m.xlen().truncate(m.cpu.read_reg(rs1));
    if vaddr % width.bytes() != 0 {
        return Err(match kind {
            AccessKind::Load => Trap::LoadMisaligned { pc, addr: vaddr },
            _ => Trap::StoreMisaligned { pc, addr: vaddr },
        });
    }
    let paddr = m.translate(vaddr, kind).with_pc(pc)?;
    Ok((vaddr, paddr))
}

/// Translation depends on satp, so cached entries die with it.
fn csr_written(m: &mut Machine, csr: u16) {
    if csr == addr::SATP {
        m.mmu.flush();
    }
}

/// Sign-extends a loaded word; doublewords pass through.
fn extend(value: u64, width: Width) -> u64 {
    match width {
        Width::W => value as i32 as i64 as u64,
        _ => value,
    }
}

fn amo(op: AmoOp, old: u64, src: u64, width: Width) -> u64 {
    let (signed_old, signed_src) = match width {
        Width::W => (old as i32 as i64, src as i32 as i64),
        _ => (old as i64, src as i64),
    };
    let (unsigned_old, unsigned_src) = match width {
        Width::W => (old as u32 as u64, src as u32 as u64),
        _ => (old, src),
    };
    match op {
        AmoOp::Swap => src,
        AmoOp::Add => old.wrapping_add(src),
        AmoOp::Xor => old ^ src,
        AmoOp::And => old & src,
        AmoOp::Or => old | src,
        AmoOp::Min => if signed_old < signed_src { old } else { src },
        AmoOp::Max => if signed_old > signed_src { old } else { src },
        AmoOp::Minu => if unsigned_old < unsigned_src { old } else { src },
        AmoOp::Maxu => if unsigned_old > unsigned_src { old } else { src },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Xlen;
    use crate::mem::DRAM_BASE;

    fn machine(xlen: Xlen) -> Machine {
        let mut m = Machine::new(0x10_0000, xlen);
        m.cpu.pc = DRAM_BASE;
        m
    }

    fn run(m: &mut Machine, instr: Instr) -> Result<(), Trap> {
        execute(m, instr, 0x1234_5678, 4)
    }

    #[test]
    fn division_edge_cases() {
        let mut m = machine(Xlen::Bit64);
        m.cpu.regs[1] = i64::MIN as u64;
        m.cpu.regs[2] = -1i64 as u64;
        m.cpu.regs[3] = 0;

        run(&mut m, Instr::Div { rd: 4, rs1: 1, rs2: 2 }).unwrap();
        assert_eq!(m.cpu.regs[4], i64::MIN as u64);
        run(&mut m, Instr::Rem { rd: 4, rs1: 1, rs2: 2 }).unwrap();
        assert_eq!(m.cpu.regs[4], 0);
        run(&mut m, Instr::Div { rd: 4, rs1: 1, rs2: 3 }).unwrap();
        assert_eq!(m.cpu.regs[4], u64::MAX);
        run(&mut m, Instr::Remu { rd: 4, rs1: 1, rs2: 3 }).unwrap();
        assert_eq!(m.cpu.regs[4], i64::MIN as u64);
        run(&mut m, Instr::Divuw { rd: 4, rs1: 1, rs2: 3 }).unwrap();
        assert_eq!(m.cpu.regs[4], u64::MAX);
    }

    #[test]
    fn high_multiplies() {
        let mut m = machine(Xlen::Bit64);
        m.cpu.regs[1] = -2i64 as u64;
        m.cpu.regs[2] = 3;
        run(&mut m, Instr::Mulh { rd: 3, rs1: 1, rs2: 2 }).unwrap();
        assert_eq!(m.cpu.regs[3], u64::MAX);
        run(&mut m, Instr::Mulhu { rd: 3, rs1: 1, rs2: 2 }).unwrap();
        assert_eq!(m.cpu.regs[3], 2);
        run(&mut m, Instr::Mulhsu { rd: 3, rs1: 1, rs2: 2 }).unwrap();
        assert_eq!(m.cpu.regs[3], u64::MAX);
    }

    #[test]
    fn rv32_arithmetic_wraps_at_32_bits() {
        let mut m = machine(Xlen::Bit32);
        m.cpu.write_reg(1, 0x7fff_ffff);
        run(&mut m, Instr::Addi { rd: 2, rs1: 1, imm: 1 }).unwrap();
        assert_eq!(m.cpu.regs[2], 0xffff_ffff_8000_0000);

        run(&mut m, Instr::Srli { rd: 3, rs1: 2, shamt: 4 }).unwrap();
        assert_eq!(m.cpu.regs[3], 0x0800_0000);
        run(&mut m, Instr::Srai { rd: 3, rs1: 2, shamt: 4 }).unwrap();
        assert_eq!(m.cpu.regs[3], 0xffff_ffff_f800_0000);

        m.cpu.write_reg(4, 0x8000_0000);
        run(&mut m, Instr::Mulhu { rd: 5, rs1: 4, rs2: 4 }).unwrap();
        assert_eq!(m.cpu.regs[5], 0x4000_0000);
        m.cpu.write_reg(6, -1i64 as u64);
        run(&mut m, Instr::Div { rd: 5, rs1: 4, rs2: 6 }).unwrap();
        assert_eq!(m.cpu.regs[5], 0xffff_ffff_8000_0000);
    }

    #[test]
    fn branches_and_jumps_set_pc() {
        let mut m = machine(Xlen::Bit64);
        run(&mut m, Instr::Beq { rs1: 0, rs2: 0, off: -8 }).unwrap();
        assert_eq!(m.cpu.pc, DRAM_BASE - 8);

        m.cpu.pc = DRAM_BASE;
        m.cpu.regs[5] = DRAM_BASE + 0x101;
        execute(&mut m, Instr::Jalr { rd: 1, rs1: 5, off: 0 }, 0x8282, 2).unwrap();
        assert_eq!(m.cpu.pc, DRAM_BASE + 0x100);
        assert_eq!(m.cpu.regs[1], DRAM_BASE + 2);
    }

    #[test]
    fn lr_sc_pair() {
        let mut m = machine(Xlen::Bit64);
        let addr = DRAM_BASE + 0x800;
        m.bus.ram.write_u64(addr, 41).unwrap();
        m.cpu.regs[10] = addr;
        m.cpu.regs[11] = 42;

        run(&mut m, Instr::Lr { rd: 5, rs1: 10, width: Width::D }).unwrap();
        assert_eq!(m.cpu.regs[5], 41);
        run(&mut m, Instr::Sc { rd: 6, rs1: 10, rs2: 11, width: Width::D }).unwrap();
        assert_eq!(m.cpu.regs[6], 0);
        assert_eq!(m.bus.ram.read_u64(addr), Ok(42));

        // reservation was consumed
        run(&mut m, Instr::Sc { rd: 6, rs1: 10, rs2: 0, width: Width::D }).unwrap();
        assert_eq!(m.cpu.regs[6], 1);
        assert_eq!(m.bus.ram.read_u64(addr), Ok(42));
    }

    #[test]
    fn amo_word_ops_sign_extend() {
        let mut m = machine(Xlen::Bit64);
        let addr = DRAM_BASE + 0x900;
        m.bus.ram.write_u32(addr, 0xffff_fffe).unwrap();
        m.cpu.regs[10] = addr;
        m.cpu.regs[11] = 5;

        let amo = |op| Instr::Amo { op, rd: 12, rs1: 10, rs2: 11, width: Width::W };
        run(&mut m, amo(AmoOp::Max)).unwrap();
        assert_eq!(m.cpu.regs[12], -2i64 as u64);
        assert_eq!(m.bus.ram.read_u32(addr), Ok(5));

        run(&mut m, amo(AmoOp::Add)).unwrap();
        assert_eq!(m.cpu.regs[12], 5);
        assert_eq!(m.bus.ram.read_u32(addr), Ok(10));
    }

    #[test]
    fn misaligned_atomics_fault() {
        let mut m = machine(Xlen::Bit64);
        m.cpu.regs[10] = DRAM_BASE + 0x902;
        let pc = DRAM_BASE;
        assert_eq!(
            run(&mut m, Instr::Lr { rd: 5, rs1: 10, width: Width::W }),
            Err(Trap::LoadMisaligned { pc, addr: DRAM_BASE + 0x902 })
        );
        assert_eq!(
            run(&mut m, Instr::Amo { op: AmoOp::Swap, rd: 5, rs1: 10, rs2: 0, width: Width::D }),
            Err(Trap::StoreMisaligned { pc, addr: DRAM_BASE + 0x902 })
        );
        assert_eq!(m.cpu.pc, pc);
    }

    #[test]
    fn csr_x0_forms_do_not_write() {
        let mut m = machine(Xlen::Bit64);
        // cycle is read-only, but reading it with rs1 = x0 is fine
        run(&mut m, Instr::Csrrs { rd: 5, csr: addr::CYCLE, rs1: 0 }).unwrap();
        m.cpu.pc = DRAM_BASE;
        assert_eq!(
            run(&mut m, Instr::Csrrw { rd: 0, csr: addr::CYCLE, rs1: 5 }),
            Err(Trap::IllegalInstruction { pc: DRAM_BASE, inst: 0x1234_5678 })
        );

        m.cpu.regs[6] = 0xabc;
        run(&mut m, Instr::Csrrw { rd: 7, csr: addr::MSCRATCH, rs1: 6 }).unwrap();
        assert_eq!(m.cpu.regs[7], 0);
        run(&mut m, Instr::Csrrci { rd: 7, csr: addr::MSCRATCH, uimm: 0xc }).unwrap();
        assert_eq!(m.cpu.regs[7], 0xabc);
        assert_eq!(m.cpu.csrs.mscratch, 0xab0);
    }

    #[test]
    fn privileged_instructions_check_mode() {
        let mut m = machine(Xlen::Bit64);
        m.cpu.csrs.priv_mode = PrivMode::User;
        for instr in [Instr::Mret, Instr::Sret, Instr::Wfi, Instr::SfenceVma { rs1: 0, rs2: 0 }] {
            assert!(matches!(run(&mut m, instr), Err(Trap::IllegalInstruction { .. })));
        }

        m.cpu.csrs.priv_mode = PrivMode::Supervisor;
        run(&mut m, Instr::Wfi).unwrap();
        m.cpu.csrs.set_mstatus_bit(mstatus::TSR, true);
        assert!(run(&mut m, Instr::Sret).is_err());
        assert!(run(&mut m, Instr::Mret).is_err());
    }
}
