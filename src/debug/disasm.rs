//! Textual form of decoded instructions, using ABI register names.

use std::fmt;

use crate::cpu::decode::{AmoOp, Instr};
use crate::csr::addr;
use crate::mem::Width;

pub const ABI_NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

fn x(reg: u8) -> &'static str {
    ABI_NAMES[reg as usize & 0x1f]
}

fn csr_name(csr: u16) -> Option<&'static str> {
    Some(match csr {
        addr::SSTATUS => "sstatus",
        addr::SIE => "sie",
        addr::STVEC => "stvec",
        addr::SSCRATCH => "sscratch",
        addr::SEPC => "sepc",
        addr::SCAUSE => "scause",
        addr::STVAL => "stval",
        addr::SIP => "sip",
        addr::SATP => "satp",
        addr::MSTATUS => "mstatus",
        addr::MISA => "misa",
        addr::MEDELEG => "medeleg",
        addr::MIDELEG => "mideleg",
        addr::MIE => "mie",
        addr::MTVEC => "mtvec",
        addr::MSCRATCH => "mscratch",
        addr::MEPC => "mepc",
        addr::MCAUSE => "mcause",
        addr::MTVAL => "mtval",
        addr::MIP => "mip",
        addr::MHARTID => "mhartid",
        addr::CYCLE => "cycle",
        addr::TIME => "time",
        addr::INSTRET => "instret",
        _ => return None,
    })
}

struct Csr(u16);

impl fmt::Display for Csr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match csr_name(self.0) {
            Some(name) => f.write_str(name),
            None => write!(f, "0x{:03x}", self.0),
        }
    }
}

fn amo_name(op: AmoOp) -> &'static str {
    match op {
        AmoOp::Swap => "amoswap",
        AmoOp::Add => "amoadd",
        AmoOp::Xor => "amoxor",
        AmoOp::And => "amoand",
        AmoOp::Or => "amoor",
        AmoOp::Min => "amomin",
        AmoOp::Max => "amomax",
        AmoOp::Minu => "amominu",
        AmoOp::Maxu => "amomaxu",
    }
}

fn suffix(width: Width) -> &'static str {
    match width {
        Width::D => "d",
        _ => "w",
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Instr::*;

        let rtype = |f: &mut fmt::Formatter<'_>, name: &str, rd: u8, rs1: u8, rs2: u8| {
            write!(f, "{name} {}, {}, {}", x(rd), x(rs1), x(rs2))
        };
        let itype = |f: &mut fmt::Formatter<'_>, name: &str, rd: u8, rs1: u8, imm: i64| {
            write!(f, "{name} {}, {}, {imm}", x(rd), x(rs1))
        };
        let mem = |f: &mut fmt::Formatter<'_>, name: &str, reg: u8, base: u8, off: i64| {
            write!(f, "{name} {}, {off}({})", x(reg), x(base))
        };
        let branch = |f: &mut fmt::Formatter<'_>, name: &str, rs1: u8, rs2: u8, off: i64| {
            write!(f, "{name} {}, {}, {off}", x(rs1), x(rs2))
        };

        match *self {
            Addi { rd: 0, rs1: 0, imm: 0 } => f.write_str("nop"),
            Jalr { rd: 0, rs1: 1, off: 0 } => f.write_str("ret"),

            Add { rd, rs1, rs2 } => rtype(f, "add", rd, rs1, rs2),
            Sub { rd, rs1, rs2 } => rtype(f, "sub", rd, rs1, rs2),
            Xor { rd, rs1, rs2 } => rtype(f, "xor", rd, rs1, rs2),
            Or { rd, rs1, rs2 } => rtype(f, "or", rd, rs1, rs2),
            And { rd, rs1, rs2 } => rtype(f, "and", rd, rs1, rs2),
            Sll { rd, rs1, rs2 } => rtype(f, "sll", rd, rs1, rs2),
            Srl { rd, rs1, rs2 } => rtype(f, "srl", rd, rs1, rs2),
            Sra { rd, rs1, rs2 } => rtype(f, "sra", rd, rs1, rs2),
            Slt { rd, rs1, rs2 } => rtype(f, "slt", rd, rs1, rs2),
            Sltu { rd, rs1, rs2 } => rtype(f, "sltu", rd, rs1, rs2),
            Addw { rd, rs1, rs2 } => rtype(f, "addw", rd, rs1, rs2),
            Subw { rd, rs1, rs2 } => rtype(f, "subw", rd, rs1, rs2),
            Sllw { rd, rs1, rs2 } => rtype(f, "sllw", rd, rs1, rs2),
            Srlw { rd, rs1, rs2 } => rtype(f, "srlw", rd, rs1, rs2),
            Sraw { rd, rs1, rs2 } => rtype(f, "sraw", rd, rs1, rs2),
            Mul { rd, rs1, rs2 } => rtype(f, "mul", rd, rs1, rs2),
            Mulh { rd, rs1, rs2 } => rtype(f, "mulh", rd, rs1, rs2),
            Mulhsu { rd, rs1, rs2 } => rtype(f, "mulhsu", rd, rs1, rs2),
            Mulhu { rd, rs1, rs2 } => rtype(f, "mulhu", rd, rs1, rs2),
            Div { rd, rs1, rs2 } => rtype(f, "div", rd, rs1, rs2),
            Divu { rd, rs1, rs2 } => rtype(f, "divu", rd, rs1, rs2),
            Rem { rd, rs1, rs2 } => rtype(f, "rem", rd, rs1, rs2),
            Remu { rd, rs1, rs2 } => rtype(f, "remu", rd, rs1, rs2),
            Mulw { rd, rs1, rs2 } => rtype(f, "mulw", rd, rs1, rs2),
            Divw { rd, rs1, rs2 } => rtype(f, "divw", rd, rs1, rs2),
            Divuw { rd, rs1, rs2 } => rtype(f, "divuw", rd, rs1, rs2),
            Remw { rd, rs1, rs2 } => rtype(f, "remw", rd, rs1, rs2),
            Remuw { rd, rs1, rs2 } => rtype(f, "remuw", rd, rs1, rs2),

            Addi { rd, rs1, imm } => itype(f, "addi", rd, rs1, imm),
            Xori { rd, rs1, imm } => itype(f, "xori", rd, rs1, imm),
            Ori { rd, rs1, imm } => itype(f, "ori", rd, rs1, imm),
            Andi { rd, rs1, imm } => itype(f, "andi", rd, rs1, imm),
            Slti { rd, rs1, imm } => itype(f, "slti", rd, rs1, imm),
            Sltiu { rd, rs1, imm } => itype(f, "sltiu", rd, rs1, imm),
            Addiw { rd, rs1, imm } => itype(f, "addiw", rd, rs1, imm),
            Slli { rd, rs1, shamt } => itype(f, "slli", rd, rs1, shamt as i64),
            Srli { rd, rs1, shamt } => itype(f, "srli", rd, rs1, shamt as i64),
            Srai { rd, rs1, shamt } => itype(f, "srai", rd, rs1, shamt as i64),
            Slliw { rd, rs1, shamt } => itype(f, "slliw", rd, rs1, shamt as i64),
            Srliw { rd, rs1, shamt } => itype(f, "srliw", rd, rs1, shamt as i64),
            Sraiw { rd, rs1, shamt } => itype(f, "sraiw", rd, rs1, shamt as i64),

            LB { rd, rs1, off } => mem(f, "lb", rd, rs1, off),
            LBU { rd, rs1, off } => mem(f, "lbu", rd, rs1, off),
            LH { rd, rs1, off } => mem(f, "lh", rd, rs1, off),
            LHU { rd, rs1, off } => mem(f, "lhu", rd, rs1, off),
            LW { rd, rs1, off } => mem(f, "lw", rd, rs1, off),
            LWU { rd, rs1, off } => mem(f, "lwu", rd, rs1, off),
            LD { rd, rs1, off } => mem(f, "ld", rd, rs1, off),
            SB { rs1, rs2, off } => mem(f, "sb", rs2, rs1, off),
            SH { rs1, rs2, off } => mem(f, "sh", rs2, rs1, off),
            SW { rs1, rs2, off } => mem(f, "sw", rs2, rs1, off),
            SD { rs1, rs2, off } => mem(f, "sd", rs2, rs1, off),

            Beq { rs1, rs2, off } => branch(f, "beq", rs1, rs2, off),
            Bne { rs1, rs2, off } => branch(f, "bne", rs1, rs2, off),
            Blt { rs1, rs2, off } => branch(f, "blt", rs1, rs2, off),
            Bge { rs1, rs2, off } => branch(f, "bge", rs1, rs2, off),
            Bltu { rs1, rs2, off } => branch(f, "bltu", rs1, rs2, off),
            Bgeu { rs1, rs2, off } => branch(f, "bgeu", rs1, rs2, off),

            Jal { rd, off } => write!(f, "jal {}, {off}", x(rd)),
            Jalr { rd, rs1, off } => mem(f, "jalr", rd, rs1, off),
            Lui { rd, imm } => write!(f, "lui {}, 0x{:x}", x(rd), (imm >> 12) & 0xfffff),
            Auipc { rd, imm } => write!(f, "auipc {}, 0x{:x}", x(rd), (imm >> 12) & 0xfffff),

            Lr { rd, rs1, width } => write!(f, "lr.{} {}, ({})", suffix(width), x(rd), x(rs1)),
            Sc { rd, rs1, rs2, width } => write!(
                f,
                "sc.{} {}, {}, ({})",
                suffix(width),
                x(rd),
                x(rs2),
                x(rs1)
            ),
            Amo { op, rd, rs1, rs2, width } => write!(
                f,
                "{}.{} {}, {}, ({})",
                amo_name(op),
                suffix(width),
                x(rd),
                x(rs2),
                x(rs1)
            ),

            Csrrw { rd, csr, rs1 } => write!(f, "csrrw {}, {}, {}", x(rd), Csr(csr), x(rs1)),
            Csrrs { rd, csr, rs1 } => write!(f, "csrrs {}, {}, {}", x(rd), Csr(csr), x(rs1)),
            Csrrc { rd, csr, rs1 } => write!(f, "csrrc {}, {}, {}", x(rd), Csr(csr), x(rs1)),
            Csrrwi { rd, csr, uimm } => write!(f, "csrrwi {}, {}, {uimm}", x(rd), Csr(csr)),
            Csrrsi { rd, csr, uimm } => write!(f, "csrrsi {}, {}, {uimm}", x(rd), Csr(csr)),
            Csrrci { rd, csr, uimm } => write!(f, "csrrci {}, {}, {uimm}", x(rd), Csr(csr)),

            Ecall => f.write_str("ecall"),
            Ebreak => f.write_str("ebreak"),
            Mret => f.write_str("mret"),
            Sret => f.write_str("sret"),
            Wfi => f.write_str("wfi"),
            SfenceVma { rs1, rs2 } => write!(f, "sfence.vma {}, {}", x(rs1), x(rs2)),
            Fence => f.write_str("fence"),
            FenceI => f.write_str("fence.i"),
        }
    }
}
