use thiserror::Error;

use super::Xlen;
use crate::mem::Width;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid opcode: 0x{inst:08x}")]
    InvalidOpcode { inst: u32 },
    #[error("invalid function: 0x{inst:08x}")]
    InvalidFunct { inst: u32 },
    #[error("instruction requires RV64: 0x{inst:08x}")]
    Rv64Only { inst: u32 },
}

impl DecodeError {
    /// Raw instruction bits, reported as the trap value.
    pub fn inst(&self) -> u32 {
        match *self {
            DecodeError::InvalidOpcode { inst }
            | DecodeError::InvalidFunct { inst }
            | DecodeError::Rv64Only { inst } => inst,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AmoOp {
    Swap,
    Add,
    Xor,
    And,
    Or,
    Min,
    Max,
    Minu,
    Maxu,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Instr {
    // ** RISC-V 32 & 64 Base Instructions **
    // R-type (0b0110011)
    Add { rd: u8, rs1: u8, rs2: u8 },
    Sub { rd: u8, rs1: u8, rs2: u8 },
    Xor { rd: u8, rs1: u8, rs2: u8 },
    Or { rd: u8, rs1: u8, rs2: u8 },
    And { rd: u8, rs1: u8, rs2: u8 },
    Sll { rd: u8, rs1: u8, rs2: u8 },
    Srl { rd: u8, rs1: u8, rs2: u8 },
    Sra { rd: u8, rs1: u8, rs2: u8 },
    Slt { rd: u8, rs1: u8, rs2: u8 },
    Sltu { rd: u8, rs1: u8, rs2: u8 },
    // I-type arithmetic (0b0010011)
    Addi { rd: u8, rs1: u8, imm: i64 },
    Xori { rd: u8, rs1: u8, imm: i64 },
    Ori { rd: u8, rs1: u8, imm: i64 },
    Andi { rd: u8, rs1: u8, imm: i64 },
    Slli { rd: u8, rs1: u8, shamt: u8 },
    Srli { rd: u8, rs1: u8, shamt: u8 },
    Srai { rd: u8, rs1: u8, shamt: u8 },
    Slti { rd: u8, rs1: u8, imm: i64 },
    Sltiu { rd: u8, rs1: u8, imm: i64 },
    // I-type load (0b0000011)
    LB { rd: u8, rs1: u8, off: i64 },
    LBU { rd: u8, rs1: u8, off: i64 },
    LH { rd: u8, rs1: u8, off: i64 },
    LHU { rd: u8, rs1: u8, off: i64 },
    LW { rd: u8, rs1: u8, off: i64 },
    // S-type (0b0100011)
    SB { rs1: u8, rs2: u8, off: i64 },
    SH { rs1: u8, rs2: u8, off: i64 },
    SW { rs1: u8, rs2: u8, off: i64 },
    // B-type (0b1100011)
    Beq { rs1: u8, rs2: u8, off: i64 },
    Bne { rs1: u8, rs2: u8, off: i64 },
    Blt { rs1: u8, rs2: u8, off: i64 },
    Bge { rs1: u8, rs2: u8, off: i64 },
    Bltu { rs1: u8, rs2: u8, off: i64 },
    Bgeu { rs1: u8, rs2: u8, off: i64 },
    // J-type (0b1101111)
    Jal { rd: u8, off: i64 },
    // I-type jump (0b1100111)
    Jalr { rd: u8, rs1: u8, off: i64 },
    // U-type
    Lui { rd: u8, imm: i64 },   // 0b0110111
    Auipc { rd: u8, imm: i64 }, // 0b0010111
    // I-type environment
    Ecall,  // 0b1110011 with funct3=0 and imm=0
    Ebreak, // 0b1110011 with funct3=0 and imm=1

    // ** RISC-V 64 Base Instructions **
    Addiw { rd: u8, rs1: u8, imm: i64 },
    Slliw { rd: u8, rs1: u8, shamt: u8 },
    Srliw { rd: u8, rs1: u8, shamt: u8 },
    Sraiw { rd: u8, rs1: u8, shamt: u8 },
    Addw { rd: u8, rs1: u8, rs2: u8 },
    Subw { rd: u8, rs1: u8, rs2: u8 },
    Sllw { rd: u8, rs1: u8, rs2: u8 },
    Srlw { rd: u8, rs1: u8, rs2: u8 },
    Sraw { rd: u8, rs1: u8, rs2: u8 },
    LWU { rd: u8, rs1: u8, off: i64 },
    LD { rd: u8, rs1: u8, off: i64 },
    SD { rs1: u8, rs2: u8, off: i64 },

    // ** M extension **
    Mul { rd: u8, rs1: u8, rs2: u8 },
    Mulh { rd: u8, rs1: u8, rs2: u8 },
    Mulhsu { rd: u8, rs1: u8, rs2: u8 },
    Mulhu { rd: u8, rs1: u8, rs2: u8 },
    Div { rd: u8, rs1: u8, rs2: u8 },
    Divu { rd: u8, rs1: u8, rs2: u8 },
    Rem { rd: u8, rs1: u8, rs2: u8 },
    Remu { rd: u8, rs1: u8, rs2: u8 },
    Mulw { rd: u8, rs1: u8, rs2: u8 },
    Divw { rd: u8, rs1: u8, rs2: u8 },
    Divuw { rd: u8, rs1: u8, rs2: u8 },
    Remw { rd: u8, rs1: u8, rs2: u8 },
    Remuw { rd: u8, rs1: u8, rs2: u8 },

    // ** A extension ** (aq/rl ordering is implicit on a single hart)
    Lr { rd: u8, rs1: u8, width: Width },
    Sc { rd: u8, rs1: u8, rs2: u8, width: Width },
    Amo { op: AmoOp, rd: u8, rs1: u8, rs2: u8, width: Width },

    // CSR instructions
    Csrrw { rd: u8, csr: u16, rs1: u8 },
    Csrrs { rd: u8, csr: u16, rs1: u8 },
    Csrrc { rd: u8, csr: u16, rs1: u8 },
    Csrrwi { rd: u8, csr: u16, uimm: u8 },
    Csrrsi { rd: u8, csr: u16, uimm: u8 },
    Csrrci { rd: u8, csr: u16, uimm: u8 },

    // Privileged
    Mret,
    Sret,
    Wfi,
    SfenceVma { rs1: u8, rs2: u8 },

    // Memory ordering, no-ops on a single in-order hart
    Fence,
    FenceI,
}

pub(crate) fn sign_extend(value: i64, bits: u32) -> i64 {
    let shift = 64 - bits;
    (value << shift) >> shift
}

fn rd(inst: u32) -> u8 {
    ((inst >> 7) & 0x1f) as u8
}

fn rs1(inst: u32) -> u8 {
    ((inst >> 15) & 0x1f) as u8
}

fn rs2(inst: u32) -> u8 {
    ((inst >> 20) & 0x1f) as u8
}

fn funct3(inst: u32) -> u8 {
    ((inst >> 12) & 0x7) as u8
}

fn funct7(inst: u32) -> u8 {
    ((inst >> 25) & 0x7f) as u8
}

fn i_imm(inst: u32) -> i64 {
    sign_extend((inst >> 20) as i64, 12)
}

/// Decodes a 32-bit instruction. Compressed forms go through
/// [`super::compressed::expand`].
pub fn decode(inst: u32, xlen: Xlen) -> Result<Instr, DecodeError> {
    let rv64 = xlen == Xlen::Bit64;
    let rv64_only = |instr: Instr| {
        if rv64 {
            Ok(instr)
        } else {
            Err(DecodeError::Rv64Only { inst })
        }
    };

    let opcode = inst & 0x7f;
    match opcode {
        // r type
        0b0110011 => {
            let (rd, rs1, rs2) = (rd(inst), rs1(inst), rs2(inst));
            match (funct3(inst), funct7(inst)) {
                (0x0, 0x00) => Ok(Instr::Add { rd, rs1, rs2 }),
                (0x0, 0x20) => Ok(Instr::Sub { rd, rs1, rs2 }),
                (0x4, 0x00) => Ok(Instr::Xor { rd, rs1, rs2 }),
                (0x6, 0x00) => Ok(Instr::Or { rd, rs1, rs2 }),
                (0x7, 0x00) => Ok(Instr::And { rd, rs1, rs2 }),
                (0x1, 0x00) => Ok(Instr::Sll { rd, rs1, rs2 }),
                (0x5, 0x00) => Ok(Instr::Srl { rd, rs1, rs2 }),
                (0x5, 0x20) => Ok(Instr::Sra { rd, rs1, rs2 }),
                (0x2, 0x00) => Ok(Instr::Slt { rd, rs1, rs2 }),
                (0x3, 0x00) => Ok(Instr::Sltu { rd, rs1, rs2 }),
                // M extension
                (0x0, 0x01) => Ok(Instr::Mul { rd, rs1, rs2 }),
                (0x1, 0x01) => Ok(Instr::Mulh { rd, rs1, rs2 }),
                (0x2, 0x01) => Ok(Instr::Mulhsu { rd, rs1, rs2 }),
                (0x3, 0x01) => Ok(Instr::Mulhu { rd, rs1, rs2 }),
                (0x4, 0x01) => Ok(Instr::Div { rd, rs1, rs2 }),
                (0x5, 0x01) => Ok(Instr::Divu { rd, rs1, rs2 }),
                (0x6, 0x01) => Ok(Instr::Rem { rd, rs1, rs2 }),
                (0x7, 0x01) => Ok(Instr::Remu { rd, rs1, rs2 }),
                _ => Err(DecodeError::InvalidFunct { inst }),
            }
        }
        // i type
        0b0010011 => {
            let (rd, rs1, imm) = (rd(inst), rs1(inst), i_imm(inst));
            // RV32 shifts have a 5-bit shamt, bit 25 must be clear
            let shamt_mask = if rv64 { 0x3f } else { 0x1f };
            let shamt = ((inst >> 20) & shamt_mask) as u8;
            let upper = if rv64 { inst >> 26 } else { inst >> 25 };
            match funct3(inst) {
                0x0 => Ok(Instr::Addi { rd, rs1, imm }),
                0x4 => Ok(Instr::Xori { rd, rs1, imm }),
                0x6 => Ok(Instr::Ori { rd, rs1, imm }),
                0x7 => Ok(Instr::Andi { rd, rs1, imm }),
                0x1 if upper == 0 => Ok(Instr::Slli { rd, rs1, shamt }),
                0x5 => match (upper, rv64) {
                    (0x00, _) => Ok(Instr::Srli { rd, rs1, shamt }),
                    (0x10, true) | (0x20, false) => Ok(Instr::Srai { rd, rs1, shamt }),
                    _ => Err(DecodeError::InvalidFunct { inst }),
                },
                0x2 => Ok(Instr::Slti { rd, rs1, imm }),
                0x3 => Ok(Instr::Sltiu { rd, rs1, imm }),
                _ => Err(DecodeError::InvalidFunct { inst }),
            }
        }
        0b0000011 => {
            let (rd, rs1, off) = (rd(inst), rs1(inst), i_imm(inst));
            match funct3(inst) {
                0x0 => Ok(Instr::LB { rd, rs1, off }),
                0x4 => Ok(Instr::LBU { rd, rs1, off }),
                0x1 => Ok(Instr::LH { rd, rs1, off }),
                0x5 => Ok(Instr::LHU { rd, rs1, off }),
                0x2 => Ok(Instr::LW { rd, rs1, off }),
                // rv64 extensions
                0x6 => rv64_only(Instr::LWU { rd, rs1, off }),
                0x3 => rv64_only(Instr::LD { rd, rs1, off }),
                _ => Err(DecodeError::InvalidFunct { inst }),
            }
        }
        // s type
        0b0100011 => {
            let (rs1, rs2) = (rs1(inst), rs2(inst));
            let off = {
                let imm4_0 = (inst >> 7) & 0x1f;
                let imm11_5 = (inst >> 25) & 0x7f;
                sign_extend(((imm11_5 << 5) | imm4_0) as i64, 12)
            };

            match funct3(inst) {
                0x0 => Ok(Instr::SB { rs1, rs2, off }),
                0x1 => Ok(Instr::SH { rs1, rs2, off }),
                0x2 => Ok(Instr::SW { rs1, rs2, off }),
                // rv64 extension
                0x3 => rv64_only(Instr::SD { rs1, rs2, off }),
                _ => Err(DecodeError::InvalidFunct { inst }),
            }
        }
        //  b type
        0b1100011 => {
            let (rs1, rs2) = (rs1(inst), rs2(inst));
            let off = {
                let imm11 = (inst >> 7) & 0x1;
                let imm4_1 = (inst >> 8) & 0xf;
                let imm10_5 = (inst >> 25) & 0x3f;
                let imm12 = (inst >> 31) & 0x1;
                sign_extend(
                    ((imm12 << 12) | (imm11 << 11) | (imm10_5 << 5) | (imm4_1 << 1)) as i64,
                    13,
                )
            };

            match funct3(inst) {
                0x0 => Ok(Instr::Beq { rs1, rs2, off }),
                0x1 => Ok(Instr::Bne { rs1, rs2, off }),
                0x4 => Ok(Instr::Blt { rs1, rs2, off }),
                0x5 => Ok(Instr::Bge { rs1, rs2, off }),
                0x6 => Ok(Instr::Bltu { rs1, rs2, off }),
                0x7 => Ok(Instr::Bgeu { rs1, rs2, off }),
                _ => Err(DecodeError::InvalidFunct { inst }),
            }
        }
        // u type
        0b0110111 => Ok(Instr::Lui {
            rd: rd(inst),
            imm: sign_extend((inst & 0xfffff000) as i64, 32),
        }),
        0b0010111 => Ok(Instr::Auipc {
            rd: rd(inst),
            imm: sign_extend((inst & 0xfffff000) as i64, 32),
        }),
        // j type
        0b1101111 => {
            let off = {
                let imm19_12 = (inst >> 12) & 0xff;
                let imm11 = (inst >> 20) & 0x1;
                let imm10_1 = (inst >> 21) & 0x3ff;
                let imm20 = (inst >> 31) & 0x1;
                sign_extend(
                    ((imm20 << 20) | (imm19_12 << 12) | (imm11 << 11) | (imm10_1 << 1)) as i64,
                    21,
                )
            };
            Ok(Instr::Jal { rd: rd(inst), off })
        }
        // i type jalr
        0b1100111 => match funct3(inst) {
            0x0 => Ok(Instr::Jalr {
                rd: rd(inst),
                rs1: rs1(inst),
                off: i_imm(inst),
            }),
            _ => Err(DecodeError::InvalidFunct { inst }),
        },
        // i type environment
        0b1110011 => {
            let (rd, rs1) = (rd(inst), rs1(inst));
            let csr = (inst >> 20) as u16;
            match funct3(inst) {
                0x0 => match (funct7(inst), rs2(inst)) {
                    _ if rd != 0 => Err(DecodeError::InvalidFunct { inst }),
                    (0x09, rs2) => Ok(Instr::SfenceVma { rs1, rs2 }),
                    _ if rs1 != 0 => Err(DecodeError::InvalidFunct { inst }),
                    _ => match inst >> 20 {
                        0x000 => Ok(Instr::Ecall),
                        0x001 => Ok(Instr::Ebreak),
                        0x102 => Ok(Instr::Sret),
                        0x105 => Ok(Instr::Wfi),
                        0x302 => Ok(Instr::Mret),
                        _ => Err(DecodeError::InvalidFunct { inst }),
                    },
                },
                0x1 => Ok(Instr::Csrrw { rd, csr, rs1 }),
                0x2 => Ok(Instr::Csrrs { rd, csr, rs1 }),
                0x3 => Ok(Instr::Csrrc { rd, csr, rs1 }),
                0x5 => Ok(Instr::Csrrwi { rd, csr, uimm: rs1 }),
                0x6 => Ok(Instr::Csrrsi { rd, csr, uimm: rs1 }),
                0x7 => Ok(Instr::Csrrci { rd, csr, uimm: rs1 }),
                _ => Err(DecodeError::InvalidFunct { inst }),
            }
        }
        0b0011011 => {
            let (rd, rs1, imm) = (rd(inst), rs1(inst), i_imm(inst));
            let shamt = ((inst >> 20) & 0x1f) as u8;
            let decoded = match (funct3(inst), funct7(inst)) {
                (0x0, _) => Instr::Addiw { rd, rs1, imm },
                (0x1, 0x00) => Instr::Slliw { rd, rs1, shamt },
                (0x5, 0x00) => Instr::Srliw { rd, rs1, shamt },
                (0x5, 0x20) => Instr::Sraiw { rd, rs1, shamt },
                _ => return Err(DecodeError::InvalidFunct { inst }),
            };
            rv64_only(decoded)
        }
        0b0111011 => {
            let (rd, rs1, rs2) = (rd(inst), rs1(inst), rs2(inst));
            let decoded = match (funct3(inst), funct7(inst)) {
                (0x0, 0x00) => Instr::Addw { rd, rs1, rs2 },
                (0x0, 0x20) => Instr::Subw { rd, rs1, rs2 },
                (0x1, 0x00) => Instr::Sllw { rd, rs1, rs2 },
                (0x5, 0x00) => Instr::Srlw { rd, rs1, rs2 },
                (0x5, 0x20) => Instr::Sraw { rd, rs1, rs2 },
                (0x0, 0x01) => Instr::Mulw { rd, rs1, rs2 },
                (0x4, 0x01) => Instr::Divw { rd, rs1, rs2 },
                (0x5, 0x01) => Instr::Divuw { rd, rs1, rs2 },
                (0x6, 0x01) => Instr::Remw { rd, rs1, rs2 },
                (0x7, 0x01) => Instr::Remuw { rd, rs1, rs2 },
                _ => return Err(DecodeError::InvalidFunct { inst }),
            };
            rv64_only(decoded)
        }
        // atomics
        0b0101111 => {
            let (rd, rs1, rs2) = (rd(inst), rs1(inst), rs2(inst));
            let width = match funct3(inst) {
                0x2 => Width::W,
                0x3 if rv64 => Width::D,
                0x3 => return Err(DecodeError::Rv64Only { inst }),
                _ => return Err(DecodeError::InvalidFunct { inst }),
            };
            let op = match inst >> 27 {
                0b00010 if rs2 == 0 => return Ok(Instr::Lr { rd, rs1, width }),
                0b00011 => return Ok(Instr::Sc { rd, rs1, rs2, width }),
                0b00001 => AmoOp::Swap,
                0b00000 => AmoOp::Add,
                0b00100 => AmoOp::Xor,
                0b01100 => AmoOp::And,
                0b01000 => AmoOp::Or,
                0b10000 => AmoOp::Min,
                0b10100 => AmoOp::Max,
                0b11000 => AmoOp::Minu,
                0b11100 => AmoOp::Maxu,
                _ => return Err(DecodeError::InvalidFunct { inst }),
            };
            Ok(Instr::Amo { op, rd, rs1, rs2, width })
        }
        // Fence instructions (0b0001111)
        0b0001111 => match funct3(inst) {
            0x0 => Ok(Instr::Fence),
            0x1 => Ok(Instr::FenceI),
            _ => Err(DecodeError::InvalidFunct { inst }),
        },
        _ => Err(DecodeError::InvalidOpcode { inst }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_base_forms() {
        // addi x1, x0, -1
        assert_eq!(
            decode(0xfff0_0093, Xlen::Bit64),
            Ok(Instr::Addi { rd: 1, rs1: 0, imm: -1 })
        );
        // jal x0, -4
        assert_eq!(
            decode(0xffdf_f06f, Xlen::Bit64),
            Ok(Instr::Jal { rd: 0, off: -4 })
        );
        // sd x2, 8(x1)
        assert_eq!(
            decode(0x0020_b423, Xlen::Bit64),
            Ok(Instr::SD { rs1: 1, rs2: 2, off: 8 })
        );
    }

    #[test]
    fn rv64_forms_are_illegal_on_rv32() {
        // ld x1, 0(x2)
        assert_eq!(
            decode(0x0001_3083, Xlen::Bit32),
            Err(DecodeError::Rv64Only { inst: 0x0001_3083 })
        );
        // slli x1, x1, 32
        assert!(decode(0x0200_9093, Xlen::Bit32).is_err());
        assert_eq!(
            decode(0x0200_9093, Xlen::Bit64),
            Ok(Instr::Slli { rd: 1, rs1: 1, shamt: 32 })
        );
    }

    #[test]
    fn decodes_system_instructions() {
        assert_eq!(decode(0x3020_0073, Xlen::Bit64), Ok(Instr::Mret));
        assert_eq!(decode(0x1020_0073, Xlen::Bit64), Ok(Instr::Sret));
        assert_eq!(decode(0x1050_0073, Xlen::Bit64), Ok(Instr::Wfi));
        assert_eq!(
            decode(0x1200_0073, Xlen::Bit64),
            Ok(Instr::SfenceVma { rs1: 0, rs2: 0 })
        );
        assert_eq!(decode(0x0000_100f, Xlen::Bit64), Ok(Instr::FenceI));
        // csrrs x5, mstatus, x0
        assert_eq!(
            decode(0x3000_22f3, Xlen::Bit64),
            Ok(Instr::Csrrs { rd: 5, csr: 0x300, rs1: 0 })
        );
    }

    #[test]
    fn decodes_atomics() {
        // lr.w x5, (x10)
        assert_eq!(
            decode(0x1005_22af, Xlen::Bit64),
            Ok(Instr::Lr { rd: 5, rs1: 10, width: Width::W })
        );
        // amoadd.d x5, x6, (x10)
        assert_eq!(
            decode(0x0065_32af, Xlen::Bit64),
            Ok(Instr::Amo { op: AmoOp::Add, rd: 5, rs1: 10, rs2: 6, width: Width::D })
        );
    }

    #[test]
    fn floating_point_opcodes_are_illegal() {
        // flw f0, 0(x10)
        assert_eq!(
            decode(0x0005_2007, Xlen::Bit64),
            Err(DecodeError::InvalidOpcode { inst: 0x0005_2007 })
        );
        // fadd.s
        assert!(decode(0x0000_0053, Xlen::Bit64).is_err());
    }
}
