//! Expansion of 16-bit RVC instructions into their 32-bit equivalents.
//! Floating-point compressed forms are reported as illegal.

use super::Xlen;
use super::decode::{DecodeError, Instr, sign_extend};

fn bit(inst: u16, n: u32) -> u32 {
    ((inst >> n) & 1) as u32
}

fn bits(inst: u16, hi: u32, lo: u32) -> u32 {
    ((inst as u32) >> lo) & ((1 << (hi - lo + 1)) - 1)
}

/// rd'/rs1'/rs2' field: x8..x15
fn creg(inst: u16, lo: u32) -> u8 {
    8 + bits(inst, lo + 2, lo) as u8
}

/// 6-bit signed immediate used by C.ADDI, C.LI, C.ANDI, C.ADDIW
fn imm6(inst: u16) -> i64 {
    sign_extend(((bit(inst, 12) << 5) | bits(inst, 6, 2)) as i64, 6)
}

fn shamt6(inst: u16) -> u8 {
    ((bit(inst, 12) << 5) | bits(inst, 6, 2)) as u8
}

/// C.J / C.JAL offset
fn cj_offset(inst: u16) -> i64 {
    let off = (bit(inst, 12) << 11)
        | (bit(inst, 11) << 4)
        | (bits(inst, 10, 9) << 8)
        | (bit(inst, 8) << 10)
        | (bit(inst, 7) << 6)
        | (bit(inst, 6) << 7)
        | (bits(inst, 5, 3) << 1)
        | (bit(inst, 2) << 5);
    sign_extend(off as i64, 12)
}

/// C.BEQZ / C.BNEZ offset
fn cb_offset(inst: u16) -> i64 {
    let off = (bit(inst, 12) << 8)
        | (bits(inst, 11, 10) << 3)
        | (bits(inst, 6, 5) << 6)
        | (bits(inst, 4, 3) << 1)
        | (bit(inst, 2) << 5);
    sign_extend(off as i64, 9)
}

/// C.LW / C.SW offset
fn clw_offset(inst: u16) -> i64 {
    ((bits(inst, 12, 10) << 3) | (bit(inst, 6) << 2) | (bit(inst, 5) << 6)) as i64
}

/// C.LD / C.SD offset
fn cld_offset(inst: u16) -> i64 {
    ((bits(inst, 12, 10) << 3) | (bits(inst, 6, 5) << 6)) as i64
}

pub fn expand(inst: u16, xlen: Xlen) -> Result<Instr, DecodeError> {
    let rv64 = xlen == Xlen::Bit64;
    let illegal = DecodeError::InvalidOpcode { inst: inst as u32 };
    let funct3 = bits(inst, 15, 13);
    let rd = bits(inst, 11, 7) as u8;
    let rs2 = bits(inst, 6, 2) as u8;

    match (inst & 0b11, funct3) {
        // ** Quadrant 0 **
        (0b00, 0b000) => {
            // C.ADDI4SPN
            let imm = (bits(inst, 12, 11) << 4)
                | (bits(inst, 10, 7) << 6)
                | (bit(inst, 6) << 2)
                | (bit(inst, 5) << 3);
            if imm == 0 {
                return Err(illegal);
            }
            Ok(Instr::Addi { rd: creg(inst, 2), rs1: 2, imm: imm as i64 })
        }
        (0b00, 0b010) => Ok(Instr::LW {
            rd: creg(inst, 2),
            rs1: creg(inst, 7),
            off: clw_offset(inst),
        }),
        (0b00, 0b011) if rv64 => Ok(Instr::LD {
            rd: creg(inst, 2),
            rs1: creg(inst, 7),
            off: cld_offset(inst),
        }),
        (0b00, 0b110) => Ok(Instr::SW {
            rs1: creg(inst, 7),
            rs2: creg(inst, 2),
            off: clw_offset(inst),
        }),
        (0b00, 0b111) if rv64 => Ok(Instr::SD {
            rs1: creg(inst, 7),
            rs2: creg(inst, 2),
            off: cld_offset(inst),
        }),

        // ** Quadrant 1 **
        (0b01, 0b000) => Ok(Instr::Addi { rd, rs1: rd, imm: imm6(inst) }),
        (0b01, 0b001) if rv64 => {
            if rd == 0 {
                return Err(illegal);
            }
            Ok(Instr::Addiw { rd, rs1: rd, imm: imm6(inst) })
        }
        (0b01, 0b001) => Ok(Instr::Jal { rd: 1, off: cj_offset(inst) }),
        (0b01, 0b010) => Ok(Instr::Addi { rd, rs1: 0, imm: imm6(inst) }),
        (0b01, 0b011) if rd == 2 => {
            // C.ADDI16SP
            let imm = (bit(inst, 12) << 9)
                | (bit(inst, 6) << 4)
                | (bit(inst, 5) << 6)
                | (bits(inst, 4, 3) << 7)
                | (bit(inst, 2) << 5);
            if imm == 0 {
                return Err(illegal);
            }
            Ok(Instr::Addi { rd: 2, rs1: 2, imm: sign_extend(imm as i64, 10) })
        }
        (0b01, 0b011) => {
            // C.LUI
            let imm = imm6(inst);
            if imm == 0 {
                return Err(illegal);
            }
            Ok(Instr::Lui { rd, imm: imm << 12 })
        }
        (0b01, 0b100) => {
            let rd = creg(inst, 7);
            match bits(inst, 11, 10) {
                0b00 | 0b01 => {
                    let shamt = shamt6(inst);
                    if !rv64 && shamt >= 32 {
                        return Err(illegal);
                    }
                    if bits(inst, 11, 10) == 0 {
                        Ok(Instr::Srli { rd, rs1: rd, shamt })
                    } else {
                        Ok(Instr::Srai { rd, rs1: rd, shamt })
                    }
                }
                0b10 => Ok(Instr::Andi { rd, rs1: rd, imm: imm6(inst) }),
                _ => {
                    let rs2 = creg(inst, 2);
                    match (bit(inst, 12), bits(inst, 6, 5)) {
                        (0, 0b00) => Ok(Instr::Sub { rd, rs1: rd, rs2 }),
                        (0, 0b01) => Ok(Instr::Xor { rd, rs1: rd, rs2 }),
                        (0, 0b10) => Ok(Instr::Or { rd, rs1: rd, rs2 }),
                        (0, 0b11) => Ok(Instr::And { rd, rs1: rd, rs2 }),
                        (1, 0b00) if rv64 => Ok(Instr::Subw { rd, rs1: rd, rs2 }),
                        (1, 0b01) if rv64 => Ok(Instr::Addw { rd, rs1: rd, rs2 }),
                        _ => Err(illegal),
                    }
                }
            }
        }
        (0b01, 0b101) => Ok(Instr::Jal { rd: 0, off: cj_offset(inst) }),
        (0b01, 0b110) => Ok(Instr::Beq {
            rs1: creg(inst, 7),
            rs2: 0,
            off: cb_offset(inst),
        }),
        (0b01, 0b111) => Ok(Instr::Bne {
            rs1: creg(inst, 7),
            rs2: 0,
            off: cb_offset(inst),
        }),

        // ** Quadrant 2 **
        (0b10, 0b000) => {
            let shamt = shamt6(inst);
            if !rv64 && shamt >= 32 {
                return Err(illegal);
            }
            Ok(Instr::Slli { rd, rs1: rd, shamt })
        }
        (0b10, 0b010) => {
            // C.LWSP
            if rd == 0 {
                return Err(illegal);
            }
            let off = (bit(inst, 12) << 5) | (bits(inst, 6, 4) << 2) | (bits(inst, 3, 2) << 6);
            Ok(Instr::LW { rd, rs1: 2, off: off as i64 })
        }
        (0b10, 0b011) if rv64 => {
            // C.LDSP
            if rd == 0 {
                return Err(illegal);
            }
            let off = (bit(inst, 12) << 5) | (bits(inst, 6, 5) << 3) | (bits(inst, 4, 2) << 6);
            Ok(Instr::LD { rd, rs1: 2, off: off as i64 })
        }
        (0b10, 0b100) => match (bit(inst, 12), rd, rs2) {
            (0, 0, 0) => Err(illegal),
            (0, rs1, 0) => Ok(Instr::Jalr { rd: 0, rs1, off: 0 }),
            (0, rd, rs2) => Ok(Instr::Add { rd, rs1: 0, rs2 }),
            (_, 0, 0) => Ok(Instr::Ebreak),
            (_, rs1, 0) => Ok(Instr::Jalr { rd: 1, rs1, off: 0 }),
            (_, rd, rs2) => Ok(Instr::Add { rd, rs1: rd, rs2 }),
        },
        (0b10, 0b110) => {
            // C.SWSP
            let off = (bits(inst, 12, 9) << 2) | (bits(inst, 8, 7) << 6);
            Ok(Instr::SW { rs1: 2, rs2, off: off as i64 })
        }
        (0b10, 0b111) if rv64 => {
            // C.SDSP
            let off = (bits(inst, 12, 10) << 3) | (bits(inst, 9, 7) << 6);
            Ok(Instr::SD { rs1: 2, rs2, off: off as i64 })
        }

        // C.FLD, C.FSD, C.FLW, C.FSW and their SP forms, reserved encodings
        _ => Err(illegal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_common_forms() {
        // c.li a0, 5
        assert_eq!(
            expand(0x4515, Xlen::Bit64),
            Ok(Instr::Addi { rd: 10, rs1: 0, imm: 5 })
        );
        // c.addi sp, -16
        assert_eq!(
            expand(0x1141, Xlen::Bit64),
            Ok(Instr::Addi { rd: 2, rs1: 2, imm: -16 })
        );
        // c.mv a0, a1
        assert_eq!(
            expand(0x852e, Xlen::Bit64),
            Ok(Instr::Add { rd: 10, rs1: 0, rs2: 11 })
        );
        // c.ret
        assert_eq!(
            expand(0x8082, Xlen::Bit64),
            Ok(Instr::Jalr { rd: 0, rs1: 1, off: 0 })
        );
        // c.sdsp ra, 8(sp)
        assert_eq!(
            expand(0xe406, Xlen::Bit64),
            Ok(Instr::SD { rs1: 2, rs2: 1, off: 8 })
        );
        // c.lw a0, 4(a1)
        assert_eq!(
            expand(0x41c8, Xlen::Bit64),
            Ok(Instr::LW { rd: 10, rs1: 11, off: 4 })
        );
    }

    #[test]
    fn jumps_and_branches() {
        // c.j -2
        assert_eq!(expand(0xbffd, Xlen::Bit64), Ok(Instr::Jal { rd: 0, off: -2 }));
        // c.beqz a0, 8
        assert_eq!(
            expand(0xc501, Xlen::Bit64),
            Ok(Instr::Beq { rs1: 10, rs2: 0, off: 8 })
        );
        // c.jal 32 on rv32; on rv64 the same bits are c.addiw with rd=0, reserved
        assert_eq!(expand(0x2005, Xlen::Bit32), Ok(Instr::Jal { rd: 1, off: 32 }));
        assert_eq!(
            expand(0x2005, Xlen::Bit64),
            Err(DecodeError::InvalidOpcode { inst: 0x2005 })
        );
    }

    #[test]
    fn zero_and_float_encodings_are_illegal() {
        assert!(expand(0x0000, Xlen::Bit64).is_err());
        // c.fld
        assert!(expand(0x2000, Xlen::Bit64).is_err());
        // c.ld is c.flw on rv32
        assert!(expand(0x6188, Xlen::Bit32).is_err());
        assert!(expand(0x6188, Xlen::Bit64).is_ok());
    }
}
