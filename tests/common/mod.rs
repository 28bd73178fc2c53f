//! Hand assembler and machine setup shared by the integration tests.
#![allow(dead_code)]

use riscv_emu::csr::PrivMode;
use riscv_emu::mem::DRAM_BASE;
use riscv_emu::mmu::pte;
use riscv_emu::{Config, Emulator, Xlen};

pub const RAM_BYTES: usize = 0x20_0000;

// ABI register numbers used by the tests
pub const ZERO: u32 = 0;
pub const RA: u32 = 1;
pub const SP: u32 = 2;
pub const GP: u32 = 3;
pub const T0: u32 = 5;
pub const T1: u32 = 6;
pub const T2: u32 = 7;
pub const A0: u32 = 10;
pub const A1: u32 = 11;
pub const A2: u32 = 12;

const fn r_type(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    funct7 << 25 | rs2 << 20 | rs1 << 15 | funct3 << 12 | rd << 7 | opcode
}

const fn i_type(imm: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    ((imm as u32) & 0xfff) << 20 | rs1 << 15 | funct3 << 12 | rd << 7 | opcode
}

const fn s_type(imm: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
    let imm = imm as u32;
    (imm >> 5 & 0x7f) << 25 | rs2 << 20 | rs1 << 15 | funct3 << 12 | (imm & 0x1f) << 7 | 0x23
}

const fn b_type(off: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
    let off = off as u32;
    (off >> 12 & 1) << 31
        | (off >> 5 & 0x3f) << 25
        | rs2 << 20
        | rs1 << 15
        | funct3 << 12
        | (off >> 1 & 0xf) << 8
        | (off >> 11 & 1) << 7
        | 0x63
}

pub const fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 0b000, rd, 0x13)
}

pub const fn andi(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 0b111, rd, 0x13)
}

pub const fn add(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(0, rs2, rs1, 0b000, rd, 0x33)
}

pub const fn mul(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(1, rs2, rs1, 0b000, rd, 0x33)
}

pub const fn lui(rd: u32, imm20: u32) -> u32 {
    (imm20 & 0xf_ffff) << 12 | rd << 7 | 0x37
}

pub const fn lbu(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 0b100, rd, 0x03)
}

pub const fn lw(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 0b010, rd, 0x03)
}

pub const fn ld(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 0b011, rd, 0x03)
}

pub const fn sb(rs2: u32, rs1: u32, imm: i32) -> u32 {
    s_type(imm, rs2, rs1, 0b000)
}

pub const fn sw(rs2: u32, rs1: u32, imm: i32) -> u32 {
    s_type(imm, rs2, rs1, 0b010)
}

pub const fn sd(rs2: u32, rs1: u32, imm: i32) -> u32 {
    s_type(imm, rs2, rs1, 0b011)
}

pub const fn beq(rs1: u32, rs2: u32, off: i32) -> u32 {
    b_type(off, rs2, rs1, 0b000)
}

pub const fn bne(rs1: u32, rs2: u32, off: i32) -> u32 {
    b_type(off, rs2, rs1, 0b001)
}

pub const fn jal(rd: u32, off: i32) -> u32 {
    let off = off as u32;
    (off >> 20 & 1) << 31
        | (off >> 1 & 0x3ff) << 21
        | (off >> 11 & 1) << 20
        | (off >> 12 & 0xff) << 12
        | rd << 7
        | 0x6f
}

pub const fn csrrw(rd: u32, csr: u16, rs1: u32) -> u32 {
    i_type(csr as i32, rs1, 0b001, rd, 0x73)
}

pub const fn csrrs(rd: u32, csr: u16, rs1: u32) -> u32 {
    i_type(csr as i32, rs1, 0b010, rd, 0x73)
}

pub const ECALL: u32 = 0x0000_0073;
pub const MRET: u32 = 0x3020_0073;
pub const SRET: u32 = 0x1020_0073;

pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

pub fn emulator(words: &[u32], xlen: Xlen) -> Emulator {
    image_emulator(&words_to_bytes(words), xlen)
}

pub fn image_emulator(image: &[u8], xlen: Xlen) -> Emulator {
    let config = Config {
        ram_bytes: RAM_BYTES,
        ..Config::default()
    }
    .with_xlen(xlen);
    Emulator::new(&config, image).unwrap()
}

pub fn write_words(emu: &mut Emulator, addr: u64, words: &[u32]) {
    for (i, &word) in words.iter().enumerate() {
        emu.machine_mut()
            .bus
            .ram
            .write_u32(addr + 4 * i as u64, word)
            .unwrap();
    }
}

/// M-mode handler that skips the trapping instruction and returns.
pub const SKIP_HANDLER: [u32; 4] = [
    csrrs(T2, 0x341, ZERO),
    addi(T2, T2, 4),
    csrrw(ZERO, 0x341, T2),
    MRET,
];

pub const ROOT_TABLE: u64 = DRAM_BASE + 0x10_0000;
/// Virtual gigapage mapped read-only onto the start of RAM.
pub const RO_ALIAS: u64 = 0xc000_0000;
/// Virtual gigapage with no mapping.
pub const UNMAPPED: u64 = 0x4000_0000;

/// Sv39 with an identity RWX gigapage over RAM, a read-only alias of it at
/// `RO_ALIAS` and nothing at `UNMAPPED`. Leaves the hart in S-mode.
pub fn enter_sv39_supervisor(emu: &mut Emulator) {
    let m = emu.machine_mut();
    let ram_ppn = DRAM_BASE >> 12;
    let leaf = |perms: u64| ram_ppn << 10 | perms | pte::V | pte::A | pte::D;
    m.bus
        .ram
        .write_u64(ROOT_TABLE + 8 * (DRAM_BASE >> 30), leaf(pte::R | pte::W | pte::X))
        .unwrap();
    m.bus
        .ram
        .write_u64(ROOT_TABLE + 8 * (RO_ALIAS >> 30), leaf(pte::R))
        .unwrap();
    m.cpu.csrs.satp = 8 << 60 | ROOT_TABLE >> 12;
    m.cpu.csrs.priv_mode = PrivMode::Supervisor;
    m.mmu.flush();
}
