//! Flattened device tree generator for the built-in machine description.
//!
//! Produces a version 17 FDT blob describing RAM, the hart, and the devices at
//! their fixed addresses. The result is served from the read-only DTB window.

use fnv::FnvHashMap;

use super::{CLINT_BASE, CLINT_SIZE, PLIC_BASE, PLIC_SIZE, UART_BASE, UART_SIZE, VIRTIO_BASE, VIRTIO_SIZE};
use super::plic::{UART_IRQ, VIRTIO_IRQ};
use crate::cpu::Xlen;
use crate::mem::DRAM_BASE;

pub const FDT_MAGIC: u32 = 0xd00d_feed;
const FDT_VERSION: u32 = 17;
const FDT_LAST_COMP_VERSION: u32 = 16;

const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_END: u32 = 0x9;

const HEADER_SIZE: usize = 40;
// one terminating (0, 0) reservation entry
const RSVMAP_SIZE: usize = 16;

const CPU_INTC_PHANDLE: u32 = 1;
const PLIC_PHANDLE: u32 = 2;

// IRQ numbers on the hart-local controller
const IRQ_M_SOFT: u32 = 3;
const IRQ_M_TIMER: u32 = 7;
const IRQ_S_EXT: u32 = 9;
const IRQ_M_EXT: u32 = 11;

const TIMEBASE_FREQUENCY: u32 = 10_000_000;

#[derive(Debug, Clone)]
pub struct FdtParams<'a> {
    pub ram_size: u64,
    pub xlen: Xlen,
    pub bootargs: &'a str,
}

#[derive(Default)]
struct FdtWriter {
    structure: Vec<u8>,
    strings: Vec<u8>,
    string_offsets: FnvHashMap<&'static str, u32>,
}

impl FdtWriter {
    fn token(&mut self, token: u32) {
        self.structure.extend_from_slice(&token.to_be_bytes());
    }

    fn align(&mut self) {
        while self.structure.len() % 4 != 0 {
            self.structure.push(0);
        }
    }

    fn begin_node(&mut self, name: &str) {
        self.token(FDT_BEGIN_NODE);
        self.structure.extend_from_slice(name.as_bytes());
        self.structure.push(0);
        self.align();
    }

    fn end_node(&mut self) {
        self.token(FDT_END_NODE);
    }

    fn name_offset(&mut self, name: &'static str) -> u32 {
        if let Some(&off) = self.string_offsets.get(name) {
            return off;
        }
        let off = self.strings.len() as u32;
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        self.string_offsets.insert(name, off);
        off
    }

    fn prop(&mut self, name: &'static str, value: &[u8]) {
        let nameoff = self.name_offset(name);
        self.token(FDT_PROP);
        self.structure.extend_from_slice(&(value.len() as u32).to_be_bytes());
        self.structure.extend_from_slice(&nameoff.to_be_bytes());
        self.structure.extend_from_slice(value);
        self.align();
    }

    fn prop_empty(&mut self, name: &'static str) {
        self.prop(name, &[]);
    }

    fn prop_u32(&mut self, name: &'static str, value: u32) {
        self.prop(name, &value.to_be_bytes());
    }

    fn prop_cells(&mut self, name: &'static str, cells: &[u32]) {
        let bytes: Vec<u8> = cells.iter().flat_map(|c| c.to_be_bytes()).collect();
        self.prop(name, &bytes);
    }

    /// `<addr-hi addr-lo size-hi size-lo>` with two address and size cells.
    fn prop_reg(&mut self, base: u64, size: u64) {
        self.prop_cells(
            "reg",
            &[(base >> 32) as u32, base as u32, (size >> 32) as u32, size as u32],
        );
    }

    fn prop_str(&mut self, name: &'static str, value: &str) {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.prop(name, &bytes);
    }

    /// Null-separated string list, e.g. `compatible`.
    fn prop_strs(&mut self, name: &'static str, values: &[&str]) {
        let mut bytes = Vec::new();
        for value in values {
            bytes.extend_from_slice(value.as_bytes());
            bytes.push(0);
        }
        self.prop(name, &bytes);
    }

    fn finish(mut self) -> Vec<u8> {
        self.token(FDT_END);

        let off_rsvmap = HEADER_SIZE;
        let off_struct = off_rsvmap + RSVMAP_SIZE;
        let off_strings = off_struct + self.structure.len();
        let total = off_strings + self.strings.len();

        let header = [
            FDT_MAGIC,
            total as u32,
            off_struct as u32,
            off_strings as u32,
            off_rsvmap as u32,
            FDT_VERSION,
            FDT_LAST_COMP_VERSION,
            0, // boot_cpuid_phys
            self.strings.len() as u32,
            self.structure.len() as u32,
        ];

        let mut blob = Vec::with_capacity(total);
        for word in header {
            blob.extend_from_slice(&word.to_be_bytes());
        }
        blob.extend_from_slice(&[0; RSVMAP_SIZE]);
        blob.extend_from_slice(&self.structure);
        blob.extend_from_slice(&self.strings);
        blob
    }
}

/// Builds the device tree describing this machine.
pub fn build(params: &FdtParams<'_>) -> Vec<u8> {
    let (isa, mmu_type) = match params.xlen {
        Xlen::Bit32 => ("rv32imacsu", "riscv,sv32"),
        Xlen::Bit64 => ("rv64imacsu", "riscv,sv39"),
    };

    let mut fdt = FdtWriter::default();
    fdt.begin_node("");
    fdt.prop_u32("#address-cells", 2);
    fdt.prop_u32("#size-cells", 2);
    fdt.prop_str("compatible", "riscv-virtio");
    fdt.prop_str("model", "riscv-virtio,qemu");

    fdt.begin_node("chosen");
    fdt.prop_str("bootargs", params.bootargs);
    fdt.prop_str("stdout-path", "/soc/uart@10000000");
    fdt.end_node();

    fdt.begin_node(&format!("memory@{DRAM_BASE:x}"));
    fdt.prop_str("device_type", "memory");
    fdt.prop_reg(DRAM_BASE, params.ram_size);
    fdt.end_node();

    fdt.begin_node("cpus");
    fdt.prop_u32("#address-cells", 1);
    fdt.prop_u32("#size-cells", 0);
    fdt.prop_u32("timebase-frequency", TIMEBASE_FREQUENCY);
    fdt.begin_node("cpu@0");
    fdt.prop_str("device_type", "cpu");
    fdt.prop_u32("reg", 0);
    fdt.prop_str("status", "okay");
    fdt.prop_str("compatible", "riscv");
    fdt.prop_str("riscv,isa", isa);
    fdt.prop_str("mmu-type", mmu_type);
    fdt.begin_node("interrupt-controller");
    fdt.prop_u32("#interrupt-cells", 1);
    fdt.prop_empty("interrupt-controller");
    fdt.prop_str("compatible", "riscv,cpu-intc");
    fdt.prop_u32("phandle", CPU_INTC_PHANDLE);
    fdt.end_node();
    fdt.end_node();
    fdt.end_node();

    fdt.begin_node("soc");
    fdt.prop_u32("#address-cells", 2);
    fdt.prop_u32("#size-cells", 2);
    fdt.prop_strs("compatible", &["simple-bus"]);
    fdt.prop_empty("ranges");

    fdt.begin_node(&format!("uart@{UART_BASE:x}"));
    fdt.prop_u32("interrupts", UART_IRQ);
    fdt.prop_u32("interrupt-parent", PLIC_PHANDLE);
    fdt.prop_u32("clock-frequency", 0x0038_4000);
    fdt.prop_reg(UART_BASE, UART_SIZE);
    fdt.prop_str("compatible", "ns16550a");
    fdt.end_node();

    fdt.begin_node(&format!("virtio_mmio@{VIRTIO_BASE:x}"));
    fdt.prop_u32("interrupts", VIRTIO_IRQ);
    fdt.prop_u32("interrupt-parent", PLIC_PHANDLE);
    fdt.prop_reg(VIRTIO_BASE, VIRTIO_SIZE);
    fdt.prop_str("compatible", "virtio,mmio");
    fdt.end_node();

    fdt.begin_node(&format!("plic@{PLIC_BASE:x}"));
    fdt.prop_u32("phandle", PLIC_PHANDLE);
    fdt.prop_u32("riscv,ndev", 31);
    fdt.prop_reg(PLIC_BASE, PLIC_SIZE);
    fdt.prop_cells(
        "interrupts-extended",
        &[CPU_INTC_PHANDLE, IRQ_M_EXT, CPU_INTC_PHANDLE, IRQ_S_EXT],
    );
    fdt.prop_empty("interrupt-controller");
    fdt.prop_strs("compatible", &["sifive,plic-1.0.0", "riscv,plic0"]);
    fdt.prop_u32("#interrupt-cells", 1);
    fdt.prop_u32("#address-cells", 0);
    fdt.end_node();

    fdt.begin_node(&format!("clint@{CLINT_BASE:x}"));
    fdt.prop_cells(
        "interrupts-extended",
        &[CPU_INTC_PHANDLE, IRQ_M_SOFT, CPU_INTC_PHANDLE, IRQ_M_TIMER],
    );
    fdt.prop_reg(CLINT_BASE, CLINT_SIZE);
    fdt.prop_strs("compatible", &["sifive,clint0", "riscv,clint0"]);
    fdt.end_node();

    fdt.end_node(); // soc
    fdt.end_node(); // root

    fdt.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DTB_SIZE;

    fn be32(blob: &[u8], at: usize) -> u32 {
        u32::from_be_bytes([blob[at], blob[at + 1], blob[at + 2], blob[at + 3]])
    }

    fn params(xlen: Xlen) -> FdtParams<'static> {
        FdtParams {
            ram_size: 128 << 20,
            xlen,
            bootargs: "console=ttyS0 root=/dev/vda rw",
        }
    }

    #[test]
    fn header_is_well_formed() {
        let blob = build(&params(Xlen::Bit64));
        assert_eq!(be32(&blob, 0), FDT_MAGIC);
        assert_eq!(be32(&blob, 4) as usize, blob.len());
        assert_eq!(be32(&blob, 20), 17);
        let off_struct = be32(&blob, 8) as usize;
        let off_strings = be32(&blob, 12) as usize;
        assert_eq!(be32(&blob, off_struct), FDT_BEGIN_NODE);
        assert_eq!(be32(&blob, off_strings - 4), FDT_END);
        assert_eq!(off_strings + be32(&blob, 32) as usize, blob.len());
    }

    #[test]
    fn fits_in_the_dtb_window() {
        for xlen in [Xlen::Bit32, Xlen::Bit64] {
            assert!(build(&params(xlen)).len() as u64 <= DTB_SIZE);
        }
    }

    #[test]
    fn describes_isa_and_mmu() {
        let blob = build(&params(Xlen::Bit32));
        let text = String::from_utf8_lossy(&blob);
        assert!(text.contains("rv32imacsu"));
        assert!(text.contains("riscv,sv32"));
        assert!(text.contains("console=ttyS0"));
    }
}
