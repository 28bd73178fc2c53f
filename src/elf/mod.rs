use fnv::FnvHashMap;
use goblin::elf::{
    Elf,
    header::{self, ELFCLASS32, ELFCLASS64, ELFDATA2LSB, EM_RISCV, ET_DYN, ET_EXEC},
    program_header::PT_LOAD,
    sym::{STT_FUNC, STT_NOTYPE},
};
use thiserror::Error;
use tracing::debug;

use crate::cpu::Xlen;
use crate::mem::{DRAM_BASE, MemError, Memory};

/// Symbol name to address, filled once at load time.
pub type Symbols = FnvHashMap<String, u64>;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("malformed ELF: {0}")]
    Parse(#[from] goblin::error::Error),

    #[error("unsupported ELF class {0}")]
    UnsupportedClass(u8),

    #[error("expected little-endian ELF")]
    NotLittleEndian,

    #[error("expected RISC-V ELF, found machine type {0}")]
    WrongMachine(u16),

    #[error("unsupported ELF type {0} (want ET_EXEC or ET_DYN)")]
    UnsupportedType(u16),

    #[error("segment outside file: off=0x{offset:x} size=0x{size:x}")]
    SegmentOutsideFile { offset: u64, size: u64 },

    #[error("p_memsz smaller than p_filesz for segment at off=0x{0:x}")]
    SegmentSize(u64),

    #[error("segment outside RAM: [0x{start:x},0x{end:x}) not within [0x{ram_start:x},0x{ram_end:x})")]
    SegmentOutsideRam {
        start: u64,
        end: u64,
        ram_start: u64,
        ram_end: u64,
    },

    #[error("image of {size} bytes does not fit in {ram} bytes of RAM")]
    ImageTooLarge { size: u64, ram: u64 },

    #[error("device tree of {size} bytes does not fit the {max}-byte window")]
    DtbTooLarge { size: u64, max: u64 },

    #[error("memory write failed: {0}")]
    Mem(#[from] MemError),
}

/// What the loader learned from an ELF image.
#[derive(Debug)]
pub struct LoadedElf {
    pub entry: u64,
    pub symbols: Symbols,
    /// Address of `tohost` for self-checking test images.
    pub tohost: Option<u64>,
}

pub fn is_elf(bytes: &[u8]) -> bool {
    bytes.starts_with(b"\x7fELF")
}

/// Register width implied by the ELF class.
pub fn elf_xlen(bytes: &[u8]) -> Result<Xlen, LoadError> {
    let elf = Elf::parse(bytes)?;
    match elf.header.e_ident[header::EI_CLASS] {
        ELFCLASS32 => Ok(Xlen::Bit32),
        ELFCLASS64 => Ok(Xlen::Bit64),
        class => Err(LoadError::UnsupportedClass(class)),
    }
}

/// Copies every `PT_LOAD` segment of `bytes` to its physical address in `mem`
/// and zero-fills bss.
pub fn load_elf(bytes: &[u8], mem: &mut Memory) -> Result<LoadedElf, LoadError> {
    let elf = Elf::parse(bytes)?;

    // fail fast on inputs this machine cannot run
    let class = elf.header.e_ident[header::EI_CLASS];
    if class != ELFCLASS32 && class != ELFCLASS64 {
        return Err(LoadError::UnsupportedClass(class));
    }
    if elf.header.e_ident[header::EI_DATA] != ELFDATA2LSB {
        return Err(LoadError::NotLittleEndian);
    }
    if elf.header.e_machine != EM_RISCV {
        return Err(LoadError::WrongMachine(elf.header.e_machine));
    }
    if elf.header.e_type != ET_EXEC && elf.header.e_type != ET_DYN {
        return Err(LoadError::UnsupportedType(elf.header.e_type));
    }

    let ram_end = mem.end_addr();
    for ph in elf.program_headers.iter().filter(|ph| ph.p_type == PT_LOAD) {
        let (offset, file_size) = (ph.p_offset, ph.p_filesz);
        let file_end = offset
            .checked_add(file_size)
            .filter(|&end| end <= bytes.len() as u64)
            .ok_or(LoadError::SegmentOutsideFile {
                offset,
                size: file_size,
            })?;
        if ph.p_memsz < file_size {
            return Err(LoadError::SegmentSize(offset));
        }

        let start = ph.p_paddr;
        let end = start.checked_add(ph.p_memsz).unwrap_or(u64::MAX);
        if start < mem.base || end > ram_end {
            return Err(LoadError::SegmentOutsideRam {
                start,
                end,
                ram_start: mem.base,
                ram_end,
            });
        }

        mem.write_bytes(start, &bytes[offset as usize..file_end as usize])?;
        // p_memsz may be larger than p_filesz
        if ph.p_memsz > file_size {
            let zeros = vec![0u8; (ph.p_memsz - file_size) as usize];
            mem.write_bytes(start + file_size, &zeros)?;
        }
        debug!(
            start = format_args!("0x{start:x}"),
            size = ph.p_memsz,
            "segment loaded"
        );
    }

    let mut symbols = Symbols::default();
    let mut tohost = None;
    for sym in elf.syms.iter() {
        let Some(name) = elf.strtab.get_at(sym.st_name) else {
            continue;
        };
        if name == "tohost" {
            tohost = Some(sym.st_value);
        }
        if !name.is_empty() && matches!(sym.st_type(), STT_FUNC | STT_NOTYPE) {
            symbols.insert(name.to_string(), sym.st_value);
        }
    }

    Ok(LoadedElf {
        entry: elf.entry,
        symbols,
        tohost,
    })
}

/// Places a flat binary at the start of RAM. Returns the entry point.
pub fn load_raw(bytes: &[u8], mem: &mut Memory) -> Result<u64, LoadError> {
    if bytes.len() as u64 > mem.size() {
        return Err(LoadError::ImageTooLarge {
            size: bytes.len() as u64,
            ram: mem.size(),
        });
    }
    mem.write_bytes(DRAM_BASE, bytes)?;
    Ok(DRAM_BASE)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal ELF64 executable: one PT_LOAD of `code` at DRAM_BASE plus a
    /// symbol table holding `_start` and `tohost`.
    fn tiny_elf64(code: &[u8]) -> Vec<u8> {
        const EHDR: usize = 64;
        const PHDR: usize = 56;
        const SHDR: usize = 64;
        let code_off = EHDR + PHDR;
        let strtab = b"\0_start\0tohost\0.symtab\0.strtab\0";
        let strtab_off = code_off + code.len();
        let symtab_off = strtab_off + strtab.len();
        let sym = |name: u32, info: u8, value: u64| {
            let mut s = Vec::new();
            s.extend_from_slice(&name.to_le_bytes());
            s.push(info);
            s.push(0);
            s.extend_from_slice(&1u16.to_le_bytes());
            s.extend_from_slice(&value.to_le_bytes());
            s.extend_from_slice(&0u64.to_le_bytes());
            s
        };
        let mut symtab = vec![0u8; 24];
        symtab.extend(sym(1, 0x12, DRAM_BASE)); // GLOBAL FUNC
        symtab.extend(sym(8, 0x10, DRAM_BASE + 0x1000)); // GLOBAL NOTYPE
        let shoff = symtab_off + symtab.len();

        let mut out = Vec::new();
        out.extend_from_slice(b"\x7fELF");
        out.extend_from_slice(&[2, 1, 1, 0]);
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&ET_EXEC.to_le_bytes());
        out.extend_from_slice(&EM_RISCV.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&DRAM_BASE.to_le_bytes()); // e_entry
        out.extend_from_slice(&(EHDR as u64).to_le_bytes()); // e_phoff
        out.extend_from_slice(&(shoff as u64).to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(EHDR as u16).to_le_bytes());
        out.extend_from_slice(&(PHDR as u16).to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&(SHDR as u16).to_le_bytes());
        out.extend_from_slice(&3u16.to_le_bytes()); // null, symtab, strtab
        out.extend_from_slice(&0u16.to_le_bytes());

        // PT_LOAD, RWX, memsz larger than filesz
        out.extend_from_slice(&PT_LOAD.to_le_bytes());
        out.extend_from_slice(&7u32.to_le_bytes());
        out.extend_from_slice(&(code_off as u64).to_le_bytes());
        out.extend_from_slice(&DRAM_BASE.to_le_bytes());
        out.extend_from_slice(&DRAM_BASE.to_le_bytes());
        out.extend_from_slice(&(code.len() as u64).to_le_bytes());
        out.extend_from_slice(&(code.len() as u64 + 16).to_le_bytes());
        out.extend_from_slice(&0x1000u64.to_le_bytes());

        out.extend_from_slice(code);
        out.extend_from_slice(strtab);
        out.extend_from_slice(&symtab);

        let shdr = |name: u32, kind: u32, off: usize, size: usize, link: u32, entsize: u64| {
            let mut s = Vec::new();
            s.extend_from_slice(&name.to_le_bytes());
            s.extend_from_slice(&kind.to_le_bytes());
            s.extend_from_slice(&0u64.to_le_bytes());
            s.extend_from_slice(&0u64.to_le_bytes());
            s.extend_from_slice(&(off as u64).to_le_bytes());
            s.extend_from_slice(&(size as u64).to_le_bytes());
            s.extend_from_slice(&link.to_le_bytes());
            s.extend_from_slice(&1u32.to_le_bytes()); // first global symbol
            s.extend_from_slice(&8u64.to_le_bytes());
            s.extend_from_slice(&entsize.to_le_bytes());
            s
        };
        out.extend(vec![0u8; SHDR]);
        out.extend(shdr(15, 2, symtab_off, symtab.len(), 2, 24)); // SHT_SYMTAB
        out.extend(shdr(23, 3, strtab_off, strtab.len(), 0, 0)); // SHT_STRTAB
        out
    }

    #[test]
    fn loads_segments_and_symbols() {
        let code = [0x13, 0x05, 0x50, 0x00]; // addi a0, zero, 5
        let image = tiny_elf64(&code);
        assert!(is_elf(&image));
        assert_eq!(elf_xlen(&image).unwrap(), Xlen::Bit64);

        let mut mem = Memory::new(0x10_0000);
        mem.write_u32(DRAM_BASE + 4, 0xffff_ffff).unwrap();
        let loaded = load_elf(&image, &mut mem).unwrap();
        assert_eq!(loaded.entry, DRAM_BASE);
        assert_eq!(mem.read_u32(DRAM_BASE), Ok(0x0050_0513));
        // bss was zeroed
        assert_eq!(mem.read_u32(DRAM_BASE + 4), Ok(0));
        assert_eq!(loaded.symbols.get("_start"), Some(&DRAM_BASE));
        assert_eq!(loaded.tohost, Some(DRAM_BASE + 0x1000));
    }

    #[test]
    fn segment_outside_ram_is_rejected() {
        let image = tiny_elf64(&[0; 4]);
        let mut mem = Memory::new(8);
        assert!(matches!(
            load_elf(&image, &mut mem),
            Err(LoadError::SegmentOutsideRam { .. })
        ));
    }

    #[test]
    fn raw_images_start_at_dram_base() {
        let mut mem = Memory::new(16);
        assert_eq!(load_raw(&[1, 2, 3], &mut mem).unwrap(), DRAM_BASE);
        assert_eq!(mem.read_u8(DRAM_BASE + 2), Ok(3));
        assert!(matches!(
            load_raw(&[0; 17], &mut mem),
            Err(LoadError::ImageTooLarge { size: 17, ram: 16 })
        ));
        assert!(!is_elf(&[1, 2, 3]));
    }
}
