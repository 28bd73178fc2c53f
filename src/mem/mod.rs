use thiserror::Error;

/// Physical address where guest RAM starts.
pub const DRAM_BASE: u64 = 0x8000_0000;

/// What a memory access is for. Translation and fault reporting both depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Fetch,
    Load,
    Store,
}

/// Access width in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    B = 1,
    H = 2,
    W = 4,
    D = 8,
}

impl Width {
    pub const fn bytes(self) -> u64 {
        self as u64
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    #[error("address out of range: 0x{0:x}")]
    Oob(u64),

    #[error("{kind:?} access fault at 0x{addr:x}")]
    AccessFault { kind: AccessKind, addr: u64 },

    #[error("{kind:?} page fault at 0x{addr:x}")]
    PageFault { kind: AccessKind, addr: u64 },
}

pub struct Memory {
    data: Vec<u8>,
    pub base: u64,
}

impl Memory {
    pub fn new(bytes: usize) -> Self {
        Self {
            data: vec![0; bytes],
            base: DRAM_BASE,
        }
    }

    fn check_oob(&self, addr: u64, size: u64) -> Result<usize, MemError> {
        let a = addr.checked_sub(self.base).ok_or(MemError::Oob(addr))?;
        let end = a.checked_add(size).ok_or(MemError::Oob(addr))?;
        if end > self.data.len() as u64 {
            return Err(MemError::Oob(addr));
        }
        Ok(a as usize)
    }

    /// True when `[addr, addr + size)` lies entirely inside RAM.
    pub fn contains(&self, addr: u64, size: u64) -> bool {
        self.check_oob(addr, size).is_ok()
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8, MemError> {
        let off = self.check_oob(addr, 1)?;
        Ok(self.data[off])
    }

    pub fn read_u16(&self, addr: u64) -> Result<u16, MemError> {
        // Misaligned accesses are allowed
        let off = self.check_oob(addr, 2)?;
        let b = &self.data[off..off + 2];
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, MemError> {
        let off = self.check_oob(addr, 4)?;
        let b = &self.data[off..off + 4];
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, MemError> {
        let off = self.check_oob(addr, 8)?;
        let b = &self.data[off..off + 8];
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn write_u8(&mut self, addr: u64, v: u8) -> Result<(), MemError> {
        let off = self.check_oob(addr, 1)?;
        self.data[off] = v;
        Ok(())
    }

    pub fn write_u16(&mut self, addr: u64, v: u16) -> Result<(), MemError> {
        let off = self.check_oob(addr, 2)?;
        self.data[off..off + 2].copy_from_slice(&v.to_le_bytes());
        Ok(())
    }

    pub fn write_u32(&mut self, addr: u64, v: u32) -> Result<(), MemError> {
        let off = self.check_oob(addr, 4)?;
        self.data[off..off + 4].copy_from_slice(&v.to_le_bytes());
        Ok(())
    }

    pub fn write_u64(&mut self, addr: u64, v: u64) -> Result<(), MemError> {
        let off = self.check_oob(addr, 8)?;
        self.data[off..off + 8].copy_from_slice(&v.to_le_bytes());
        Ok(())
    }

    /// Zero-extended load of `width` bytes.
    pub fn load(&self, addr: u64, width: Width) -> Result<u64, MemError> {
        match width {
            Width::B => self.read_u8(addr).map(u64::from),
            Width::H => self.read_u16(addr).map(u64::from),
            Width::W => self.read_u32(addr).map(u64::from),
            Width::D => self.read_u64(addr),
        }
    }

    /// Stores the low `width` bytes of `v`.
    pub fn store(&mut self, addr: u64, width: Width, v: u64) -> Result<(), MemError> {
        match width {
            Width::B => self.write_u8(addr, v as u8),
            Width::H => self.write_u16(addr, v as u16),
            Width::W => self.write_u32(addr, v as u32),
            Width::D => self.write_u64(addr, v),
        }
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> Result<&[u8], MemError> {
        let off = self.check_oob(addr, len as u64)?;
        Ok(&self.data[off..off + len])
    }

    pub fn write_bytes(&mut self, addr: u64, bytes: &[u8]) -> Result<(), MemError> {
        let off = self.check_oob(addr, bytes.len() as u64)?;
        self.data[off..off + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn end_addr(&self) -> u64 {
        self.base + self.data.len() as u64
    }
}
