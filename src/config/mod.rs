use crate::cpu::Xlen;

pub const DEFAULT_RAM_BYTES: usize = 128 * 1024 * 1024;
pub const DEFAULT_BOOTARGS: &str = "console=ttyS0 root=/dev/vda rw";

/// Everything needed to build an [`Emulator`](crate::emulator::Emulator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub ram_bytes: usize,
    /// Forces the register width. `None` takes it from the ELF class, or
    /// RV64 for raw images.
    pub xlen: Option<Xlen>,
    /// Translation cache on or off. Results are identical either way.
    pub page_cache: bool,
    /// `/chosen/bootargs` in the generated device tree.
    pub bootargs: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ram_bytes: DEFAULT_RAM_BYTES,
            xlen: None,
            page_cache: true,
            bootargs: DEFAULT_BOOTARGS.to_string(),
        }
    }
}

impl Config {
    pub fn with_ram_mib(mut self, mib: usize) -> Self {
        self.ram_bytes = mib * 1024 * 1024;
        self
    }

    pub fn with_xlen(mut self, xlen: Xlen) -> Self {
        self.xlen = Some(xlen);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.ram_bytes, 128 << 20);
        assert_eq!(config.xlen, None);
        assert!(config.page_cache);
        assert_eq!(Config::default().with_ram_mib(4).ram_bytes, 4 << 20);
    }
}
