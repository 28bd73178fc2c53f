//! Software translation cache.
//!
//! Entries are keyed by `(vpn, access kind, effective privilege)` so a page
//! cached for loads never lets a store skip the walk that sets the dirty bit.
//! Leaf permission bits are kept alongside the physical page so hits can be
//! re-checked against the current `SUM`/`MXR` settings.

use fnv::FnvHashMap;

use crate::csr::PrivMode;
use crate::mem::AccessKind;

/// Entries held before the whole cache is dropped.
pub const TLB_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    /// Physical page number of the 4 KiB page (superpages are split).
    pub ppn: u64,
    /// Low eight PTE bits of the leaf (V R W X U G A D).
    pub perms: u8,
}

type Key = (u64, AccessKind, PrivMode);

#[derive(Debug, Default)]
pub struct Tlb {
    entries: FnvHashMap<Key, TlbEntry>,
    hits: u64,
    misses: u64,
}

impl Tlb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&mut self, vpn: u64, kind: AccessKind, priv_mode: PrivMode) -> Option<TlbEntry> {
        let entry = self.entries.get(&(vpn, kind, priv_mode)).copied();
        if entry.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        entry
    }

    pub fn insert(&mut self, vpn: u64, kind: AccessKind, priv_mode: PrivMode, entry: TlbEntry) {
        if self.entries.len() >= TLB_CAPACITY {
            self.entries.clear();
        }
        self.entries.insert((vpn, kind, priv_mode), entry);
    }

    pub fn flush(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(hits, misses)` since construction.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}
