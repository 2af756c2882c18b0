//! Block addressing and per-slot metadata
//!
//! `FileIndex` and `BlockIndex` each have a `NONE` sentinel (zero), but only
//! `FileIndex` actually reserves it: [`crate::register::FileCacheRegister`]
//! never hands out `0`, so `FileIndex::NONE` unambiguously means "no file".
//! `BlockIndex` zero is a legitimate first real block index — a
//! `BlockAddress` of all zeroes is not itself a marker for "this slot is
//! empty". That is tracked separately, by `BlockEntry`'s own `status` field
//! (`BlockStatus::Empty`). `BlockEntry` is the in-memory header describing
//! one slot in a tier, independent of where the slot's bytes actually live.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Stable 32-bit identifier for a file path within a process family.
///
/// Zero is reserved and never assigned by [`crate::register::FileCacheRegister`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileIndex(pub u32);

impl FileIndex {
    pub const NONE: FileIndex = FileIndex(0);

    #[inline]
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FileIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 32-bit index of a block within a file. Unlike [`FileIndex`], zero is a
/// real, legitimate first block — nothing in this crate avoids handing it
/// out. `NONE`/`is_none` exist for symmetry with `FileIndex`'s API, not
/// because a `BlockIndex` of zero actually means anything is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockIndex(pub u32);

impl BlockIndex {
    pub const NONE: BlockIndex = BlockIndex(0);

    #[inline]
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a cached block: which file, which block within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockAddress {
    pub file_index: FileIndex,
    pub block_index: BlockIndex,
}

impl BlockAddress {
    pub fn new(file_index: u32, block_index: u32) -> Self {
        Self {
            file_index: FileIndex(file_index),
            block_index: BlockIndex(block_index),
        }
    }

    /// 64-bit mix of the two 32-bit fields, used by a tier to choose its bin.
    /// The mix is local to the tier: different tiers need not agree.
    #[inline]
    pub fn hash_mix(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.file_index.0.hash(&mut hasher);
        self.block_index.0.hash(&mut hasher);
        hasher.finish()
    }

    /// Bin index within a tier of `num_bins` bins.
    #[inline]
    pub fn bin_index(&self, num_bins: usize) -> usize {
        debug_assert!(num_bins > 0);
        (self.hash_mix() as usize) % num_bins
    }
}

impl fmt::Display for BlockAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(f={}, b={})", self.file_index, self.block_index)
    }
}

/// Lifecycle state of a [`BlockEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockStatus {
    /// Slot holds no identity, free to claim.
    Empty = 0,
    /// Slot holds an identity but no data yet; readers must wait.
    Reserved = 1,
    /// Slot holds valid data.
    Avail = 2,
}

impl BlockStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => BlockStatus::Empty,
            1 => BlockStatus::Reserved,
            _ => BlockStatus::Avail,
        }
    }
}

/// Per-slot metadata, shared by every concrete tier's admission driver.
///
/// Fields are atomics so a reader holding only the bin *reader* lock can
/// still bump `active_cnt` (I4) without upgrading to a writer lock.
pub struct BlockEntry {
    file_index: AtomicU32,
    block_index: AtomicU32,
    status: AtomicU8,
    time_stamp: AtomicU64,
    /// 0 = demand fetch, >0 = speculative distance-to-consumer.
    prefetched: AtomicU32,
    active_cnt: AtomicU32,
    orig_cache: parking_lot::Mutex<String>,
}

impl BlockEntry {
    pub fn empty() -> Self {
        Self {
            file_index: AtomicU32::new(0),
            block_index: AtomicU32::new(0),
            status: AtomicU8::new(BlockStatus::Empty as u8),
            time_stamp: AtomicU64::new(0),
            prefetched: AtomicU32::new(0),
            active_cnt: AtomicU32::new(0),
            orig_cache: parking_lot::Mutex::new(String::new()),
        }
    }

    pub fn status(&self) -> BlockStatus {
        BlockStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn address(&self) -> BlockAddress {
        BlockAddress {
            file_index: FileIndex(self.file_index.load(Ordering::Relaxed)),
            block_index: BlockIndex(self.block_index.load(Ordering::Relaxed)),
        }
    }

    pub fn matches(&self, addr: BlockAddress) -> bool {
        self.status() != BlockStatus::Empty && self.address() == addr
    }

    pub fn time_stamp(&self) -> u64 {
        self.time_stamp.load(Ordering::Relaxed)
    }

    pub fn prefetched(&self) -> u32 {
        self.prefetched.load(Ordering::Relaxed)
    }

    pub fn active_cnt(&self) -> u32 {
        self.active_cnt.load(Ordering::Acquire)
    }

    pub fn orig_cache(&self) -> String {
        self.orig_cache.lock().clone()
    }

    /// Publish a fresh reservation for `addr`. Caller must hold the bin writer lock.
    pub fn reserve(&self, addr: BlockAddress, now: u64, prefetched: u32) {
        self.file_index.store(addr.file_index.0, Ordering::Relaxed);
        self.block_index.store(addr.block_index.0, Ordering::Relaxed);
        self.prefetched.store(prefetched, Ordering::Relaxed);
        self.time_stamp.store(now, Ordering::Relaxed);
        self.active_cnt.store(0, Ordering::Relaxed);
        self.status.store(BlockStatus::Reserved as u8, Ordering::Release);
    }

    /// Transition RESERVED -> AVAIL. Caller must hold the bin writer lock.
    pub fn publish(&self, orig_cache: &str) {
        *self.orig_cache.lock() = orig_cache.to_string();
        self.status.store(BlockStatus::Avail as u8, Ordering::Release);
    }

    /// Transition -> EMPTY and clear identity. Caller must hold the bin writer lock.
    pub fn clear(&self) {
        self.file_index.store(0, Ordering::Relaxed);
        self.block_index.store(0, Ordering::Relaxed);
        self.prefetched.store(0, Ordering::Relaxed);
        self.active_cnt.store(0, Ordering::Relaxed);
        self.status.store(BlockStatus::Empty as u8, Ordering::Release);
    }

    /// I4: increment only while holding the bin reader lock and AVAIL+matching.
    pub fn inc_active(&self) -> u32 {
        self.active_cnt.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Release one reader's hold. Returns the new count.
    pub fn dec_active(&self) -> u32 {
        self.active_cnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_sub(1))
            })
            .unwrap_or(0)
            .saturating_sub(1)
    }

    /// Whether this slot is a legal eviction victim: no active readers.
    pub fn evictable(&self) -> bool {
        self.active_cnt() == 0
    }
}

impl Default for BlockEntry {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for BlockEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockEntry")
            .field("addr", &self.address())
            .field("status", &self.status())
            .field("time_stamp", &self.time_stamp())
            .field("prefetched", &self.prefetched())
            .field("active_cnt", &self.active_cnt())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_is_none_for_both_index_types() {
        let addr = BlockAddress::new(0, 0);
        assert!(addr.file_index.is_none());
        assert!(addr.block_index.is_none());
    }

    #[test]
    fn test_zero_block_index_is_a_real_address_once_a_file_has_an_identity() {
        // A file's first block is index 0; emptiness lives in BlockEntry's
        // status, not in the address value.
        let addr = BlockAddress::new(3, 0);
        assert!(!addr.file_index.is_none());
        assert!(addr.block_index.is_none());

        let entry = BlockEntry::empty();
        assert_eq!(entry.status(), BlockStatus::Empty);
        entry.reserve(addr, 0, 0);
        entry.publish("l1-mem");
        assert!(entry.matches(addr));
        assert_eq!(entry.status(), BlockStatus::Avail);
    }

    #[test]
    fn test_bin_index_in_range() {
        let addr = BlockAddress::new(7, 19);
        for num_bins in [1usize, 2, 7, 64] {
            assert!(addr.bin_index(num_bins) < num_bins);
        }
    }

    #[test]
    fn test_entry_lifecycle() {
        let entry = BlockEntry::empty();
        assert_eq!(entry.status(), BlockStatus::Empty);

        let addr = BlockAddress::new(1, 2);
        entry.reserve(addr, 100, 0);
        assert_eq!(entry.status(), BlockStatus::Reserved);
        assert!(entry.matches(addr));

        entry.publish("l1-mem");
        assert_eq!(entry.status(), BlockStatus::Avail);
        assert_eq!(entry.orig_cache(), "l1-mem");

        assert_eq!(entry.inc_active(), 1);
        assert_eq!(entry.inc_active(), 2);
        assert!(!entry.evictable());
        assert_eq!(entry.dec_active(), 1);
        assert_eq!(entry.dec_active(), 0);
        assert!(entry.evictable());

        entry.clear();
        assert_eq!(entry.status(), BlockStatus::Empty);
        assert!(!entry.matches(addr));
    }
}
