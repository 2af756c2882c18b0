//! SharedMemoryCache backend: POSIX shared memory, visible to every process
//! on the host. The metadata region lives inside the mapping itself so
//! `active_cnt` is a genuinely cross-process atomic word, not a per-process
//! one the way [`super::memory::MemoryBackend`]'s is.
//!
//! Backed by a file under `/dev/shm` rather than a dedicated shared-memory
//! crate: `memmap2` over a `/dev/shm` file is the same mechanism `shm_open`
//! + `mmap` gives in C, and keeps the dependency surface to what the rest
//! of the crate already uses for the filelock tier.

use crate::block::{BlockAddress, BlockEntry, BlockStatus};
use crate::error::{Error, Result};
use bytes::Bytes;
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use super::CacheBackend;

/// On-disk/on-shm layout of one slot's metadata header.
const HEADER_SIZE: usize = 32;

struct SlotHeader<'a> {
    file_index: &'a AtomicU32,
    block_index: &'a AtomicU32,
    status: &'a AtomicU8,
    prefetched: &'a AtomicU32,
    time_stamp: &'a AtomicU64,
    active_cnt: &'a AtomicU32,
}

/// Reconstruct atomic views into a `HEADER_SIZE`-byte window of the mapping.
/// Sound because each field's byte range is disjoint, correctly aligned by
/// construction (the region is allocated with `HEADER_SIZE`-aligned
/// strides), and `AtomicU32::from_ptr`/`AtomicU64::from_ptr` require only
/// that the bytes not be concurrently accessed as anything but the same
/// atomic type, which holds for this mapping's whole lifetime.
unsafe fn slot_header(base: *mut u8, slot: usize) -> SlotHeader<'static> {
    let ptr = base.add(slot * HEADER_SIZE);
    SlotHeader {
        file_index: AtomicU32::from_ptr(ptr.add(0) as *mut u32),
        block_index: AtomicU32::from_ptr(ptr.add(4) as *mut u32),
        status: AtomicU8::from_ptr(ptr.add(8) as *mut u8),
        prefetched: AtomicU32::from_ptr(ptr.add(12) as *mut u32),
        time_stamp: AtomicU64::from_ptr(ptr.add(16) as *mut u64),
        active_cnt: AtomicU32::from_ptr(ptr.add(24) as *mut u32),
    }
}

/// [`crate::block::BlockEntry`]-compatible view over one shared-memory slot.
///
/// `SharedMemoryBackend` does not use `BlockEntry` directly for the header
/// (that type's fields are process-local atomics); instead it exposes a
/// parallel, lazily-constructed `BlockEntry` snapshot for callers that want
/// the common status/active_cnt API, while the admission driver talks to
/// the raw shared header so cross-process writers see every update.
pub struct SharedMemoryBackend {
    name: String,
    block_size: u64,
    num_blocks: usize,
    _mmap: MmapMut,
    meta_ptr: *mut u8,
    data_ptr: *mut u8,
    local_entries: Vec<BlockEntry>,
    path: PathBuf,
}

// Safety: all interior mutability goes through atomics in the mapping or
// through `BlockEntry`'s own atomics; the raw pointers never alias a `&mut`.
unsafe impl Send for SharedMemoryBackend {}
unsafe impl Sync for SharedMemoryBackend {}

impl SharedMemoryBackend {
    /// Create or attach to the shared segment `/dev/shm/tazer-{name}`.
    pub fn create_or_open(name: impl Into<String>, num_blocks: usize, block_size: u64) -> Result<Self> {
        let name = name.into();
        let path = PathBuf::from(format!("/dev/shm/tazer-{}", name));
        let meta_size = num_blocks * HEADER_SIZE;
        let data_size = num_blocks * block_size as usize;
        let total = meta_size + data_size;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.set_len(total as u64)?;

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let meta_ptr = mmap.as_mut_ptr();
        let data_ptr = unsafe { meta_ptr.add(meta_size) };

        let local_entries = (0..num_blocks).map(|_| BlockEntry::empty()).collect();

        Ok(Self {
            name,
            block_size,
            num_blocks,
            _mmap: mmap,
            meta_ptr,
            data_ptr,
            local_entries,
            path,
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn header(&self, slot: usize) -> SlotHeader<'static> {
        unsafe { slot_header(self.meta_ptr, slot) }
    }

    /// Reconcile the process-local `BlockEntry` mirror with the shared
    /// header, so callers reading through [`CacheBackend::entry`] see
    /// updates another process made.
    fn sync_local(&self, slot: usize) {
        let h = self.header(slot);
        let entry = &self.local_entries[slot];
        let addr = BlockAddress::new(
            h.file_index.load(Ordering::Acquire),
            h.block_index.load(Ordering::Acquire),
        );
        match h.status.load(Ordering::Acquire) {
            2 if entry.status() != BlockStatus::Avail || entry.address() != addr => {
                entry.reserve(addr, h.time_stamp.load(Ordering::Relaxed), h.prefetched.load(Ordering::Relaxed));
                entry.publish(&self.name);
            }
            1 if entry.status() != BlockStatus::Reserved || entry.address() != addr => {
                entry.reserve(addr, h.time_stamp.load(Ordering::Relaxed), h.prefetched.load(Ordering::Relaxed));
            }
            0 => entry.clear(),
            _ => {}
        }
    }

    /// Scan for slots whose shared `active_cnt` was left non-zero by a
    /// process that is now gone, and reset them. Called once at startup.
    pub fn recover_orphaned_active_counts(&self, is_pid_alive: impl Fn(u32) -> bool) {
        for slot in 0..self.num_blocks {
            let h = self.header(slot);
            let owner_pid = h.active_cnt.load(Ordering::Acquire);
            if owner_pid != 0 && !is_pid_alive(owner_pid) {
                tracing::warn!(slot, owner_pid, "resetting orphaned active_cnt on recovery");
                h.active_cnt.store(0, Ordering::Release);
            }
        }
    }
}

impl CacheBackend for SharedMemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn entry(&self, slot: usize) -> &BlockEntry {
        self.sync_local(slot);
        &self.local_entries[slot]
    }

    fn get_block_data(&self, slot: usize) -> Result<Bytes> {
        let offset = slot * self.block_size as usize;
        let slice = unsafe { std::slice::from_raw_parts(self.data_ptr.add(offset), self.block_size as usize) };
        Ok(Bytes::copy_from_slice(slice))
    }

    fn set_block_data(&self, slot: usize, data: &[u8]) -> Result<()> {
        if data.len() as u64 > self.block_size {
            return Err(Error::Internal(format!(
                "block {} larger than configured block_size {}",
                data.len(),
                self.block_size
            )));
        }
        let offset = slot * self.block_size as usize;
        let dst = unsafe { std::slice::from_raw_parts_mut(self.data_ptr.add(offset), self.block_size as usize) };
        dst[..data.len()].copy_from_slice(data);
        Ok(())
    }
}
