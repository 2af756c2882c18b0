//! BoundedFilelockCache / FileCache backend: a single regular file shared by
//! every process in the family, metadata and data packed together per the
//! persisted layout (§6), with advisory `fcntl` byte-range locks standing in
//! for [`crate::binlock::BinLockTable`] across process boundaries.
//!
//! `activeCntBitset` is a 128-bit field; each active reader sets the bit at
//! `pid % 128` while it holds the block and clears it on release. That loses
//! precision when two readers from different processes collide on the same
//! bit, but it is enough to drive the crash-recovery sweep this backend runs
//! at startup: any bit with no live process at that residue is stale and
//! gets cleared.

use crate::block::{BlockAddress, BlockEntry, BlockStatus};
use crate::error::Result;
use bytes::Bytes;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use super::CacheBackend;

/// `sizeof(BlockEntryOnDisk)` per §6: fileIndex(4) blockIndex(4) status(1)
/// + pad(3) prefetched(4) timeStamp(8) + pad(8) activeCntBitset(16) origCache(32).
const ENTRY_SIZE: u64 = 80;
const OFF_FILE_INDEX: u64 = 0;
const OFF_BLOCK_INDEX: u64 = 4;
const OFF_STATUS: u64 = 8;
const OFF_PREFETCHED: u64 = 12;
const OFF_TIME_STAMP: u64 = 16;
const OFF_ACTIVE_BITSET: u64 = 32;
const OFF_ORIG_CACHE: u64 = 48;
const ORIG_CACHE_LEN: usize = 32;

fn lock_range(fd: i32, start: u64, len: u64, kind: libc::c_short) -> Result<()> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = start as libc::off_t;
    fl.l_len = len as libc::off_t;
    let rc = unsafe { libc::fcntl(fd, libc::F_SETLKW, &mut fl as *mut libc::flock) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// One bin's advisory write lock, covering `associativity` consecutive
/// metadata entries. Dropping releases it (`F_UNLCK`).
struct BinFileLock {
    fd: i32,
    start: u64,
    len: u64,
}

impl BinFileLock {
    fn acquire(file: &File, start: u64, len: u64) -> Result<Self> {
        lock_range(file.as_raw_fd(), start, len, libc::F_WRLCK as libc::c_short)?;
        Ok(Self {
            fd: file.as_raw_fd(),
            start,
            len,
        })
    }
}

impl Drop for BinFileLock {
    fn drop(&mut self) {
        let _ = lock_range(self.fd, self.start, self.len, libc::F_UNLCK as libc::c_short);
    }
}

pub struct FilelockBackend {
    name: String,
    block_size: u64,
    num_blocks: usize,
    associativity: usize,
    meta_size: u64,
    file: std::sync::Mutex<File>,
    path: PathBuf,
    local_entries: Vec<BlockEntry>,
}

impl FilelockBackend {
    pub fn open(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        num_blocks: usize,
        block_size: u64,
        associativity: usize,
    ) -> Result<Self> {
        let path = path.into();
        let meta_size = num_blocks as u64 * ENTRY_SIZE;
        let cache_size = num_blocks as u64 * block_size;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        if file.metadata()?.len() < meta_size + cache_size {
            file.set_len(meta_size + cache_size)?;
        }

        let backend = Self {
            name: name.into(),
            block_size,
            num_blocks,
            associativity: associativity.max(1),
            meta_size,
            file: std::sync::Mutex::new(file),
            path,
            local_entries: (0..num_blocks).map(|_| BlockEntry::empty()).collect(),
        };
        backend.reload_all()?;
        Ok(backend)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn bin_range(&self, slot: usize) -> (u64, u64) {
        let bin = slot / self.associativity;
        let start = bin as u64 * self.associativity as u64 * ENTRY_SIZE;
        (start, self.associativity as u64 * ENTRY_SIZE)
    }

    fn read_exact_at(file: &mut File, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::io::Read;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn load_entry(&self, file: &mut File, slot: usize) -> Result<()> {
        let base = slot as u64 * ENTRY_SIZE;
        let mut file_index = [0u8; 4];
        let mut block_index = [0u8; 4];
        let mut status = [0u8; 1];
        let mut prefetched = [0u8; 4];
        let mut time_stamp = [0u8; 8];

        Self::read_exact_at(file, base + OFF_FILE_INDEX, &mut file_index)?;
        Self::read_exact_at(file, base + OFF_BLOCK_INDEX, &mut block_index)?;
        Self::read_exact_at(file, base + OFF_STATUS, &mut status)?;
        Self::read_exact_at(file, base + OFF_PREFETCHED, &mut prefetched)?;
        Self::read_exact_at(file, base + OFF_TIME_STAMP, &mut time_stamp)?;

        let addr = BlockAddress::new(u32::from_le_bytes(file_index), u32::from_le_bytes(block_index));
        let entry = &self.local_entries[slot];
        match status[0] {
            s if s == BlockStatus::Reserved as u8 => {
                entry.reserve(addr, u64::from_le_bytes(time_stamp), u32::from_le_bytes(prefetched));
            }
            s if s == BlockStatus::Avail as u8 => {
                entry.reserve(addr, u64::from_le_bytes(time_stamp), u32::from_le_bytes(prefetched));
                entry.publish(&self.name);
            }
            _ => entry.clear(),
        }
        Ok(())
    }

    fn reload_all(&self) -> Result<()> {
        let mut file = self.file.lock().expect("filelock mutex poisoned");
        for slot in 0..self.num_blocks {
            self.load_entry(&mut file, slot)?;
        }
        Ok(())
    }

    fn store_entry(&self, file: &mut File, slot: usize) -> Result<()> {
        let base = slot as u64 * ENTRY_SIZE;
        let entry = &self.local_entries[slot];
        let addr = entry.address();

        file.seek(SeekFrom::Start(base + OFF_FILE_INDEX))?;
        file.write_all(&addr.file_index.0.to_le_bytes())?;
        file.seek(SeekFrom::Start(base + OFF_BLOCK_INDEX))?;
        file.write_all(&addr.block_index.0.to_le_bytes())?;
        file.seek(SeekFrom::Start(base + OFF_STATUS))?;
        file.write_all(&[entry.status() as u8])?;
        file.seek(SeekFrom::Start(base + OFF_PREFETCHED))?;
        file.write_all(&entry.prefetched().to_le_bytes())?;
        file.seek(SeekFrom::Start(base + OFF_TIME_STAMP))?;
        file.write_all(&entry.time_stamp().to_le_bytes())?;
        file.seek(SeekFrom::Start(base + OFF_ORIG_CACHE))?;
        let mut orig = [0u8; ORIG_CACHE_LEN];
        let name = entry.orig_cache();
        let bytes = name.as_bytes();
        let n = bytes.len().min(ORIG_CACHE_LEN);
        orig[..n].copy_from_slice(&bytes[..n]);
        file.write_all(&orig)?;
        Ok(())
    }

    /// Publish a reservation through to the shared file under the bin's
    /// advisory lock, so other processes observe it on their next reload.
    pub fn commit(&self, slot: usize) -> Result<()> {
        let (start, len) = self.bin_range(slot);
        let mut file = self.file.lock().expect("filelock mutex poisoned");
        let _lock = BinFileLock::acquire(&file, start, len)?;
        self.store_entry(&mut file, slot)?;
        Ok(())
    }

    /// Clear any bit in `activeCntBitset` whose residue has no live process,
    /// per process started by `is_pid_alive` over `0..128`. Run once at
    /// startup before this process begins serving requests.
    pub fn recover_stale_active_bits(&self, is_pid_alive: impl Fn(u32) -> bool) -> Result<()> {
        let live_residues: Vec<bool> = (0u32..128).map(is_pid_alive).collect();
        let mut file = self.file.lock().expect("filelock mutex poisoned");
        for slot in 0..self.num_blocks {
            let base = slot as u64 * ENTRY_SIZE;
            let mut bitset = [0u8; 16];
            Self::read_exact_at(&mut file, base + OFF_ACTIVE_BITSET, &mut bitset)?;
            let mut value = u128::from_le_bytes(bitset);
            if value == 0 {
                continue;
            }
            for bit in 0..128u32 {
                if value & (1 << bit) != 0 && !live_residues[bit as usize] {
                    value &= !(1 << bit);
                }
            }
            file.seek(SeekFrom::Start(base + OFF_ACTIVE_BITSET))?;
            file.write_all(&value.to_le_bytes())?;
        }
        Ok(())
    }
}

impl CacheBackend for FilelockBackend {
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
        &self.local_entries[slot]
    }

    fn get_block_data(&self, slot: usize) -> Result<Bytes> {
        let mut file = self.file.lock().expect("filelock mutex poisoned");
        let offset = self.meta_size + slot as u64 * self.block_size;
        let mut buf = vec![0u8; self.block_size as usize];
        Self::read_exact_at(&mut file, offset, &mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn set_block_data(&self, slot: usize, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock().expect("filelock mutex poisoned");
        let offset = self.meta_size + slot as u64 * self.block_size;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn commit(&self, slot: usize) -> Result<()> {
        FilelockBackend::commit(self, slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::bounded::{new_reads_table, BoundedCache};
    use tempfile::tempdir;

    /// `BoundedCache::write_block` must push the install through to the
    /// shared file on its own, without a test calling `commit` by hand — a
    /// second process opening the same path has to see it.
    #[tokio::test]
    async fn test_write_block_through_bounded_cache_is_visible_to_a_fresh_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.cache");
        let backend = FilelockBackend::open("filelock", &path, 4, 64, 2).unwrap();
        let cache = BoundedCache::new(backend, 2);
        let reads = new_reads_table();
        let addr = BlockAddress::new(7, 1);

        cache.request_block(addr, 0, &reads).await.unwrap();
        cache.write_block(addr, Bytes::from_static(b"cross-process"), &reads).await.unwrap();

        let reopened = FilelockBackend::open("filelock", &path, 4, 64, 2).unwrap();
        assert_eq!(reopened.entry(0).status(), BlockStatus::Avail);
        assert_eq!(reopened.entry(0).address(), addr);
    }

    #[test]
    fn test_commit_round_trips_through_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.cache");
        let backend = FilelockBackend::open("filelock", &path, 4, 64, 2).unwrap();

        let addr = BlockAddress::new(3, 9);
        backend.entry(0).reserve(addr, 55, 0);
        backend.entry(0).publish("filelock");
        backend.set_block_data(0, b"on disk").unwrap();
        backend.commit(0).unwrap();

        let reopened = FilelockBackend::open("filelock", &path, 4, 64, 2).unwrap();
        assert_eq!(reopened.entry(0).status(), BlockStatus::Avail);
        assert_eq!(reopened.entry(0).address(), addr);
        assert_eq!(reopened.get_block_data(0).unwrap()[..7].as_ref(), b"on disk");
    }
}
