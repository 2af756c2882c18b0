//! LocalFileCache backend: one regular file per block plus a small sidecar
//! metadata file, all under a process-private directory. Slower than
//! [`super::memory::MemoryBackend`] but survives the process restarting
//! (unlike memory) without the cross-process visibility (or crash-recovery
//! burden) of [`super::shared_memory::SharedMemoryBackend`].

use crate::block::{BlockAddress, BlockEntry, BlockStatus};
use crate::error::Result;
use bytes::Bytes;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use super::CacheBackend;

/// Sidecar metadata, one line of `file_index block_index status prefetched timestamp`.
fn meta_line(entry: &BlockEntry) -> String {
    let addr = entry.address();
    format!(
        "{} {} {} {} {}\n",
        addr.file_index.0,
        addr.block_index.0,
        entry.status() as u8,
        entry.prefetched(),
        entry.time_stamp()
    )
}

pub struct LocalFileBackend {
    name: String,
    block_size: u64,
    dir: PathBuf,
    entries: Vec<BlockEntry>,
}

impl LocalFileBackend {
    /// Create the backing directory (if absent) and restore whatever
    /// metadata a prior run of this process family left behind.
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>, num_blocks: usize, block_size: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let entries: Vec<BlockEntry> = (0..num_blocks).map(|_| BlockEntry::empty()).collect();

        let backend = Self {
            name: name.into(),
            block_size,
            dir,
            entries,
        };
        backend.restore()?;
        Ok(backend)
    }

    fn meta_path(&self, slot: usize) -> PathBuf {
        self.dir.join(format!("slot-{}.meta", slot))
    }

    fn data_path(&self, slot: usize) -> PathBuf {
        self.dir.join(format!("slot-{}.data", slot))
    }

    fn restore(&self) -> Result<()> {
        for slot in 0..self.entries.len() {
            let path = self.meta_path(slot);
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(&path)?;
            let mut parts = raw.trim().split_whitespace();
            let (Some(f), Some(b), Some(s), Some(p), Some(t)) =
                (parts.next(), parts.next(), parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let status: u8 = s.parse().unwrap_or(0);
            if status == 0 {
                continue;
            }
            let addr = BlockAddress::new(f.parse().unwrap_or(0), b.parse().unwrap_or(0));
            self.entries[slot].reserve(addr, t.parse().unwrap_or(0), p.parse().unwrap_or(0));
            if status == BlockStatus::Avail as u8 {
                self.entries[slot].publish(&self.name);
            }
        }
        Ok(())
    }

    fn write_meta(&self, slot: usize) -> Result<()> {
        let mut f = fs::File::create(self.meta_path(slot))?;
        f.write_all(meta_line(&self.entries[slot]).as_bytes())?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl CacheBackend for LocalFileBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_blocks(&self) -> usize {
        self.entries.len()
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn entry(&self, slot: usize) -> &BlockEntry {
        &self.entries[slot]
    }

    fn get_block_data(&self, slot: usize) -> Result<Bytes> {
        let mut buf = Vec::new();
        fs::File::open(self.data_path(slot))?.read_to_end(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn set_block_data(&self, slot: usize, data: &[u8]) -> Result<()> {
        fs::File::create(self.data_path(slot))?.write_all(data)?;
        self.write_meta(slot)?;
        Ok(())
    }

    fn clean_up_block_data(&self, slot: usize) {
        let _ = fs::remove_file(self.data_path(slot));
        let _ = fs::remove_file(self.meta_path(slot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_roundtrip_and_restore() {
        let dir = tempdir().unwrap();
        {
            let backend = LocalFileBackend::new("local", dir.path(), 2, 64).unwrap();
            let addr = BlockAddress::new(5, 6);
            backend.entry(0).reserve(addr, 42, 0);
            backend.set_block_data(0, b"persisted").unwrap();
            backend.entry(0).publish("local");
            backend.write_meta(0).unwrap();
        }

        let restored = LocalFileBackend::new("local", dir.path(), 2, 64).unwrap();
        assert_eq!(restored.entry(0).status(), BlockStatus::Avail);
        assert_eq!(restored.get_block_data(0).unwrap().as_ref(), b"persisted");
    }

    #[test]
    fn test_clean_up_removes_files() {
        let dir = tempdir().unwrap();
        let backend = LocalFileBackend::new("local", dir.path(), 1, 64).unwrap();
        backend.set_block_data(0, b"x").unwrap();
        backend.clean_up_block_data(0);
        assert!(!backend.data_path(0).exists());
        assert!(!backend.meta_path(0).exists());
    }
}
