//! MemoryCache backend: heap-allocated blocks, single process, multi-thread.

use crate::block::BlockEntry;
use crate::cache::backend::CacheBackend;
use crate::error::Result;
use bytes::Bytes;
use parking_lot::RwLock;

/// Heap-backed storage for one tier. `activeCnt` lives on [`BlockEntry`]
/// itself (a per-slot atomic), so concurrent readers never contend on the
/// block bytes, only on the bin lock guarding the header.
pub struct MemoryBackend {
    name: String,
    block_size: u64,
    entries: Vec<BlockEntry>,
    blocks: Vec<RwLock<Bytes>>,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>, num_blocks: usize, block_size: u64) -> Self {
        let entries = (0..num_blocks).map(|_| BlockEntry::empty()).collect();
        let blocks = (0..num_blocks).map(|_| RwLock::new(Bytes::new())).collect();
        Self {
            name: name.into(),
            block_size,
            entries,
            blocks,
        }
    }
}

impl CacheBackend for MemoryBackend {
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
        Ok(self.blocks[slot].read().clone())
    }

    fn set_block_data(&self, slot: usize, data: &[u8]) -> Result<()> {
        *self.blocks[slot].write() = Bytes::copy_from_slice(data);
        Ok(())
    }

    fn clean_up_block_data(&self, slot: usize) {
        *self.blocks[slot].write() = Bytes::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let backend = MemoryBackend::new("mem", 4, 64);
        backend.set_block_data(2, b"hello").unwrap();
        assert_eq!(backend.get_block_data(2).unwrap().as_ref(), b"hello");
        backend.clean_up_block_data(2);
        assert_eq!(backend.get_block_data(2).unwrap().len(), 0);
    }
}
