//! Capability interface concrete tiers implement (§9 design notes)
//!
//! `BoundedCache` is generic over a `CacheBackend`: the admission/eviction
//! algorithm is identical across heap, shared-memory, local-file and
//! filelock storage, so it is written once against this trait and each
//! tier only supplies the storage hooks.

pub mod filelock;
pub mod local_file;
pub mod memory;
pub mod shared_memory;

pub use filelock::FilelockBackend;
pub use local_file::LocalFileBackend;
pub use memory::MemoryBackend;
pub use shared_memory::SharedMemoryBackend;

use crate::block::BlockEntry;
use crate::error::Result;
use bytes::Bytes;

/// Storage hooks a concrete tier must provide. The bin-lock/admission
/// machinery in [`crate::cache::bounded::BoundedCache`] is the same for
/// every implementor.
pub trait CacheBackend: Send + Sync {
    /// Short name used for `origCache` stamping and stats/logging.
    fn name(&self) -> &str;

    fn num_blocks(&self) -> usize;

    fn block_size(&self) -> u64;

    /// Metadata header for `slot`. Slots are `0..num_blocks()`.
    fn entry(&self, slot: usize) -> &BlockEntry;

    fn get_block_data(&self, slot: usize) -> Result<Bytes>;

    fn set_block_data(&self, slot: usize, data: &[u8]) -> Result<()>;

    /// Publish a just-written slot's metadata to whatever makes this tier
    /// visible outside this process, if anything does. Called once per
    /// successful `write_block` install. Shared-memory and in-process
    /// backends need nothing here — their metadata already lives somewhere
    /// every reader sees it; the filelock backend is the one that needs an
    /// explicit push to the shared file.
    fn commit(&self, _slot: usize) -> Result<()> {
        Ok(())
    }

    /// Release whatever resource `get_block_data` may have held open.
    /// Most backends are no-ops; filelock-backed tiers may need it to
    /// unmap or close a handle.
    fn clean_up_block_data(&self, _slot: usize) {}
}
