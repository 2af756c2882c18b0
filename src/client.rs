//! Client library surface (C13)
//!
//! What an embedding application — or `tazer-server get`'s demonstration
//! subcommand — drives: open a remote path, learn its size, and read byte
//! ranges through a local `CacheHierarchy` terminated by a `NetworkCache`.

use crate::block::{BlockAddress, FileIndex};
use crate::cache::backend::memory::MemoryBackend;
use crate::cache::bounded::BoundedCache;
use crate::cache::hierarchy::{CacheHierarchy, HierarchyTier};
use crate::cache::metrics::{CacheMetrics, CacheStatsSnapshot};
use crate::cache::network::{ConnectionPool, NetworkCache};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::pool::PriorityThreadPool;
use crate::register::FileCacheRegister;
use crate::request::{InFlightReads, SharedInFlightReads};
use crate::wire::Message;
use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;
use std::sync::Arc;

/// Which blocks cover byte range `[offset, offset + len)` at `block_size`.
/// Returns `(first_block, block_count)`.
fn covering_blocks(offset: u64, len: u64, block_size: u64) -> (u64, u64) {
    if len == 0 {
        return (offset / block_size, 0);
    }
    let first = offset / block_size;
    let last = (offset + len - 1) / block_size;
    (first, last - first + 1)
}

/// An open remote file, read through the client-side hierarchy.
pub struct ClientSession {
    path: String,
    file_index: FileIndex,
    size: u64,
    block_size: u64,
    hierarchy: CacheHierarchy,
    reads: SharedInFlightReads,
    metrics: CacheMetrics,
}

impl ClientSession {
    /// Open `path` against the server pool named in `config`, sizing the
    /// local tiers and terminal `NetworkCache` from `config`.
    pub async fn open(path: &str, config: &ClientConfig) -> Result<Self> {
        let connections_text = tokio::fs::read_to_string(&config.server_connections_path).await?;
        let pool = ConnectionPool::from_connections_json(&connections_text)?;
        if pool.is_empty() {
            return Err(Error::Unavailable { path: path.to_string() });
        }

        let size = probe_size(&pool, path).await?;

        let register = FileCacheRegister::new();
        let file_index = register.register(path)?;

        let mut tiers: Vec<Box<dyn HierarchyTier>> = Vec::new();
        if config.client_cache_size > 0 {
            let num_blocks = (config.client_cache_size / config.client_block_size.max(1)).max(1) as usize;
            let backend = MemoryBackend::new("client-mem", num_blocks, config.client_block_size);
            tiers.push(Box::new(BoundedCache::new(backend, config.client_associativity)));
        }

        let origin: Option<Box<dyn crate::cache::hierarchy::Origin>> = if config.use_server_network_cache {
            let transfer_pool = PriorityThreadPool::new("client-transfer", config.num_client_trans_threads);
            let decompress_pool = PriorityThreadPool::new("client-decompress", config.num_client_decomp_threads);
            Some(Box::new(NetworkCache::new(
                "network",
                pool,
                transfer_pool,
                decompress_pool,
                config.client_block_size,
                config.max_retries,
            )))
        } else {
            None
        };

        let hierarchy = CacheHierarchy::new(tiers, origin);

        Ok(Self {
            path: path.to_string(),
            file_index,
            size,
            block_size: config.client_block_size,
            hierarchy,
            reads: Arc::new(InFlightReads::new()),
            metrics: CacheMetrics::new(),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Per-tier hit/miss counters accumulated over this session's reads.
    pub fn metrics_snapshot(&self) -> CacheStatsSnapshot {
        self.metrics.snapshot()
    }

    async fn read_block(&self, blk: u64) -> Result<Bytes> {
        let addr = BlockAddress::new(self.file_index.0, blk as u32);
        let delivered = self.hierarchy.request_block(&self.path, addr, 0, &self.reads).await?;
        match &delivered.hit_tier {
            Some(hit_tier) => self.metrics.tier(hit_tier).record_hit(delivered.data.len() as u64),
            None => self.metrics.tier(&delivered.origin).record_miss(),
        }
        if let Some(release_tier) = &delivered.release_tier {
            self.hierarchy.buffer_write(release_tier, addr);
        }
        Ok(delivered.data)
    }

    /// Read `len` bytes starting at `offset`, reassembling across block
    /// boundaries and trimming the partial first/last block.
    pub async fn read_range(&self, offset: u64, len: u64) -> Result<Bytes> {
        let (first_block, block_count) = covering_blocks(offset, len, self.block_size);
        let mut out = BytesMut::with_capacity(len as usize);
        for i in 0..block_count {
            let blk = first_block + i;
            let data = self.read_block(blk).await?;
            let block_start = blk * self.block_size;
            let want_start = offset.max(block_start) - block_start;
            let want_end = ((offset + len).min(block_start + self.block_size) - block_start).min(data.len() as u64);
            if want_start < want_end {
                out.extend_from_slice(&data[want_start as usize..want_end as usize]);
            }
        }
        Ok(out.freeze())
    }
}

async fn probe_size(pool: &ConnectionPool, path: &str) -> Result<u64> {
    let addr = pool.first_addr().ok_or_else(|| Error::Unavailable { path: path.to_string() })?;
    let mut stream = TcpStream::connect(addr).await?;
    Message::OpenFile { path: path.to_string() }.write_to(&mut stream).await?;
    match Message::read_from(&mut stream).await? {
        Message::OpenFileReply { size: Some(size), .. } => Ok(size),
        Message::OpenFileReply { size: None, .. } => Err(Error::Unavailable { path: path.to_string() }),
        other => Err(Error::MalformedFrame(format!("expected OPEN_FILE_REPLY, got {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covering_blocks_single() {
        assert_eq!(covering_blocks(10, 5, 16), (0, 1));
    }

    #[test]
    fn test_covering_blocks_spans_two() {
        assert_eq!(covering_blocks(12, 10, 16), (0, 2));
    }

    #[test]
    fn test_covering_blocks_aligned() {
        assert_eq!(covering_blocks(16, 16, 16), (1, 1));
    }

    #[test]
    fn test_covering_blocks_zero_len() {
        assert_eq!(covering_blocks(20, 0, 16), (1, 0));
    }
}
