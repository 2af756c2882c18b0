//! ServeFile (C10): per-file server-side request fulfilment
//!
//! One `ServeFile` per open path, tracked as a [`crate::trackable::TrackableRegistry`]
//! singleton. Every `ServeFile` in a process shares the same `CacheHierarchy`
//! (§4.10: the server owns exactly one), distinguishing files only by the
//! `fileIndex` baked into each `BlockAddress`; the hierarchy's
//! [`LocalFileOrigin`] plays the role a `NetworkCache` plays client-side:
//! the thing that actually touches bytes nobody has cached yet. Output
//! writes are serialized through a mutex and drained before teardown.

use crate::block::{BlockAddress, FileIndex};
use crate::cache::compression::{CompressionAlgorithm, CompressionConfig, CompressionManager};
use crate::cache::hierarchy::{CacheHierarchy, Origin};
use crate::error::{Error, Result};
use crate::pool::PriorityThreadPool;
use crate::request::{InFlightReads, SharedInFlightReads};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::{Mutex as AsyncMutex, Notify};

/// Terminal origin for the server's single, shared `CacheHierarchy` (§4.10):
/// reads the block range straight off whichever backing file `path` names.
/// One instance serves every open `ServeFile`, since the hierarchy itself is
/// shared — there is no per-file origin state to carry. Resolves `reads`
/// itself, exactly like `NetworkCache` does for the client-side terminal tier.
pub struct LocalFileOrigin {
    block_size: u64,
}

impl LocalFileOrigin {
    pub fn new(block_size: u64) -> Self {
        Self { block_size }
    }
}

#[async_trait]
impl Origin for LocalFileOrigin {
    fn name(&self) -> &str {
        "origin-disk"
    }

    async fn fetch(&self, path: &str, addr: BlockAddress, reads: &SharedInFlightReads) -> Result<Bytes> {
        let offset = addr.block_index.0 as u64 * self.block_size;
        let result = async {
            let mut file = tokio::fs::File::open(path).await?;
            let file_size = file.metadata().await?.len();
            let read_len = self.block_size.min(file_size.saturating_sub(offset));
            file.seek(SeekFrom::Start(offset)).await?;
            let mut buf = vec![0u8; read_len as usize];
            file.read_exact(&mut buf).await?;
            Ok::<Bytes, Error>(Bytes::from(buf))
        }
        .await;

        match &result {
            Ok(data) => {
                reads
                    .resolve(
                        addr.block_index.0,
                        crate::request::BlockOutcome::Ready { data: data.clone(), origin: self.name().to_string() },
                    )
                    .await;
            }
            Err(e) => {
                reads
                    .resolve(addr.block_index.0, crate::request::BlockOutcome::Failed { reason: e.to_string() })
                    .await;
            }
        }
        result
    }
}

/// Knobs governing a `ServeFile`'s prefetch sliding window. §9(ii)'s open
/// question: the window is a real, runnable feature, sized by configuration.
#[derive(Debug, Clone, Copy)]
pub struct ServeFileConfig {
    pub block_size: u64,
    pub initial_prefetch_blocks: u32,
    pub compress_outgoing: bool,
}

/// Per-file server-side engine (§4.7).
pub struct ServeFile {
    path: String,
    file_index: FileIndex,
    size: u64,
    block_size: u64,
    num_blocks: u64,
    hierarchy: Arc<CacheHierarchy>,
    reads: SharedInFlightReads,
    compression: CompressionManager,
    compress_pool: PriorityThreadPool,
    config: ServeFileConfig,
    next_prefetch: AtomicU64,
    outstanding_writes: AtomicU64,
    writes_drained: Notify,
    write_lock: AsyncMutex<()>,
}

impl ServeFile {
    /// Open `path` and stat it, registering against the process-wide
    /// `CacheHierarchy` (§4.10) the caller built once at startup and shares
    /// across every `ServeFile`. Returned behind an `Arc` since
    /// fire-and-forget prefetch tasks outlive the call and need a stable,
    /// shared handle back into `self`.
    pub async fn open(
        path: String,
        file_index: FileIndex,
        hierarchy: Arc<CacheHierarchy>,
        config: ServeFileConfig,
        compress_pool: PriorityThreadPool,
    ) -> Result<Arc<Self>> {
        let meta = tokio::fs::metadata(&path).await?;
        let size = meta.len();
        let block_size = config.block_size.max(1);
        let num_blocks = size.div_ceil(block_size).max(1);
        let compression = CompressionManager::with_config(CompressionConfig {
            default_algorithm: CompressionAlgorithm::Zstd,
            ..CompressionConfig::default()
        });

        let serve_file = Arc::new(Self {
            path,
            file_index,
            size,
            block_size,
            num_blocks,
            hierarchy,
            reads: Arc::new(InFlightReads::new()),
            compression,
            compress_pool,
            config,
            next_prefetch: AtomicU64::new(0),
            outstanding_writes: AtomicU64::new(0),
            writes_drained: Notify::new(),
            write_lock: AsyncMutex::new(()),
        });
        serve_file.kick_initial_prefetch();
        Ok(serve_file)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn file_index(&self) -> FileIndex {
        self.file_index
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn addr(&self, blk: u64) -> BlockAddress {
        BlockAddress::new(self.file_index.0, blk as u32)
    }

    /// §4.7(c): fulfil one client read, optionally compressing before return.
    /// The tuple is `(compression, payload)` mirroring SEND_BLK_MSG's wire shape.
    pub async fn serve_block(self: &Arc<Self>, blk: u64, want_compressed: bool) -> Result<(i32, Bytes)> {
        if blk >= self.num_blocks {
            return Err(Error::InvalidBlockAddress(format!("block {blk} >= numBlocks {}", self.num_blocks)));
        }
        let addr = self.addr(blk);
        let delivered = self.hierarchy.request_block(&self.path, addr, 0, &self.reads).await?;
        if let Some(release_tier) = &delivered.release_tier {
            self.hierarchy.buffer_write(release_tier, addr);
        }

        self.maybe_slide_prefetch_window(blk);

        if want_compressed && self.config.compress_outgoing {
            self.compress_for_wire(delivered.data).await
        } else {
            Ok((0, delivered.data))
        }
    }

    /// Compression is CPU-bound, so it runs on `compress_pool` (C8) rather
    /// than inline on the connection's async task, the same way
    /// `NetworkCache` keeps decompression off the runtime's I/O-bound tasks.
    async fn compress_for_wire(&self, data: Bytes) -> Result<(i32, Bytes)> {
        let compression = self.compression;
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.compress_pool.add_task(0, move || {
            let (payload, wire) = compression.to_wire_payload(&data);
            let _ = tx.send((wire, payload));
        });
        rx.await.map_err(|_| Error::Internal("compression task dropped its result".into()))
    }

    /// §4.7(d): fire the initial prefetch window on open.
    fn kick_initial_prefetch(self: &Arc<Self>) {
        let window = (self.config.initial_prefetch_blocks as u64).min(self.num_blocks);
        self.next_prefetch.store(window, Ordering::Relaxed);
        for blk in 0..window {
            self.spawn_prefetch(blk);
        }
    }

    /// Slide the window forward by one on every completion, as long as the
    /// hierarchy still reports free space for at least one more block.
    fn maybe_slide_prefetch_window(self: &Arc<Self>, _completed_blk: u64) {
        if self.hierarchy.free_space() < self.block_size {
            return;
        }
        let next = self.next_prefetch.fetch_add(1, Ordering::Relaxed);
        if next < self.num_blocks {
            self.spawn_prefetch(next);
        }
    }

    fn spawn_prefetch(self: &Arc<Self>, blk: u64) {
        // Prefetches are best-effort and fire-and-forget: a failure here
        // only means the eventual demand read pays the full fetch cost.
        let addr = self.addr(blk);
        let serve_file = self.clone();
        tokio::spawn(async move {
            let distance = 1u32;
            let _ = serve_file.hierarchy.request_block(&serve_file.path, addr, distance, &serve_file.reads).await;
        });
    }

    /// Output-file write path: serialize writers, track outstanding count
    /// so `drain` can wait for them.
    pub async fn write_block(&self, blk: u64, data: Bytes) -> Result<()> {
        self.outstanding_writes.fetch_add(1, Ordering::AcqRel);
        let _guard = self.write_lock.lock().await;
        let result = async {
            let offset = blk * self.block_size;
            let mut file = tokio::fs::OpenOptions::new().write(true).create(true).open(&self.path).await?;
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(&data).await?;
            Ok::<(), Error>(())
        }
        .await;
        if self.outstanding_writes.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.writes_drained.notify_waiters();
        }
        result
    }

    /// Block until every in-flight write has completed. Called from the
    /// teardown path before a `ServeFile` is removed from the registry.
    pub async fn drain_writes(&self) {
        while self.outstanding_writes.load(Ordering::Acquire) > 0 {
            self.writes_drained.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::memory::MemoryBackend;
    use crate::cache::bounded::BoundedCache;
    use crate::cache::hierarchy::HierarchyTier;

    fn mem_tier(name: &str, num_blocks: usize, block_size: u64, assoc: usize) -> Box<dyn HierarchyTier> {
        Box::new(BoundedCache::new(MemoryBackend::new(name, num_blocks, block_size), assoc))
    }

    /// Mirrors what `main.rs` builds once at startup: one local tier stack
    /// over a disk origin, shared by every `ServeFile` in the process.
    fn shared_hierarchy(block_size: u64, num_blocks: usize, assoc: usize) -> Arc<CacheHierarchy> {
        let origin = LocalFileOrigin::new(block_size);
        Arc::new(CacheHierarchy::new(vec![mem_tier("l1", num_blocks, block_size, assoc)], Some(Box::new(origin))))
    }

    #[tokio::test]
    async fn test_serve_block_reads_from_disk_on_cold_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, b"0123456789abcdef").await.unwrap();

        let config = ServeFileConfig { block_size: 4, initial_prefetch_blocks: 0, compress_outgoing: false };
        let hierarchy = shared_hierarchy(4, 4, 4);
        let serve_file = ServeFile::open(
            path.to_string_lossy().into_owned(),
            FileIndex(1),
            hierarchy,
            config,
            PriorityThreadPool::new("test-compress", 1),
        )
        .await
        .unwrap();

        assert_eq!(serve_file.num_blocks(), 4);
        let (compression, data) = serve_file.serve_block(0, false).await.unwrap();
        assert_eq!(compression, 0);
        assert_eq!(data.as_ref(), b"0123");

        // Second read should be a cache hit, same bytes.
        let (_, data2) = serve_file.serve_block(0, false).await.unwrap();
        assert_eq!(data2.as_ref(), b"0123");
    }

    #[tokio::test]
    async fn test_serve_block_compresses_through_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let body = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".repeat(64);
        tokio::fs::write(&path, &body).await.unwrap();

        let block_size = body.len() as u64;
        let config = ServeFileConfig { block_size, initial_prefetch_blocks: 0, compress_outgoing: true };
        let hierarchy = shared_hierarchy(block_size, 1, 1);
        let serve_file = ServeFile::open(
            path.to_string_lossy().into_owned(),
            FileIndex(99),
            hierarchy,
            config,
            PriorityThreadPool::new("test-compress", 1),
        )
        .await
        .unwrap();

        let (compression, payload) = serve_file.serve_block(0, true).await.unwrap();
        assert_ne!(compression, 0, "highly repetitive data compressed with Zstd should not land on wire value 0");
        assert!(payload.len() < body.len());

        let (algorithm, _) = CompressionAlgorithm::from_wire(compression);
        let restored = CompressionManager::new().decompress(&payload, algorithm).unwrap();
        assert_eq!(restored.as_ref(), body.as_slice());
    }

    #[tokio::test]
    async fn test_out_of_range_block_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.bin");
        tokio::fs::write(&path, b"ab").await.unwrap();
        let config = ServeFileConfig { block_size: 4, initial_prefetch_blocks: 0, compress_outgoing: false };
        let hierarchy = shared_hierarchy(4, 2, 2);
        let serve_file = ServeFile::open(
            path.to_string_lossy().into_owned(),
            FileIndex(2),
            hierarchy,
            config,
            PriorityThreadPool::new("test-compress", 1),
        )
        .await
        .unwrap();

        let err = serve_file.serve_block(5, false).await;
        assert!(matches!(err, Err(Error::InvalidBlockAddress(_))));
    }

    #[tokio::test]
    async fn test_write_then_drain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        tokio::fs::write(&path, [0u8; 8]).await.unwrap();
        let config = ServeFileConfig { block_size: 4, initial_prefetch_blocks: 0, compress_outgoing: false };
        let hierarchy = shared_hierarchy(4, 2, 2);
        let serve_file = ServeFile::open(
            path.to_string_lossy().into_owned(),
            FileIndex(3),
            hierarchy,
            config,
            PriorityThreadPool::new("test-compress", 1),
        )
        .await
        .unwrap();

        serve_file.write_block(0, Bytes::from_static(b"wxyz")).await.unwrap();
        serve_file.drain_writes().await;

        let contents = tokio::fs::read(&path).await.unwrap();
        assert_eq!(&contents[0..4], b"wxyz");
    }

    #[tokio::test]
    async fn test_two_files_share_one_hierarchy() {
        let dir = tempfile::tempdir().unwrap();
        let path_a = dir.path().join("a.bin");
        let path_b = dir.path().join("b.bin");
        tokio::fs::write(&path_a, b"aaaa").await.unwrap();
        tokio::fs::write(&path_b, b"bbbb").await.unwrap();
        let config = ServeFileConfig { block_size: 4, initial_prefetch_blocks: 0, compress_outgoing: false };
        let hierarchy = shared_hierarchy(4, 4, 4);

        let file_a = ServeFile::open(
            path_a.to_string_lossy().into_owned(),
            FileIndex(10),
            hierarchy.clone(),
            config,
            PriorityThreadPool::new("test-compress-a", 1),
        )
        .await
        .unwrap();
        let file_b = ServeFile::open(
            path_b.to_string_lossy().into_owned(),
            FileIndex(11),
            hierarchy,
            config,
            PriorityThreadPool::new("test-compress-b", 1),
        )
        .await
        .unwrap();

        let (_, data_a) = file_a.serve_block(0, false).await.unwrap();
        let (_, data_b) = file_b.serve_block(0, false).await.unwrap();
        assert_eq!(data_a.as_ref(), b"aaaa");
        assert_eq!(data_b.as_ref(), b"bbbb");
    }
}
