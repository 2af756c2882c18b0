//! NetworkCache (C5): terminal tier, fetches blocks from the server pool
//!
//! Every miss that falls through every local tier lands here. A
//! [`ConnectionPool`] tracks each server's `useCnt`/`consecCnt` so routing
//! favors servers that have been responsive; failures penalize the server
//! and retry elsewhere, up to `max_retries`.

use crate::block::BlockAddress;
use crate::cache::compression::CompressionManager;
use crate::error::{Error, Result};
use crate::pool::PriorityThreadPool;
use crate::request::{BlockOutcome, SharedInFlightReads};
use crate::wire::Message;
use bytes::Bytes;
use serde::Deserialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;

/// On-disk shape of `ClientConfig::server_connections_path`.
#[derive(Debug, Deserialize)]
struct ConnectionsFile {
    servers: Vec<String>,
}

struct ServerHandle {
    addr: String,
    use_cnt: AtomicU64,
    consec_failures: AtomicU32,
}

/// Round-robin pool weighted away from servers with recent consecutive
/// failures; a server with a non-zero `consec_failures` is deprioritized
/// but not removed, so it can recover once it starts answering again.
pub struct ConnectionPool {
    servers: Vec<ServerHandle>,
    cursor: AtomicU64,
}

impl ConnectionPool {
    pub fn new(addrs: impl IntoIterator<Item = String>) -> Self {
        let servers = addrs
            .into_iter()
            .map(|addr| ServerHandle {
                addr,
                use_cnt: AtomicU64::new(0),
                consec_failures: AtomicU32::new(0),
            })
            .collect();
        Self {
            servers,
            cursor: AtomicU64::new(0),
        }
    }

    /// Parse a `|`-separated `host:port` list, the shorthand accepted
    /// wherever a connections list is passed directly rather than read from
    /// `server_connections_path`.
    pub fn from_connections_text(text: &str) -> Self {
        Self::new(text.split('|').map(str::trim).filter(|s| !s.is_empty()).map(String::from))
    }

    /// Parse the JSON document at `server_connections_path`: `{"servers":
    /// ["host:port", ...]}`.
    pub fn from_connections_json(text: &str) -> Result<Self> {
        let parsed: ConnectionsFile = serde_json::from_str(text)?;
        Ok(Self::new(parsed.servers))
    }

    fn pick(&self) -> Option<usize> {
        if self.servers.is_empty() {
            return None;
        }
        // Favor the least-recently-used server among those not currently
        // failing; if all are failing, round-robin anyway so the first to
        // recover gets retried.
        let healthy: Vec<usize> = (0..self.servers.len())
            .filter(|&i| self.servers[i].consec_failures.load(Ordering::Relaxed) == 0)
            .collect();
        let pool = if healthy.is_empty() { (0..self.servers.len()).collect::<Vec<_>>() } else { healthy };
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) as usize % pool.len();
        Some(pool[idx])
    }

    fn record_success(&self, idx: usize) {
        self.servers[idx].use_cnt.fetch_add(1, Ordering::Relaxed);
        self.servers[idx].consec_failures.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self, idx: usize) {
        self.servers[idx].consec_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn addr(&self, idx: usize) -> &str {
        &self.servers[idx].addr
    }

    /// First server's address, for one-off probes that don't need routing
    /// (e.g. an `OPEN_FILE_MSG` size lookup before the hierarchy exists).
    pub fn first_addr(&self) -> Option<&str> {
        self.servers.first().map(|s| s.addr.as_str())
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// Terminal tier of a client-side [`crate::cache::hierarchy::CacheHierarchy`].
pub struct NetworkCache {
    name: String,
    pool: ConnectionPool,
    transfer_pool: PriorityThreadPool,
    decompress_pool: PriorityThreadPool,
    compression: CompressionManager,
    max_retries: u32,
    block_size: u64,
    connections: AsyncMutex<std::collections::HashMap<usize, TcpStream>>,
}

impl NetworkCache {
    pub fn new(
        name: impl Into<String>,
        pool: ConnectionPool,
        transfer_pool: PriorityThreadPool,
        decompress_pool: PriorityThreadPool,
        block_size: u64,
        max_retries: u32,
    ) -> Self {
        Self {
            name: name.into(),
            pool,
            transfer_pool,
            decompress_pool,
            compression: CompressionManager::new(),
            max_retries,
            block_size,
            connections: AsyncMutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    async fn connect(&self, idx: usize) -> Result<()> {
        let mut conns = self.connections.lock().await;
        if conns.contains_key(&idx) {
            return Ok(());
        }
        let stream = TcpStream::connect(self.pool.addr(idx)).await?;
        conns.insert(idx, stream);
        Ok(())
    }

    /// Route the transfer through `transfer_pool` (C8): the pool grants a
    /// slot in priority order and the worker thread blocks until the async
    /// side reports the transfer finished, so at most as many transfers run
    /// concurrently as the pool has threads. The socket I/O itself still
    /// runs on the async runtime — only the scheduling gate lives on the
    /// pool thread — since the connections map is async `TcpStream`s.
    async fn fetch_from(&self, idx: usize, path: &str, blk: u64) -> Result<Bytes> {
        let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        self.transfer_pool.add_task(0, move || {
            let _ = go_tx.send(());
            let _ = done_rx.recv();
        });
        go_rx
            .await
            .map_err(|_| Error::Internal("transfer task dropped before granting a slot".into()))?;

        let result = self.transfer_over(idx, path, blk).await;
        let _ = done_tx.send(());
        result
    }

    async fn transfer_over(&self, idx: usize, path: &str, blk: u64) -> Result<Bytes> {
        self.connect(idx).await?;
        let mut conns = self.connections.lock().await;
        let stream = conns
            .get_mut(&idx)
            .expect("connection just established above");

        Message::RequestBlock { path: path.to_string(), blk, want_compressed: true }
            .write_to(stream)
            .await?;

        match Message::read_from(stream).await? {
            crate::wire::Message::SendBlock { compression, data, .. } => {
                drop(conns);
                if compression == 0 {
                    Ok(data)
                } else {
                    let (algorithm, _) = crate::cache::compression::CompressionAlgorithm::from_wire(compression);
                    self.decompress(data, algorithm).await
                }
            }
            other => Err(Error::MalformedFrame(format!(
                "expected SEND_BLK_MSG, got {other:?}"
            ))),
        }
    }

    async fn decompress(&self, data: Bytes, algorithm: crate::cache::compression::CompressionAlgorithm) -> Result<Bytes> {
        let compression = self.compression;
        let (tx, rx) = tokio::sync::oneshot::channel();
        // Decompression is CPU-bound; run it on the dedicated pool so the
        // async runtime's I/O-bound tasks never queue behind it.
        self.decompress_pool.add_task(0, move || {
            let result = compression.decompress(&data, algorithm);
            let _ = tx.send(result);
        });
        rx.await
            .map_err(|_| Error::Internal("decompression task dropped its result".into()))?
    }

    /// §4.3's `requestBlock`: retry across the pool up to `max_retries`,
    /// penalizing failing servers, then resolve the shared future.
    pub async fn request_block(
        &self,
        path: &str,
        addr: BlockAddress,
        reads: &SharedInFlightReads,
    ) -> Result<Bytes> {
        if self.pool.is_empty() {
            let err = Error::Unavailable { path: path.to_string() };
            reads
                .resolve(addr.block_index.0, BlockOutcome::Failed { reason: err.to_string() })
                .await;
            return Err(err);
        }

        let mut last_err = None;
        for _ in 0..=self.max_retries {
            let Some(idx) = self.pool.pick() else { break };
            match self.fetch_from(idx, path, addr.block_index.0 as u64).await {
                Ok(data) => {
                    self.pool.record_success(idx);
                    reads
                        .resolve(
                            addr.block_index.0,
                            BlockOutcome::Ready { data: data.clone(), origin: self.name.clone() },
                        )
                        .await;
                    return Ok(data);
                }
                Err(e) => {
                    self.pool.record_failure(idx);
                    last_err = Some(e);
                }
            }
        }

        let err = last_err.unwrap_or(Error::RetriesExhausted { addr: addr.to_string() });
        reads
            .resolve(addr.block_index.0, BlockOutcome::Failed { reason: err.to_string() })
            .await;
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_connection_pool_round_robins_healthy_servers() {
        let pool = ConnectionPool::from_connections_text("host1:1|host2:2|host3:3");
        assert_eq!(pool.len(), 3);
        let first = pool.pick().unwrap();
        pool.record_failure(first);
        // After one failure the next pick should avoid the unhealthy server
        // unless all are unhealthy.
        let second = pool.pick().unwrap();
        assert!(second < 3);
    }

    #[test]
    fn test_empty_connections_text_yields_empty_pool() {
        let pool = ConnectionPool::from_connections_text("");
        assert!(pool.is_empty());
        assert!(pool.pick().is_none());
    }

    #[test]
    fn test_from_connections_json_parses_server_list() {
        let pool = ConnectionPool::from_connections_json(r#"{"servers": ["host1:1", "host2:2"]}"#).unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_from_connections_json_rejects_malformed_document() {
        assert!(ConnectionPool::from_connections_json("not json").is_err());
    }

    /// Accept one `RequestBlock` frame and answer with `data`, uncompressed.
    async fn serve_one_block(listener: tokio::net::TcpListener, data: Bytes) {
        let (mut stream, _) = listener.accept().await.unwrap();
        match Message::read_from(&mut stream).await.unwrap() {
            Message::RequestBlock { path, blk, .. } => {
                Message::SendBlock { path, blk, compression: 0, data }.write_to(&mut stream).await.unwrap();
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_block_round_trips_through_transfer_pool() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_one_block(listener, Bytes::from_static(b"over-the-wire")));

        let pool = ConnectionPool::new([addr.to_string()]);
        let cache = NetworkCache::new(
            "net",
            pool,
            PriorityThreadPool::new("test-transfer", 2),
            PriorityThreadPool::new("test-decompress", 2),
            16,
            0,
        );
        let reads = Arc::new(crate::request::InFlightReads::new());
        let data = cache.request_block("/f", BlockAddress::new(1, 1), &reads).await.unwrap();
        assert_eq!(data.as_ref(), b"over-the-wire");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_transfer_pool_caps_concurrent_transfers() {
        // A pool of one thread can only grant one slot at a time; queue two
        // fetches against a server that won't answer either until both have
        // been admitted, and confirm the second only proceeds after the
        // first's slot is released.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let (mut stream, _) = listener.accept().await.unwrap();
                match Message::read_from(&mut stream).await.unwrap() {
                    Message::RequestBlock { path, blk, .. } => {
                        Message::SendBlock { path, blk, compression: 0, data: Bytes::from_static(b"x") }
                            .write_to(&mut stream)
                            .await
                            .unwrap();
                    }
                    other => panic!("unexpected message: {other:?}"),
                }
            }
        });

        let pool = ConnectionPool::new([addr.to_string(), addr.to_string()]);
        let cache = Arc::new(NetworkCache::new(
            "net",
            pool,
            PriorityThreadPool::new("test-transfer-1", 1),
            PriorityThreadPool::new("test-decompress-1", 1),
            16,
            0,
        ));
        let a = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.fetch_from(0, "/f", 1).await })
        };
        let b = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.fetch_from(1, "/f", 2).await })
        };
        let (ra, rb) = tokio::join!(a, b);
        assert!(ra.unwrap().is_ok());
        assert!(rb.unwrap().is_ok());
        server.await.unwrap();
    }
}
