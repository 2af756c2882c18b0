//! Future-like handle for a pending or ready block
//!
//! A [`Request`] is what `BoundedCache::requestBlock` hands back to a
//! caller: either data is already in hand (`ready = true`), or the caller
//! must await `outcome()`, which resolves exactly once no matter how many
//! concurrent requesters are awaiting the same `BlockAddress` (I5).

use crate::block::BlockAddress;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex as AsyncMutex};

/// Final, resolved outcome of a block fetch shared across all waiters.
#[derive(Debug, Clone)]
pub enum BlockOutcome {
    Ready { data: Bytes, origin: String },
    Failed { reason: String },
}

/// Per-file table of in-flight fetches, keyed by block index within the file.
///
/// Protected by a single async mutex: insertion and lookup of a waiter form
/// one critical section, matching the "reads map" of the admission protocol.
#[derive(Default)]
pub struct InFlightReads {
    inner: AsyncMutex<HashMap<u32, broadcast::Sender<BlockOutcome>>>,
}

impl InFlightReads {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or join) a pending fetch for `block_index`. Returns a
    /// receiver for the eventual [`BlockOutcome`] and whether this caller
    /// is the one responsible for actually driving the fetch (`is_owner`).
    pub async fn register(&self, block_index: u32) -> (broadcast::Receiver<BlockOutcome>, bool) {
        let mut map = self.inner.lock().await;
        if let Some(sender) = map.get(&block_index) {
            (sender.subscribe(), false)
        } else {
            let (tx, rx) = broadcast::channel(1);
            map.insert(block_index, tx);
            (rx, true)
        }
    }

    /// Resolve the fetch for `block_index`, fan the outcome out to every
    /// current subscriber, then drop the entry so later requesters see a
    /// fresh tier lookup rather than a stale reservation.
    pub async fn resolve(&self, block_index: u32, outcome: BlockOutcome) {
        let mut map = self.inner.lock().await;
        if let Some(sender) = map.remove(&block_index) {
            let _ = sender.send(outcome);
        }
    }
}

/// A request for one block, possibly already satisfied.
pub struct Request {
    pub addr: BlockAddress,
    pub size: u64,
    /// Populated on a synchronous hit.
    data: Option<Bytes>,
    pub ready: bool,
    /// Tier that ultimately supplied the data (set once resolved).
    pub originating: Option<String>,
    /// Tier where the requester stalled, recorded for stats.
    pub waiting_cache: Option<String>,
    /// True if this caller made the fresh reservation and is therefore
    /// responsible for driving the downward fetch (vs. joining one already
    /// in flight). Irrelevant once `ready`.
    pub owns_fetch: bool,
    pending: Option<broadcast::Receiver<BlockOutcome>>,
}

impl Request {
    /// A request already satisfied by a synchronous tier hit.
    pub fn hit(addr: BlockAddress, data: Bytes, originating: impl Into<String>) -> Self {
        Self {
            addr,
            size: data.len() as u64,
            data: Some(data),
            ready: true,
            originating: Some(originating.into()),
            waiting_cache: None,
            owns_fetch: false,
            pending: None,
        }
    }

    /// A request that must wait on a shared future before data is available.
    pub fn pending(
        addr: BlockAddress,
        size: u64,
        waiting_cache: impl Into<String>,
        receiver: broadcast::Receiver<BlockOutcome>,
        owns_fetch: bool,
    ) -> Self {
        Self {
            addr,
            size,
            data: None,
            ready: false,
            originating: None,
            waiting_cache: Some(waiting_cache.into()),
            owns_fetch,
            pending: Some(receiver),
        }
    }

    /// Await completion, consuming the pending receiver if there was one.
    /// A request already `ready` resolves immediately.
    pub async fn await_ready(mut self) -> Result<Self> {
        if self.ready {
            return Ok(self);
        }
        let mut rx = self
            .pending
            .take()
            .expect("non-ready Request must carry a pending receiver");
        match rx.recv().await {
            Ok(BlockOutcome::Ready { data, origin }) => {
                self.data = Some(data.clone());
                self.size = data.len() as u64;
                self.originating = Some(origin);
                self.ready = true;
                Ok(self)
            }
            Ok(BlockOutcome::Failed { reason }) => Err(Error::Internal(reason)),
            Err(_) => Err(Error::Internal(format!(
                "producer for {} dropped without resolving",
                self.addr
            ))),
        }
    }

    /// Borrow the data of a ready request.
    pub fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    /// Take ownership of the data, consuming the request. The caller must
    /// follow up with `bufferWrite` on the producing tier (I4) exactly once.
    pub fn into_data(self) -> Option<Bytes> {
        self.data
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("addr", &self.addr)
            .field("size", &self.size)
            .field("ready", &self.ready)
            .field("originating", &self.originating)
            .finish()
    }
}

/// Convenience wrapper so multiple subsystems can share one reads table.
pub type SharedInFlightReads = Arc<InFlightReads>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dedup_single_owner() {
        let reads = InFlightReads::new();
        let (_rx1, owner1) = reads.register(7).await;
        let (_rx2, owner2) = reads.register(7).await;
        assert!(owner1);
        assert!(!owner2);
    }

    #[tokio::test]
    async fn test_resolve_fans_out() {
        let reads = Arc::new(InFlightReads::new());
        let (rx1, _) = reads.register(3).await;
        let (rx2, _) = reads.register(3).await;

        reads
            .resolve(
                3,
                BlockOutcome::Ready {
                    data: Bytes::from_static(b"abcd"),
                    origin: "network".into(),
                },
            )
            .await;

        for mut rx in [rx1, rx2] {
            match rx.recv().await.unwrap() {
                BlockOutcome::Ready { data, origin } => {
                    assert_eq!(data.as_ref(), b"abcd");
                    assert_eq!(origin, "network");
                }
                _ => panic!("expected ready outcome"),
            }
        }
    }

    #[tokio::test]
    async fn test_request_hit_is_ready_immediately() {
        let addr = BlockAddress::new(1, 1);
        let req = Request::hit(addr, Bytes::from_static(b"hello"), "l1-mem");
        let req = req.await_ready().await.unwrap();
        assert!(req.ready);
        assert_eq!(req.data().unwrap().as_ref(), b"hello");
    }
}
