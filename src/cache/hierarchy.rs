//! Ordered tier list (C6): the thing a client actually calls
//!
//! `CacheHierarchy` walks its local tiers top to bottom on every request.
//! A hit at tier *i* writes back into every shallower tier that already
//! holds a reservation for the address; a miss through every local tier
//! falls through to a terminal [`NetworkCache`], and only the call that
//! first reserved the block anywhere in the stack actually drives that
//! fetch — everyone else just awaits the outcome the owner resolves.

use crate::block::BlockAddress;
use crate::cache::bounded::BoundedCache;
use crate::cache::backend::CacheBackend;
use crate::cache::events::CacheEvent;
use crate::cache::metrics::{CacheStatsSnapshot, TierMetricsSnapshot};
use crate::cache::network::NetworkCache;
use crate::error::{Error, Result};
use crate::request::{Request, SharedInFlightReads};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

/// Whatever sits below the lowest local tier: a [`NetworkCache`] on the
/// client side, a raw backing-file reader on the server side. Exactly one
/// fetch against this reaches here per address (§4.4 step 3); the
/// implementation is responsible for resolving `reads` itself once done,
/// the same way `NetworkCache::request_block` already does.
#[async_trait]
pub trait Origin: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self, path: &str, addr: BlockAddress, reads: &SharedInFlightReads) -> Result<Bytes>;
}

#[async_trait]
impl Origin for NetworkCache {
    fn name(&self) -> &str {
        NetworkCache::name(self)
    }

    async fn fetch(&self, path: &str, addr: BlockAddress, reads: &SharedInFlightReads) -> Result<Bytes> {
        self.request_block(path, addr, reads).await
    }
}

/// A single rung of a [`CacheHierarchy`], abstracting over the concrete
/// [`CacheBackend`] a [`BoundedCache`] is built on.
#[async_trait]
pub trait HierarchyTier: Send + Sync {
    fn name(&self) -> &str;
    fn block_size(&self) -> u64;
    fn free_space(&self) -> u64;
    async fn request_block(&self, addr: BlockAddress, prefetched: u32, reads: &SharedInFlightReads) -> Result<Request>;
    async fn write_block(&self, addr: BlockAddress, data: Bytes, reads: &SharedInFlightReads) -> Result<()>;
    fn buffer_write(&self, addr: BlockAddress);
    /// Take a hold on `addr` on behalf of a caller that received it via a
    /// fetch resolution rather than a synchronous scan hit. Returns whether
    /// the slot was still there to hold.
    fn mark_active(&self, addr: BlockAddress) -> bool;
    fn stats_snapshot(&self) -> TierMetricsSnapshot;
    fn subscribe(&self) -> broadcast::Receiver<CacheEvent>;
}

#[async_trait]
impl<B: CacheBackend + 'static> HierarchyTier for BoundedCache<B> {
    fn name(&self) -> &str {
        BoundedCache::name(self)
    }

    fn block_size(&self) -> u64 {
        BoundedCache::block_size(self)
    }

    fn free_space(&self) -> u64 {
        BoundedCache::free_space(self)
    }

    async fn request_block(&self, addr: BlockAddress, prefetched: u32, reads: &SharedInFlightReads) -> Result<Request> {
        BoundedCache::request_block(self, addr, prefetched, reads).await
    }

    async fn write_block(&self, addr: BlockAddress, data: Bytes, reads: &SharedInFlightReads) -> Result<()> {
        BoundedCache::write_block(self, addr, data, reads).await
    }

    fn buffer_write(&self, addr: BlockAddress) {
        BoundedCache::buffer_write(self, addr)
    }

    fn mark_active(&self, addr: BlockAddress) -> bool {
        BoundedCache::mark_active(self, addr)
    }

    fn stats_snapshot(&self) -> TierMetricsSnapshot {
        let stats = BoundedCache::stats(self);
        TierMetricsSnapshot {
            hits: stats.hits.load(std::sync::atomic::Ordering::Relaxed),
            misses: stats.misses.load(std::sync::atomic::Ordering::Relaxed),
            evictions: stats.evictions.load(std::sync::atomic::Ordering::Relaxed),
            wasted_fetches: stats.wasted_fetches.load(std::sync::atomic::Ordering::Relaxed),
            bytes_served: 0,
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        BoundedCache::subscribe(self)
    }
}

/// Result of a successful hierarchy-level fetch.
pub struct Delivered {
    pub data: Bytes,
    pub origin: String,
    /// Set only when a tier satisfied the request synchronously (a true
    /// cache hit) — for hit/miss accounting, not for releasing a hold.
    pub hit_tier: Option<String>,
    /// Name of whichever tier is holding an active-reader count on this
    /// address on the caller's behalf, covering both a synchronous hit and
    /// a resolved fetch (owner or joiner) that got written back into a
    /// local tier. The caller must eventually call `buffer_write` with this
    /// name exactly once to release it; `None` means nothing was reserved
    /// locally (e.g. there is no local tier, or the slot was already reused
    /// by the time delivery completed, in which case there is nothing to
    /// release).
    pub release_tier: Option<String>,
}

/// Ordered composition of local tiers over one optional terminal network tier.
pub struct CacheHierarchy {
    tiers: Vec<Box<dyn HierarchyTier>>,
    origin: Option<Box<dyn Origin>>,
}

impl CacheHierarchy {
    pub fn new(tiers: Vec<Box<dyn HierarchyTier>>, origin: Option<Box<dyn Origin>>) -> Self {
        Self { tiers, origin }
    }

    pub fn tier_names(&self) -> Vec<&str> {
        self.tiers.iter().map(|t| t.name()).collect()
    }

    pub fn free_space(&self) -> u64 {
        self.tiers.iter().map(|t| t.free_space()).sum()
    }

    /// Per-tier hit/miss/eviction counters, for the metrics endpoint (§10.5).
    pub fn metrics_snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            tiers: self.tiers.iter().map(|t| (t.name().to_string(), t.stats_snapshot())).collect(),
        }
    }

    fn tier_by_name(&self, name: &str) -> Option<&dyn HierarchyTier> {
        self.tiers.iter().find(|t| t.name() == name).map(|b| b.as_ref())
    }

    /// Subscribe to a named tier's hit/miss/eviction/wasted-fetch event
    /// stream (§10.5's observability surface), e.g. for a future streaming
    /// metrics or audit consumer.
    pub fn subscribe_tier(&self, tier_name: &str) -> Option<broadcast::Receiver<CacheEvent>> {
        self.tier_by_name(tier_name).map(|t| t.subscribe())
    }

    /// §4.4's `requestBlock`: descend the tier list, falling through to the
    /// network only once, and only on behalf of the caller that actually
    /// owns this fetch.
    pub async fn request_block(
        &self,
        path: &str,
        addr: BlockAddress,
        prefetched: u32,
        reads: &SharedInFlightReads,
    ) -> Result<Delivered> {
        let mut reserved: Vec<usize> = Vec::new();
        let mut first_pending: Option<Request> = None;
        let mut owns_fetch = true;
        let mut owner_determined = false;

        for (i, tier) in self.tiers.iter().enumerate() {
            match tier.request_block(addr, prefetched, reads).await {
                Ok(req) if req.ready => {
                    let hit_tier = tier.name().to_string();
                    let data = req.into_data().expect("ready request carries data");
                    for &j in &reserved {
                        let _ = self.tiers[j].write_block(addr, data.clone(), reads).await;
                    }
                    return Ok(Delivered {
                        data,
                        origin: hit_tier.clone(),
                        hit_tier: Some(hit_tier.clone()),
                        release_tier: Some(hit_tier),
                    });
                }
                Ok(req) => {
                    if !owner_determined {
                        owns_fetch = req.owns_fetch;
                        owner_determined = true;
                    }
                    reserved.push(i);
                    if first_pending.is_none() {
                        first_pending = Some(req);
                    }
                }
                Err(Error::TierFull { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        if !owns_fetch {
            let pending = first_pending.expect("non-owner implies some tier already held a reservation");
            let waiting_cache = pending.waiting_cache.clone();
            let resolved = pending.await_ready().await?;
            let origin = resolved.originating.clone().unwrap_or_default();
            let data = resolved.data().cloned().expect("resolved request carries data");
            // This was still a miss from this caller's point of view — the
            // block only became available because somebody else's fetch
            // resolved — but we now hold our own read of a locally cached
            // copy, so take the same kind of hold a synchronous hit would,
            // against whichever tier this caller itself stalled on.
            let release_tier = waiting_cache.and_then(|name| {
                let tier = self.tier_by_name(&name)?;
                tier.mark_active(addr).then_some(name)
            });
            return Ok(Delivered { data, origin, hit_tier: None, release_tier });
        }

        let Some(origin) = &self.origin else {
            return Err(Error::Unavailable { path: path.to_string() });
        };
        let data = origin.fetch(path, addr, reads).await?;
        for &j in &reserved {
            let _ = self.tiers[j].write_block(addr, data.clone(), reads).await;
        }
        let release_tier = reserved.first().and_then(|&j| {
            let tier = self.tiers[j].as_ref();
            tier.mark_active(addr).then(|| tier.name().to_string())
        });
        Ok(Delivered { data, origin: origin.name().to_string(), hit_tier: None, release_tier })
    }

    /// Release a hold taken either by a synchronous hit or by
    /// `request_block`'s post-fetch `mark_active` call. No-op once the slot
    /// has already moved on to a different address.
    pub fn buffer_write(&self, tier_name: &str, addr: BlockAddress) {
        if let Some(tier) = self.tier_by_name(tier_name) {
            tier.buffer_write(addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::memory::MemoryBackend;
    use crate::cache::bounded::{new_reads_table, BoundedCache};

    fn mem_tier(name: &str, num_blocks: usize, associativity: usize) -> Box<dyn HierarchyTier> {
        Box::new(BoundedCache::new(MemoryBackend::new(name, num_blocks, 16), associativity))
    }

    #[tokio::test]
    async fn test_miss_writes_back_into_shallower_tiers() {
        let hierarchy = CacheHierarchy::new(vec![mem_tier("l1", 2, 2), mem_tier("l2", 4, 2)], None);
        let reads = new_reads_table();
        let addr = BlockAddress::new(1, 1);

        // Prime l2 directly so the hierarchy's descent reaches a hit there.
        let l2_req = hierarchy.tiers[1].request_block(addr, 0, &reads).await.unwrap();
        assert!(!l2_req.ready);
        hierarchy.tiers[1]
            .write_block(addr, Bytes::from_static(b"from-l2"), &reads)
            .await
            .unwrap();

        let delivered = hierarchy.request_block("/f", addr, 0, &reads).await.unwrap();
        assert_eq!(delivered.data.as_ref(), b"from-l2");
        assert_eq!(delivered.hit_tier.as_deref(), Some("l2"));
        assert_eq!(delivered.release_tier.as_deref(), Some("l2"));
        hierarchy.buffer_write("l2", addr);

        // l1 should now also hold the block after the write-back.
        let l1_req = hierarchy.tiers[0].request_block(addr, 0, &reads).await.unwrap();
        assert!(l1_req.ready);
        assert_eq!(l1_req.data().unwrap().as_ref(), b"from-l2");
    }

    struct FixedOrigin {
        name: String,
        data: Bytes,
    }

    #[async_trait]
    impl Origin for FixedOrigin {
        fn name(&self) -> &str {
            &self.name
        }

        async fn fetch(&self, _path: &str, addr: BlockAddress, reads: &SharedInFlightReads) -> Result<Bytes> {
            reads
                .resolve(
                    addr.block_index.0,
                    crate::request::BlockOutcome::Ready { data: self.data.clone(), origin: self.name.clone() },
                )
                .await;
            Ok(self.data.clone())
        }
    }

    #[tokio::test]
    async fn test_fetch_through_origin_holds_tier_active_until_released() {
        let hierarchy = CacheHierarchy::new(
            vec![mem_tier("l1", 1, 1)],
            Some(Box::new(FixedOrigin { name: "origin".into(), data: Bytes::from_static(b"fresh") })),
        );
        let reads = new_reads_table();
        let addr = BlockAddress::new(5, 5);

        let delivered = hierarchy.request_block("/f", addr, 0, &reads).await.unwrap();
        assert_eq!(delivered.data.as_ref(), b"fresh");
        // A resolved fetch is still a miss for hit/miss accounting...
        assert!(delivered.hit_tier.is_none());
        // ...but it still left the block sitting in a local tier that a
        // later victim scan must not evict out from under us.
        let release_tier = delivered.release_tier.clone().expect("fetch path must hand back a tier to release");
        assert_eq!(release_tier, "l1");

        let other = BlockAddress::new(6, 6);
        let reads2 = new_reads_table();
        let err = hierarchy.tiers[0].request_block(other, 0, &reads2).await;
        assert!(err.is_err(), "the lone slot is still held active, so it can't be reused yet");

        hierarchy.buffer_write(&release_tier, addr);

        let ok = hierarchy.tiers[0].request_block(other, 0, &reads2).await;
        assert!(ok.is_ok(), "once released, the slot becomes a legal eviction victim again");
    }

    #[tokio::test]
    async fn test_subscribe_tier_streams_that_tiers_events() {
        let hierarchy = CacheHierarchy::new(vec![mem_tier("l1", 2, 2)], None);
        let mut events = hierarchy.subscribe_tier("l1").unwrap();
        let reads = new_reads_table();
        let addr = BlockAddress::new(3, 3);

        let _ = hierarchy.request_block("/f", addr, 0, &reads).await;
        assert!(matches!(events.recv().await.unwrap(), CacheEvent::Miss { .. }));
        assert!(hierarchy.subscribe_tier("nonexistent").is_none());
    }

    #[tokio::test]
    async fn test_no_network_and_full_miss_is_unavailable() {
        let hierarchy = CacheHierarchy::new(vec![mem_tier("l1", 1, 1)], None);
        let reads = new_reads_table();
        let addr = BlockAddress::new(9, 9);

        let err = hierarchy.request_block("/f", addr, 0, &reads).await;
        assert!(matches!(err, Err(Error::Unavailable { .. })));
    }
}
