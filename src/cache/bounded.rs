//! Generic set-associative admission/eviction driver (C3)
//!
//! `BoundedCache<B>` is the one place the lookup/admission algorithm (§4.1)
//! is written; every concrete [`crate::cache::backend::CacheBackend`] plugs
//! into it unchanged. `numBins = numBlocks / associativity`; a bin's writer
//! lock is the only thing serializing admission within that bin.

use crate::binlock::BinLockTable;
use crate::block::{BlockAddress, BlockStatus};
use crate::cache::backend::CacheBackend;
use crate::cache::events::{CacheEvent, EvictionReason};
use crate::error::Result;
use crate::request::{BlockOutcome, InFlightReads, Request, SharedInFlightReads};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

/// Ring buffer depth for the tier's event stream. A lagging subscriber just
/// misses old events (`broadcast::Receiver::recv` returns `Lagged`) rather
/// than applying backpressure to the hot admission path.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Per-tier counters, exposed for `CacheHierarchy::free_space` and stats.
#[derive(Debug, Default)]
pub struct BoundedCacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub wasted_fetches: AtomicU64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Outcome of the admission algorithm's step 2-3, used internally to decide
/// what `request_block` should hand the caller.
enum Admission {
    /// Slot `slot` was (re)reserved for `addr`; caller owns the fetch.
    Reserved { slot: usize },
    /// Another party already holds a RESERVED slot for `addr`.
    AlreadyPending,
    /// No evictable victim; caller must fall through to the next tier.
    Full,
}

/// A set-associative block store over one [`CacheBackend`].
pub struct BoundedCache<B: CacheBackend> {
    backend: B,
    bins: BinLockTable,
    associativity: usize,
    stats: BoundedCacheStats,
    events: broadcast::Sender<CacheEvent>,
}

impl<B: CacheBackend> BoundedCache<B> {
    pub fn new(backend: B, associativity: usize) -> Self {
        let num_blocks = backend.num_blocks();
        let associativity = associativity.max(1);
        let num_bins = (num_blocks / associativity).max(1);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            backend,
            bins: BinLockTable::new(num_bins),
            associativity,
            stats: BoundedCacheStats::default(),
            events,
        }
    }

    /// Subscribe to this tier's hit/miss/eviction/wasted-fetch stream.
    /// Dropped if nobody is listening — `send` failing just means zero
    /// receivers, never a real error.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: CacheEvent) {
        let _ = self.events.send(event);
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn block_size(&self) -> u64 {
        self.backend.block_size()
    }

    pub fn free_space(&self) -> u64 {
        let used = (0..self.backend.num_blocks())
            .filter(|&slot| self.backend.entry(slot).status() != BlockStatus::Empty)
            .count() as u64;
        let total = self.backend.num_blocks() as u64;
        total.saturating_sub(used) * self.block_size()
    }

    pub fn stats(&self) -> &BoundedCacheStats {
        &self.stats
    }

    fn slots_in_bin(&self, bin: usize) -> impl Iterator<Item = usize> {
        let start = bin * self.associativity;
        start..(start + self.associativity).min(self.backend.num_blocks())
    }

    /// §4.1 step 1: reader-held scan for a hit or an existing reservation.
    fn scan_hit_or_pending(&self, addr: BlockAddress, bin: usize) -> Option<Result<usize>> {
        let _guard = self.bins.read(bin);
        for slot in self.slots_in_bin(bin) {
            let entry = self.backend.entry(slot);
            if entry.matches(addr) {
                return match entry.status() {
                    BlockStatus::Avail => {
                        entry.inc_active();
                        Some(Ok(slot))
                    }
                    BlockStatus::Reserved => Some(Err(crate::error::Error::Internal(
                        "pending".to_string(),
                    ))),
                    BlockStatus::Empty => None,
                };
            }
        }
        None
    }

    /// §4.1 steps 2-3: writer-held re-scan, victim selection, reservation.
    fn admit(&self, addr: BlockAddress, bin: usize, prefetched: u32) -> Admission {
        let _guard = self.bins.write(bin);

        for slot in self.slots_in_bin(bin) {
            let entry = self.backend.entry(slot);
            if entry.matches(addr) {
                return match entry.status() {
                    BlockStatus::Avail | BlockStatus::Reserved => Admission::AlreadyPending,
                    BlockStatus::Empty => Admission::Full, // unreachable: matches() excludes Empty
                };
            }
        }

        let mut empty_slot = None;
        let mut demand_victim: Option<(usize, u64)> = None;
        let mut any_victim: Option<(usize, u64)> = None;

        for slot in self.slots_in_bin(bin) {
            let entry = self.backend.entry(slot);
            match entry.status() {
                BlockStatus::Empty => {
                    empty_slot.get_or_insert(slot);
                }
                BlockStatus::Avail if entry.evictable() => {
                    let ts = entry.time_stamp();
                    if entry.prefetched() == 0 {
                        if demand_victim.map_or(true, |(_, t)| ts < t) {
                            demand_victim = Some((slot, ts));
                        }
                    }
                    if any_victim.map_or(true, |(_, t)| ts < t) {
                        any_victim = Some((slot, ts));
                    }
                }
                _ => {}
            }
        }

        let chosen = empty_slot
            .or_else(|| demand_victim.map(|(s, _)| s))
            .or_else(|| any_victim.map(|(s, _)| s));

        let Some(slot) = chosen else {
            return Admission::Full;
        };

        let entry = self.backend.entry(slot);
        if entry.status() == BlockStatus::Avail {
            let victim = entry.address();
            self.backend.clean_up_block_data(slot);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            self.emit(CacheEvent::Evict {
                addr: victim,
                tier: self.backend.name().to_string(),
                reason: EvictionReason::Capacity,
            });
        }
        entry.reserve(addr, now_millis(), prefetched);
        Admission::Reserved { slot }
    }

    /// §4.1's `requestBlock`. `reads` is the per-file in-flight-fetch table
    /// shared across every tier in the hierarchy for this file.
    pub async fn request_block(
        &self,
        addr: BlockAddress,
        prefetched: u32,
        reads: &SharedInFlightReads,
    ) -> Result<Request> {
        let bin = addr.bin_index(self.bins.num_bins());

        if let Some(result) = self.scan_hit_or_pending(addr, bin) {
            if let Ok(slot) = result {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                self.emit(CacheEvent::Hit { addr, tier: self.backend.name().to_string() });
                let data = self.backend.get_block_data(slot)?;
                return Ok(Request::hit(addr, data, self.backend.name()));
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        self.emit(CacheEvent::Miss { addr });

        match self.admit(addr, bin, prefetched) {
            Admission::Reserved { .. } | Admission::AlreadyPending => {
                // `is_owner` comes from the per-file reads map shared by
                // every tier in the hierarchy, not from this tier's own
                // admission: a lower tier may have already registered the
                // fetch for this block before this tier's bin lock was won.
                let (rx, is_owner) = reads.register(addr.block_index.0).await;
                Ok(Request::pending(addr, self.block_size(), self.backend.name(), rx, is_owner))
            }
            Admission::Full => Err(crate::error::Error::TierFull {
                tier: self.backend.name().to_string(),
                addr: addr.to_string(),
            }),
        }
    }

    /// §4.1's `writeBlock`: install data into whichever slot is still
    /// RESERVED for `addr`, publish it, and resolve every waiter. If
    /// eviction reclaimed the slot in the meantime, record a wasted fetch
    /// and do nothing else — the data is simply dropped.
    pub async fn write_block(
        &self,
        addr: BlockAddress,
        data: bytes::Bytes,
        reads: &SharedInFlightReads,
    ) -> Result<()> {
        let bin = addr.bin_index(self.bins.num_bins());
        let installed_slot = {
            let _guard = self.bins.write(bin);
            self.slots_in_bin(bin).find(|&slot| {
                let entry = self.backend.entry(slot);
                entry.address() == addr && entry.status() == BlockStatus::Reserved
            })
        };

        match installed_slot {
            Some(slot) => {
                self.backend.set_block_data(slot, &data)?;
                self.backend.entry(slot).publish(self.backend.name());
                self.backend.commit(slot)?;
                reads
                    .resolve(
                        addr.block_index.0,
                        BlockOutcome::Ready {
                            data,
                            origin: self.backend.name().to_string(),
                        },
                    )
                    .await;
                Ok(())
            }
            None => {
                self.stats.wasted_fetches.fetch_add(1, Ordering::Relaxed);
                self.emit(CacheEvent::WastedFetch { addr, tier: self.backend.name().to_string() });
                Ok(())
            }
        }
    }

    /// Take a hold for a caller whose route to this data wasn't a
    /// `scan_hit_or_pending` hit — the party that drove a fetch through to
    /// `write_block`, or a joiner that just received its broadcast outcome.
    /// No-op if the slot has already moved on to a different address by the
    /// time the caller gets here (e.g. another bin admission reused it),
    /// which is safe: there is then nothing left here to hold onto.
    pub fn mark_active(&self, addr: BlockAddress) -> bool {
        let bin = addr.bin_index(self.bins.num_bins());
        let _guard = self.bins.read(bin);
        for slot in self.slots_in_bin(bin) {
            let entry = self.backend.entry(slot);
            if entry.matches(addr) && entry.status() == BlockStatus::Avail {
                entry.inc_active();
                return true;
            }
        }
        false
    }

    /// §4.5's `bufferWrite`: release one reader's hold taken at a hit.
    pub fn buffer_write(&self, addr: BlockAddress) {
        let bin = addr.bin_index(self.bins.num_bins());
        let _guard = self.bins.read(bin);
        for slot in self.slots_in_bin(bin) {
            let entry = self.backend.entry(slot);
            if entry.matches(addr) {
                entry.dec_active();
                return;
            }
        }
    }
}

pub type SharedBoundedCache<B> = Arc<BoundedCache<B>>;
pub fn new_reads_table() -> SharedInFlightReads {
    Arc::new(InFlightReads::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::memory::MemoryBackend;

    fn cache(num_blocks: usize, associativity: usize) -> BoundedCache<MemoryBackend> {
        BoundedCache::new(MemoryBackend::new("mem", num_blocks, 16), associativity)
    }

    #[tokio::test]
    async fn test_miss_then_write_then_hit() {
        let cache = cache(4, 2);
        let reads = new_reads_table();
        let addr = BlockAddress::new(1, 1);

        let req = cache.request_block(addr, 0, &reads).await.unwrap();
        assert!(!req.ready);

        cache
            .write_block(addr, bytes::Bytes::from_static(b"payload"), &reads)
            .await
            .unwrap();

        let req2 = cache.request_block(addr, 0, &reads).await.unwrap();
        assert!(req2.ready);
        assert_eq!(req2.data().unwrap().as_ref(), b"payload");
        cache.buffer_write(addr);
    }

    #[tokio::test]
    async fn test_full_bin_returns_tier_full_when_all_active() {
        let cache = cache(2, 2);
        let reads = new_reads_table();

        for i in 1..=2u32 {
            let addr = BlockAddress::new(1, i);
            let req = cache.request_block(addr, 0, &reads).await.unwrap();
            assert!(!req.ready);
            cache
                .write_block(addr, bytes::Bytes::from_static(b"x"), &reads)
                .await
                .unwrap();
            // Take a hit so activeCnt > 0 and the slot becomes non-evictable.
            let hit = cache.request_block(addr, 0, &reads).await.unwrap();
            assert!(hit.ready);
        }

        let addr3 = BlockAddress::new(1, 3);
        let err = cache.request_block(addr3, 0, &reads).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_subscribers_see_miss_then_hit_events() {
        let cache = cache(4, 2);
        let mut events = cache.subscribe();
        let reads = new_reads_table();
        let addr = BlockAddress::new(1, 1);

        cache.request_block(addr, 0, &reads).await.unwrap();
        cache.write_block(addr, bytes::Bytes::from_static(b"x"), &reads).await.unwrap();
        cache.request_block(addr, 0, &reads).await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), CacheEvent::Miss { .. }));
        assert!(matches!(events.recv().await.unwrap(), CacheEvent::Hit { .. }));
    }

    #[tokio::test]
    async fn test_mark_active_blocks_eviction_until_released() {
        let cache = cache(1, 1);
        let reads = new_reads_table();
        let addr = BlockAddress::new(1, 1);

        cache.request_block(addr, 0, &reads).await.unwrap();
        cache
            .write_block(addr, bytes::Bytes::from_static(b"x"), &reads)
            .await
            .unwrap();
        assert!(cache.mark_active(addr));

        // The lone bin slot is held active, so a different address can't
        // claim it yet.
        let other = BlockAddress::new(2, 2);
        let err = cache.request_block(other, 0, &reads).await;
        assert!(err.is_err());

        cache.buffer_write(addr);
        let ok = cache.request_block(other, 0, &reads).await;
        assert!(ok.is_ok());
    }

    #[test]
    fn test_mark_active_on_unheld_address_is_noop() {
        let cache = cache(2, 2);
        assert!(!cache.mark_active(BlockAddress::new(9, 9)));
    }

    #[tokio::test]
    async fn test_dedup_across_concurrent_requesters() {
        let cache = Arc::new(cache(4, 4));
        let reads = new_reads_table();
        let addr = BlockAddress::new(2, 2);

        let req1 = cache.request_block(addr, 0, &reads).await.unwrap();
        let req2 = cache.request_block(addr, 0, &reads).await.unwrap();
        assert!(!req1.ready && !req2.ready);

        cache
            .write_block(addr, bytes::Bytes::from_static(b"shared"), &reads)
            .await
            .unwrap();

        let r1 = req1.await_ready().await.unwrap();
        let r2 = req2.await_ready().await.unwrap();
        assert_eq!(r1.data().unwrap().as_ref(), b"shared");
        assert_eq!(r2.data().unwrap().as_ref(), b"shared");
    }
}
