//! Per-tier cache metrics (C15), cache-line aligned
//!
//! `CacheTierMetrics` keeps the teacher's Data-Oriented-Design layout (one
//! aligned struct per tier, no false sharing between counters); `CacheMetrics`
//! replaces the fixed L1/L2/L3 triple with a name-keyed map since a
//! `CacheHierarchy` here has an arbitrary, configuration-driven tier list.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const CACHE_LINE_SIZE: usize = 64;

/// Metrics for a single cache tier, aligned to prevent false sharing.
#[repr(C, align(64))]
#[derive(Debug)]
pub struct CacheTierMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub wasted_fetches: AtomicU64,
    pub bytes_served: AtomicU64,
    pub last_update_ms: AtomicU64,
    _padding: [u8; 16],
}

const _: () = assert!(std::mem::size_of::<CacheTierMetrics>() <= CACHE_LINE_SIZE);

impl Default for CacheTierMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheTierMetrics {
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            wasted_fetches: AtomicU64::new(0),
            bytes_served: AtomicU64::new(0),
            last_update_ms: AtomicU64::new(0),
            _padding: [0; 16],
        }
    }

    #[inline]
    pub fn record_hit(&self, bytes: u64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.bytes_served.fetch_add(bytes, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_wasted_fetch(&self) {
        self.wasted_fetches.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    fn touch(&self) {
        self.last_update_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Release);
    }

    pub fn total_requests(&self) -> u64 {
        self.hits.load(Ordering::Relaxed) + self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            self.hits.load(Ordering::Relaxed) as f64 / total as f64
        }
    }

    pub fn snapshot(&self) -> TierMetricsSnapshot {
        TierMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            wasted_fetches: self.wasted_fetches.load(Ordering::Relaxed),
            bytes_served: self.bytes_served.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TierMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub wasted_fetches: u64,
    pub bytes_served: u64,
}

impl TierMetricsSnapshot {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStatsSnapshot {
    pub tiers: Vec<(String, TierMetricsSnapshot)>,
}

impl CacheStatsSnapshot {
    pub fn total_hits(&self) -> u64 {
        self.tiers.iter().map(|(_, t)| t.hits).sum()
    }

    /// Overall miss count is the deepest tier's miss count: every shallower
    /// tier's miss cascades down, so only the terminal tier's misses are
    /// true end-to-end misses.
    pub fn terminal_misses(&self) -> u64 {
        self.tiers.last().map(|(_, t)| t.misses).unwrap_or(0)
    }
}

/// Name-keyed collection of per-tier metrics, populated as tiers register
/// themselves with the hierarchy at construction time.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    tiers: DashMap<String, Arc<CacheTierMetrics>>,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tier(&self, name: &str) -> Arc<CacheTierMetrics> {
        self.tiers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CacheTierMetrics::new()))
            .clone()
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            tiers: self
                .tiers
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().snapshot()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_line_alignment() {
        assert_eq!(std::mem::align_of::<CacheTierMetrics>(), CACHE_LINE_SIZE);
        assert!(std::mem::size_of::<CacheTierMetrics>() <= CACHE_LINE_SIZE);
    }

    #[test]
    fn test_tier_metrics_operations() {
        let metrics = CacheTierMetrics::new();
        metrics.record_hit(1024);
        metrics.record_hit(1024);
        metrics.record_miss();

        assert_eq!(metrics.hits.load(Ordering::Relaxed), 2);
        assert!((metrics.hit_ratio() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_named_tier_metrics_are_independent() {
        let metrics = CacheMetrics::new();
        metrics.tier("l1-mem").record_hit(64);
        metrics.tier("l3-filelock").record_miss();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_hits(), 1);
        assert_eq!(snapshot.tiers.len(), 2);
    }
}
