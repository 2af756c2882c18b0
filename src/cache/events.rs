//! Cache events (C15): block-level observability stream
//!
//! Mirrors the object-cache event enum's shape one level down: events are
//! keyed by `BlockAddress` and a tier *name* (tiers are heterogeneous
//! backend variants, not a fixed L1/L2/L3 ladder, so there is no `CacheTier`
//! enum to reuse — a plain `String` identifies the tier instead).

use crate::block::BlockAddress;
use serde::{Deserialize, Serialize};

/// Events emitted by the cache hierarchy for monitoring and observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheEvent {
    Hit {
        addr: BlockAddress,
        tier: String,
    },
    Miss {
        addr: BlockAddress,
    },
    Reserve {
        addr: BlockAddress,
        tier: String,
        prefetched: u32,
    },
    Evict {
        addr: BlockAddress,
        tier: String,
        reason: EvictionReason,
    },
    WriteBack {
        addr: BlockAddress,
        tier: String,
        size_bytes: u64,
    },
    WastedFetch {
        addr: BlockAddress,
        tier: String,
    },
    PrefetchComplete {
        blocks_requested: usize,
        blocks_loaded: usize,
        bytes_loaded: u64,
    },
    TierUnavailable {
        tier: String,
        reason: String,
    },
    TierRecovered {
        tier: String,
    },
    CompressionFailed {
        addr: BlockAddress,
        algorithm: String,
        error: String,
    },
    StatsSnapshot {
        tier: String,
        hits: u64,
        misses: u64,
        evictions: u64,
        wasted_fetches: u64,
    },
}

/// Reason a slot was reclaimed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EvictionReason {
    /// No EMPTY slot was available; a victim with `activeCnt == 0` was chosen.
    Capacity,
    /// The file owning the slot was closed.
    FileClosed,
    /// Manual eviction request (admin/test tooling).
    Manual,
}

impl std::fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionReason::Capacity => write!(f, "capacity"),
            EvictionReason::FileClosed => write!(f, "file_closed"),
            EvictionReason::Manual => write!(f, "manual"),
        }
    }
}

impl CacheEvent {
    pub fn addr(&self) -> Option<BlockAddress> {
        match self {
            CacheEvent::Hit { addr, .. }
            | CacheEvent::Miss { addr }
            | CacheEvent::Reserve { addr, .. }
            | CacheEvent::Evict { addr, .. }
            | CacheEvent::WriteBack { addr, .. }
            | CacheEvent::WastedFetch { addr, .. }
            | CacheEvent::CompressionFailed { addr, .. } => Some(*addr),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            CacheEvent::TierUnavailable { .. } | CacheEvent::CompressionFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_addr_accessor() {
        let addr = BlockAddress::new(1, 2);
        let hit = CacheEvent::Hit { addr, tier: "l1-mem".into() };
        assert_eq!(hit.addr(), Some(addr));
        assert!(!hit.is_error());

        let unavailable = CacheEvent::TierUnavailable {
            tier: "l3-filelock".into(),
            reason: "disk full".into(),
        };
        assert!(unavailable.is_error());
    }

    #[test]
    fn test_eviction_reason_display() {
        assert_eq!(format!("{}", EvictionReason::Capacity), "capacity");
        assert_eq!(format!("{}", EvictionReason::FileClosed), "file_closed");
    }
}
