//! Multi-tier block cache substrate
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                       CacheHierarchy                            │
//! ├────────────────────────────────────────────────────────────────┤
//! │  ┌──────────┐  ┌───────────┐  ┌───────────┐  ┌──────────────┐  │
//! │  │ Memory   │  │ Shared    │  │ LocalFile │  │ Filelock /   │  │
//! │  │ (heap)   │  │ Memory    │  │           │  │ NetworkCache │  │
//! │  └────┬─────┘  └─────┬─────┘  └─────┬─────┘  └──────┬───────┘  │
//! │       └──────────────┴──────────────┴───────────────┘          │
//! │                     BoundedCache<B: CacheBackend>               │
//! │                  (admission, eviction, bin locks)               │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every tier shares one admission/eviction algorithm ([`bounded`]) over a
//! pluggable storage [`backend`]; [`hierarchy`] walks the ordered tier list
//! on miss and writes fetched blocks back upward.

pub mod backend;
pub mod bounded;
pub mod compression;
pub mod events;
pub mod hierarchy;
pub mod metrics;
pub mod network;

pub use backend::CacheBackend;
pub use bounded::{BoundedCache, BoundedCacheStats};
pub use compression::{CompressionAlgorithm, CompressionConfig, CompressionManager};
pub use events::{CacheEvent, EvictionReason};
pub use hierarchy::CacheHierarchy;
pub use metrics::{CacheMetrics, CacheStatsSnapshot, TierMetricsSnapshot};
pub use network::{ConnectionPool, NetworkCache};
