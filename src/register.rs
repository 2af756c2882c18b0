//! FileCacheRegister (C9): process-global `path -> FileIndex` mapping
//!
//! Sharded the same way the hardware node registry shards by `NodeId`, just
//! keyed by path instead: a fixed array of locked shards, each hashed to by
//! the path, so registration of unrelated files never contends. Indices are
//! assigned from a single monotonic counter and are never reused, matching
//! the register's "idempotent, append-only" contract.

use crate::block::FileIndex;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

const NUM_SHARDS: usize = 64;

fn shard_of(path: &str) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    path.hash(&mut hasher);
    (hasher.finish() as usize) % NUM_SHARDS
}

#[derive(Default)]
struct Shard {
    by_path: HashMap<String, FileIndex>,
    by_index: HashMap<u32, String>,
}

/// Process-global (and, via `FileCacheRegister::path` on disk, cross-process
/// inspectable) registry of known files.
pub struct FileCacheRegister {
    shards: Box<[RwLock<Shard>; NUM_SHARDS]>,
    next_index: AtomicU32,
}

impl FileCacheRegister {
    pub fn new() -> Self {
        let shards: Vec<RwLock<Shard>> = (0..NUM_SHARDS).map(|_| RwLock::new(Shard::default())).collect();
        Self {
            shards: shards.try_into().ok().expect("fixed NUM_SHARDS"),
            // Zero is reserved for "no file" (§3), so indices start at 1.
            next_index: AtomicU32::new(1),
        }
    }

    /// Register `path`, returning its stable index. Re-registering the same
    /// path returns the same index (idempotent).
    pub fn register(&self, path: &str) -> Result<FileIndex> {
        let shard_id = shard_of(path);
        {
            let shard = self.shards[shard_id].read().expect("register shard poisoned");
            if let Some(&idx) = shard.by_path.get(path) {
                return Ok(idx);
            }
        }

        let mut shard = self.shards[shard_id].write().expect("register shard poisoned");
        if let Some(&idx) = shard.by_path.get(path) {
            return Ok(idx);
        }

        let raw = self.next_index.fetch_add(1, Ordering::AcqRel);
        if raw == 0 {
            return Err(Error::FileIndexExhausted);
        }
        let index = FileIndex(raw);
        shard.by_path.insert(path.to_string(), index);
        shard.by_index.insert(raw, path.to_string());
        Ok(index)
    }

    pub fn lookup(&self, path: &str) -> Option<FileIndex> {
        let shard = self.shards[shard_of(path)].read().expect("register shard poisoned");
        shard.by_path.get(path).copied()
    }

    /// Reverse lookup, used by logging and stats to name a `FileIndex`.
    pub fn path_of(&self, index: FileIndex) -> Option<String> {
        for shard in self.shards.iter() {
            let shard = shard.read().expect("register shard poisoned");
            if let Some(path) = shard.by_index.get(&index.0) {
                return Some(path.clone());
            }
        }
        None
    }
}

impl Default for FileCacheRegister {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        let register = FileCacheRegister::new();
        let a = register.register("/data/run1.bin").unwrap();
        let b = register.register("/data/run1.bin").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_paths_get_distinct_indices() {
        let register = FileCacheRegister::new();
        let a = register.register("/data/a").unwrap();
        let b = register.register("/data/b").unwrap();
        assert_ne!(a, b);
        assert_eq!(register.path_of(a).as_deref(), Some("/data/a"));
    }

    #[test]
    fn test_lookup_before_register_is_none() {
        let register = FileCacheRegister::new();
        assert!(register.lookup("/data/missing").is_none());
    }
}
