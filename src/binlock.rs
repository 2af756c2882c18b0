//! Per-bin reader/writer locks
//!
//! Gives set-granular concurrency: two requests whose `BlockAddress` hash to
//! different bins never contend, while operations within one bin are
//! serialized by a single `parking_lot::RwLock`. This is the same sharded
//! lock-array shape the registry uses for its 256 shards, narrowed to
//! whatever `num_bins` a tier was constructed with.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// An array of `num_bins` independent reader/writer locks, one per bin.
pub struct BinLockTable {
    locks: Vec<RwLock<()>>,
}

impl BinLockTable {
    pub fn new(num_bins: usize) -> Self {
        assert!(num_bins > 0, "a tier must have at least one bin");
        let locks = (0..num_bins).map(|_| RwLock::new(())).collect();
        Self { locks }
    }

    pub fn num_bins(&self) -> usize {
        self.locks.len()
    }

    /// Acquire the reader lock for `bin_index`. Brief hold expected (§5).
    pub fn read(&self, bin_index: usize) -> RwLockReadGuard<'_, ()> {
        self.locks[bin_index].read()
    }

    /// Acquire the writer lock for `bin_index`.
    pub fn write(&self, bin_index: usize) -> RwLockWriteGuard<'_, ()> {
        self.locks[bin_index].write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_independent_bins_do_not_block() {
        let table = Arc::new(BinLockTable::new(4));
        let t1 = {
            let table = table.clone();
            thread::spawn(move || {
                let _g = table.write(0);
                thread::sleep(std::time::Duration::from_millis(20));
            })
        };
        // Bin 1's writer lock must be obtainable immediately, independent of bin 0.
        thread::sleep(std::time::Duration::from_millis(5));
        let _g = table.write(1);
        t1.join().unwrap();
    }

    #[test]
    #[should_panic]
    fn test_zero_bins_panics() {
        let _ = BinLockTable::new(0);
    }
}
