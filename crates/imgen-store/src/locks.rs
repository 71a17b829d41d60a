//! In-process lock table.
//!
//! `RocksDB` has no row locks, so every read-modify-write takes the keys it
//! touches here first. A caller acquires all of its keys at once or waits;
//! holding a partial set is impossible, which rules out lock-order deadlocks
//! between, say, a job transition (job + account) and a payment completion
//! (intent + account). Writers on unrelated keys never wait on each other.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// A set of currently held keys plus a condition variable to wait on.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    held: Mutex<HashSet<Vec<u8>>>,
    released: Condvar,
}

impl KeyedLocks {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `key` is free, then hold it until the guard drops.
    pub fn lock(&self, key: Vec<u8>) -> KeyGuard<'_> {
        self.lock_many(vec![key])
    }

    /// Block until every key in `keys` is free, then hold them all until the
    /// guard drops.
    pub fn lock_many(&self, mut keys: Vec<Vec<u8>>) -> KeyGuard<'_> {
        keys.sort_unstable();
        keys.dedup();

        let mut held = self.table();
        while keys.iter().any(|key| held.contains(key)) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.extend(keys.iter().cloned());
        drop(held);

        KeyGuard { locks: self, keys }
    }

    /// Number of keys currently held.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.table().len()
    }

    // A panic while holding the table mutex cannot leave the set half-updated
    // (insert/remove are single operations), so poisoning is ignored.
    fn table(&self) -> MutexGuard<'_, HashSet<Vec<u8>>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases its keys on drop.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    locks: &'a KeyedLocks,
    keys: Vec<Vec<u8>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.table();
        for key in &self.keys {
            held.remove(key);
        }
        drop(held);
        self.locks.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn guard_releases_on_drop() {
        let locks = KeyedLocks::new();
        {
            let _guard = locks.lock_many(vec![b"a".to_vec(), b"b".to_vec(), b"a".to_vec()]);
            assert_eq!(locks.held_count(), 2);
        }
        assert_eq!(locks.held_count(), 0);
    }

    #[test]
    fn same_key_is_mutually_exclusive() {
        let locks = KeyedLocks::new();
        let inside = AtomicUsize::new(0);
        let max_inside = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..20 {
                        let _guard = locks.lock(b"acct".to_vec());
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_micros(50));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn overlapping_sets_in_opposite_order_do_not_deadlock() {
        let locks = KeyedLocks::new();
        std::thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..200 {
                    let _g = locks.lock_many(vec![b"x".to_vec(), b"y".to_vec()]);
                }
            });
            s.spawn(|| {
                for _ in 0..200 {
                    let _g = locks.lock_many(vec![b"y".to_vec(), b"x".to_vec()]);
                }
            });
        });
        assert_eq!(locks.held_count(), 0);
    }

    #[test]
    fn disjoint_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(b"a".to_vec());
        // Would hang if unrelated keys blocked each other.
        let _b = locks.lock(b"b".to_vec());
        assert_eq!(locks.held_count(), 2);
    }
}
