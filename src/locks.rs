// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Resilient lock helpers for the shared download pool.
//!
//! The pool is touched by request handlers, job watchers, transfer monitors
//! and the queue drain. If any of those panics while holding the pool lock,
//! the lock is poisoned; these helpers log the event and hand back the guard
//! instead of taking the whole engine down with it.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::RwLock;
//! use mediafetch::locks::{resilient_read, resilient_write};
//!
//! let lock = RwLock::new(42);
//! let guard = resilient_read(&lock);
//! println!("Value: {}", *guard);
//! drop(guard);
//!
//! let mut guard = resilient_write(&lock);
//! *guard = 100;
//! ```
//!
//! Guards must never be held across an `.await`.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "mediafetch::locks",
                event = "LOCK_POISONED_READ",
                "Pool lock was poisoned during read acquisition. Recovering data; \
                 a task panicked while mutating the pool."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "mediafetch::locks",
                event = "LOCK_POISONED_WRITE",
                "Pool lock was poisoned during write acquisition. Recovering data; \
                 a task panicked while mutating the pool."
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_resilient_write_then_read() {
        let lock = RwLock::new(vec![1, 2]);
        resilient_write(&lock).push(3);
        assert_eq!(*resilient_read(&lock), vec![1, 2, 3]);
    }

    #[test]
    fn test_recovers_after_poisoned_write() {
        let lock = Arc::new(RwLock::new(7));
        let lock_clone = Arc::clone(&lock);

        let handle = thread::spawn(move || {
            let _guard = lock_clone.write().unwrap();
            panic!("intentional panic to poison lock");
        });
        let _ = handle.join();

        assert!(lock.is_poisoned());
        *resilient_write(&lock) = 8;
        assert_eq!(*resilient_read(&lock), 8);
    }
}
