// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant lock helpers.
//!
//! A panic while a guard is held marks the lock as poisoned. The data behind
//! our locks (queue bookkeeping, the cache index, event rings) is always left
//! in a usable state between statements, so a poisoned lock is logged and the
//! guard is recovered instead of taking the whole server down with it.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "reelcache::locks",
                event = "LOCK_POISONED_READ",
                "RwLock was poisoned during read acquisition, recovering data"
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "reelcache::locks",
                event = "LOCK_POISONED_WRITE",
                "RwLock was poisoned during write acquisition, recovering data"
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a mutex, recovering from poisoning.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "reelcache::locks",
                event = "LOCK_POISONED_MUTEX",
                "Mutex was poisoned, recovering data"
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
        let lock = RwLock::new(42);
        {
            let mut guard = resilient_write(&lock);
            *guard = 100;
        }
        assert_eq!(*resilient_read(&lock), 100);
    }

    #[test]
    fn test_resilient_read_poisoned() {
        let lock = Arc::new(RwLock::new(42));
        let lock_clone = Arc::clone(&lock);

        let handle = thread::spawn(move || {
            let _guard = lock_clone.write().unwrap();
            panic!("intentional panic to poison lock");
        });
        let _ = handle.join();

        assert_eq!(*resilient_read(&lock), 42);
    }

    #[test]
    fn test_resilient_lock_poisoned() {
        let lock = Arc::new(Mutex::new(vec![1, 2]));
        let lock_clone = Arc::clone(&lock);

        let handle = thread::spawn(move || {
            let mut guard = lock_clone.lock().unwrap();
            guard.push(3);
            panic!("intentional panic to poison lock");
        });
        let _ = handle.join();

        let mut guard = resilient_lock(&lock);
        guard.push(4);
        assert_eq!(*guard, vec![1, 2, 3, 4]);
    }
}
