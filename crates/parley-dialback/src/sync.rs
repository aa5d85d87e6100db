//! Poison-tolerant lock helpers.
//!
//! All guarded state here is bookkeeping that stays consistent across a
//! panicked writer, so a poisoned lock is recovered rather than propagated.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("mutex poisoned, recovering inner state");
            poisoned.into_inner()
        }
    }
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("rwlock poisoned on read, recovering inner state");
            poisoned.into_inner()
        }
    }
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("rwlock poisoned on write, recovering inner state");
            poisoned.into_inner()
        }
    }
}
