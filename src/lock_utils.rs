//! Mutex helpers for the in-process stores.
//!
//! A panic while holding the memory cache lock leaves at worst one stale rate counter,
//! so that store keeps going. The SQLite log refuses to continue instead and reports
//! `TrapError::LockPoisoned`.

use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::error;

use crate::error::{TrapError, TrapResult};

/// Lock `mutex`, taking over the data if a previous holder panicked
pub fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, store: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned: PoisonError<MutexGuard<'a, T>>| {
        error!("Lock for {} was poisoned, continuing with its last state", store);
        poisoned.into_inner()
    })
}

/// Lock `mutex`, or fail with `TrapError::LockPoisoned` naming the store
pub fn lock_or_fail<'a, T>(mutex: &'a Mutex<T>, store: &str) -> TrapResult<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| {
        error!("Lock for {} was poisoned, rejecting operation", store);
        TrapError::LockPoisoned(store.to_string())
    })
}
