//! Lock helpers.
//!
//! Every component owns a single `RwLock` domain. A panic while holding a
//! guard leaves container membership consistent (entries are inserted or
//! removed whole), so a poisoned lock is recovered rather than propagated.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
