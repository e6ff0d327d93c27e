//! Lock helpers.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `mutex`, recovering the data if a callback panicked while holding it.
///
/// Critical sections in this crate never span an `.await` and leave the
/// guarded state consistent at every exit, so a poisoned lock is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
