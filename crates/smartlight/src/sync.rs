use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

/// Lock a std mutex, recovering the guard if a previous holder panicked.
///
/// Critical sections in this crate never leave their data half-written.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
