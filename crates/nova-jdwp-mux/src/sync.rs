use std::panic::Location;
use std::sync::{Mutex, MutexGuard};

/// Poison-tolerant locking for the short, non-async critical sections in this
/// crate (receiver registry, filter bookkeeping).
pub(crate) trait MutexExt<T> {
    fn lock_or_recover(&self, context: &'static str) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[track_caller]
    fn lock_or_recover(&self, context: &'static str) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|err| {
            let caller = Location::caller();
            tracing::error!(
                target: crate::LOG_TARGET,
                context,
                file = caller.file(),
                line = caller.line(),
                "mutex poisoned by a panicking holder; recovering guard"
            );
            err.into_inner()
        })
    }
}
