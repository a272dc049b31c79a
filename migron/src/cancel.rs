//! Cooperative cancellation for long-running migration operations.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::Error;

type Callback = Box<dyn FnOnce() + Send>;

/// A cloneable cancellation token.
///
/// Operations observe cancellation at their next checkpoint via [`check`](CancelToken::check).
/// Work already in flight can be interrupted through [`on_cancel`](CancelToken::on_cancel)
/// callbacks; the PostgreSQL driver uses one to cancel the active query server-side.
///
/// Cloning is cheap and all clones observe the same cancellation.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    canceled: AtomicBool,
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback)>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh token with no canceling party, for scopes that must run to
    /// completion (the dirty-flag writes around a migration step).
    pub fn never() -> Self {
        Self::default()
    }

    /// Request cancellation. Registered callbacks fire exactly once, on the
    /// calling thread.
    pub fn cancel(&self) {
        if self.inner.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        for (_, callback) in self.take_callbacks() {
            callback();
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Returns [`Error::Canceled`] if cancellation has been requested.
    pub fn check(&self) -> Result<(), Error> {
        if self.is_canceled() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }

    /// Register a callback fired once when the token is canceled. The callback
    /// is deregistered when the returned guard drops. If the token is already
    /// canceled the callback fires immediately.
    pub fn on_cancel(&self, callback: impl FnOnce() + Send + 'static) -> CancelGuard {
        if self.is_canceled() {
            callback();
            return CancelGuard {
                inner: Arc::clone(&self.inner),
                id: 0,
            };
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.callbacks_guard().push((id, Box::new(callback)));
        // A cancel may have raced the registration above; drain so the
        // callback cannot be lost.
        if self.is_canceled() {
            for (_, callback) in self.take_callbacks() {
                callback();
            }
        }
        CancelGuard {
            inner: Arc::clone(&self.inner),
            id,
        }
    }

    fn callbacks_guard(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Callback)>> {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn take_callbacks(&self) -> Vec<(u64, Callback)> {
        std::mem::take(&mut *self.callbacks_guard())
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// Deregisters an [`on_cancel`](CancelToken::on_cancel) callback on drop.
pub struct CancelGuard {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        let mut callbacks = self
            .inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        callbacks.retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn starts_uncanceled() {
        let token = CancelToken::new();
        assert!(!token.is_canceled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn cancel_is_observed_by_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_canceled());
        assert!(matches!(clone.check(), Err(Error::Canceled)));
    }

    #[test]
    fn callback_fires_once_on_cancel() {
        let token = CancelToken::new();
        let fired = Arc::new(AtomicU32::new(0));
        let observed = Arc::clone(&fired);
        let _guard = token.on_cancel(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        token.cancel();
        token.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_fires_immediately_when_already_canceled() {
        let token = CancelToken::new();
        token.cancel();
        let fired = Arc::new(AtomicU32::new(0));
        let observed = Arc::clone(&fired);
        let _guard = token.on_cancel(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_guard_deregisters_callback() {
        let token = CancelToken::new();
        let fired = Arc::new(AtomicU32::new(0));
        let observed = Arc::clone(&fired);
        let guard = token.on_cancel(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        drop(guard);
        token.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
