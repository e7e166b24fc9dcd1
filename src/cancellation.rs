//! Cooperative cancellation token.
//!
//! A [`Cancellation`] is passed into every dispatch. Handlers, middleware and
//! transports that suspend should either poll [`Cancellation::is_cancelled`]
//! or race their work against [`Cancellation::cancelled`]. Clones share the
//! same state; cancelling any clone cancels all of them.
//!
//! # Example
//!
//! ```
//! use conqueror::Cancellation;
//!
//! let token = Cancellation::new();
//! let child = token.clone();
//! assert!(token.cancel());
//! assert!(child.is_cancelled());
//! assert!(!token.cancel());
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{ConquerorError, Result};

/// Shared cancellation flag with async notification.
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
}

#[derive(Debug, Default)]
struct CancellationState {
    flag: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    /// Create a token in the "not cancelled" state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the token has been cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// Cancel the token and wake every waiter.
    ///
    /// Returns `true` if this call performed the cancellation, `false` if the
    /// token was already cancelled.
    pub fn cancel(&self) -> bool {
        let first = self
            .inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel is not missed.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Return `Err(Cancelled)` if the token is cancelled.
    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ConquerorError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Drive `future` to completion unless the token fires first.
    ///
    /// When the token wins, `future` is dropped, which aborts any in-flight
    /// I/O it owns, and `Err(Cancelled)` is returned.
    pub async fn run<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(ConquerorError::Cancelled),
            out = future => out,
        }
    }

    /// Sleep for `duration`, or return `Err(Cancelled)` as soon as the token fires.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_token_is_not_cancelled() {
        let token = Cancellation::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let token = Cancellation::new();
        let clone = token.clone();

        assert!(clone.cancel());
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(ConquerorError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = Cancellation::new();
        let waiter = token.clone();

        let task = tokio::spawn(async move { waiter.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_returns_cancelled_when_token_fires() {
        let token = Cancellation::new();
        let trigger = token.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result: Result<()> = token
            .run(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(ConquerorError::Cancelled)));
    }

    #[tokio::test]
    async fn test_run_passes_through_result() {
        let token = Cancellation::new();
        let result = token.run(async { Ok(7) }).await.unwrap();
        assert_eq!(result, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_when_not_cancelled() {
        let token = Cancellation::new();
        assert!(token.sleep(Duration::from_secs(5)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_is_cut_short_by_cancel() {
        let token = Cancellation::new();
        let trigger = token.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let result = token.sleep(Duration::from_secs(60)).await;
        assert!(matches!(result, Err(ConquerorError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(60));
    }
}
