//! The stop flag shared by the signal handler and the run loop.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// A one-shot stop request.
///
/// The first [`CancellationToken::cancel`] wins and records why the run is stopping;
/// later calls change nothing. The token never interrupts work: the run loop
/// polls [`CancellationToken::is_cancelled`] between items, and sleeping code can
/// race [`CancellationToken::cancelled`] against its timer.
#[derive(Default)]
pub struct CancellationToken {
    stopped: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl CancellationToken {
    /// Creates a token that has not been signalled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a stop. Returns `true` only for the call that flipped the flag.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let mut slot = self.reason.lock();
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        *slot = Some(reason.into());
        drop(slot);
        self.notify.notify_waiters();
        true
    }

    /// True once a stop was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Why the stop was requested.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Resolves once a stop has been requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a cancel in between is not missed.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("stopped", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_fresh_token() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert_eq!(token.reason(), None);
    }

    #[test]
    fn test_first_reason_wins() {
        let token = CancellationToken::new();
        assert!(token.cancel("SIGINT"));
        assert!(!token.cancel("SIGTERM"));

        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("SIGINT"));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = Arc::new(CancellationToken::new());
        let waiter = {
            let token = Arc::clone(&token);
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel("SIGTERM");

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter woke up")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_at_once_when_already_stopped() {
        let token = CancellationToken::new();
        token.cancel("test");
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .unwrap();
    }
}
