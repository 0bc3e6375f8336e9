//! Signal-driven shutdown.
//!
//! The first SIGINT or SIGTERM cancels the shared token and logs one warning;
//! the item in flight is allowed to finish. Later signals are ignored.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::CancellationToken;

/// Owns the background task that listens for termination signals.
///
/// Dropping the coordinator stops listening.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    token: Arc<CancellationToken>,
    handle: JoinHandle<()>,
}

impl ShutdownCoordinator {
    /// Spawns the signal listener. Must be called inside a tokio runtime.
    #[must_use]
    pub fn install(token: Arc<CancellationToken>) -> Self {
        let listener_token = Arc::clone(&token);
        let handle = tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    res = tokio::signal::ctrl_c() => match res {
                        Ok(()) => "SIGINT",
                        Err(e) => {
                            warn!(error = %e, "failed to listen for SIGINT");
                            return;
                        }
                    },
                    name = wait_for_sigterm() => name,
                };
                Self::request(&listener_token, signal);
            }
        });
        Self { token, handle }
    }

    /// The token this coordinator cancels.
    #[must_use]
    pub fn token(&self) -> &Arc<CancellationToken> {
        &self.token
    }

    /// Handles one signal delivery. Returns `true` for the first request.
    fn request(token: &CancellationToken, signal: &str) -> bool {
        if token.cancel(signal) {
            warn!(
                signal,
                "shutdown requested; finishing the current item"
            );
            true
        } else {
            debug!(signal, "shutdown already requested");
            false
        }
    }
}

impl Drop for ShutdownCoordinator {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
            "SIGTERM"
        }
        Err(e) => {
            warn!(error = %e, "failed to register SIGTERM handler");
            std::future::pending().await
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> &'static str {
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that install a listener share process-wide signal state.
    static SIGNALS: parking_lot::Mutex<()> = parking_lot::const_mutex(());

    #[tokio::test]
    async fn test_install_does_not_cancel() {
        let _serial = SIGNALS.lock();
        let token = Arc::new(CancellationToken::new());
        let coordinator = ShutdownCoordinator::install(Arc::clone(&token));

        tokio::task::yield_now().await;
        assert!(!coordinator.token().is_cancelled());
    }

    #[test]
    fn test_second_signal_is_noop() {
        let token = CancellationToken::new();
        assert!(ShutdownCoordinator::request(&token, "SIGINT"));
        assert!(!ShutdownCoordinator::request(&token, "SIGTERM"));
        assert_eq!(token.reason(), Some("SIGINT".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_cancels_with_reason() {
        use std::time::Duration;
        use tokio::signal::unix::{signal, SignalKind};

        let _serial = SIGNALS.lock();
        // Keeps tokio's handler installed so the signal never falls through to
        // the default action.
        let _guard = signal(SignalKind::terminate()).unwrap();

        let token = Arc::new(CancellationToken::new());
        let _coordinator = ShutdownCoordinator::install(Arc::clone(&token));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let pid = std::process::id().to_string();
        for _ in 0..25 {
            let status = tokio::process::Command::new("kill")
                .args(["-TERM", &pid])
                .status()
                .await
                .unwrap();
            assert!(status.success());
            if tokio::time::timeout(Duration::from_millis(200), token.cancelled())
                .await
                .is_ok()
            {
                break;
            }
        }

        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("SIGTERM"));
    }
}
