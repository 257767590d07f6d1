//! Graceful shutdown
//!
//! Services hand a [`CancellationToken`] to their long-running loops; the
//! token trips on Ctrl+C, or SIGTERM on Unix.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for Ctrl+C (and SIGTERM on Unix)
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!("SIGTERM handler unavailable: {} - only Ctrl+C stops the service", e);
                None
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                match term_signal {
                    Some(mut sig) => {
                        sig.recv().await;
                    },
                    None => std::future::pending::<()>().await,
                }
            } => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Token cancelled by the first shutdown signal
///
/// Must be called inside a tokio runtime.
pub fn cancel_on_shutdown() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_shutdown() => {
                info!("Shutdown signal received");
                trigger.cancel();
            },
            _ = trigger.cancelled() => {},
        }
    });
    token
}
