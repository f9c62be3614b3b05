//! Shutdown signal handling
//!
//! The runtime tears every module down when the process is asked to stop.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Which signal ended the wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Terminate,
    Interrupt,
    /// No handler could be installed; the wait ended without a signal
    Unavailable,
}

#[cfg(unix)]
async fn next_signal() -> ShutdownSignal {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut terminate, mut interrupt) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(t), Ok(i)) => (t, i),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Signal handlers unavailable ({}), falling back to Ctrl+C", e);
                return ctrl_c().await;
            }
        };

    tokio::select! {
        _ = terminate.recv() => ShutdownSignal::Terminate,
        _ = interrupt.recv() => ShutdownSignal::Interrupt,
    }
}

#[cfg(not(unix))]
async fn next_signal() -> ShutdownSignal {
    ctrl_c().await
}

async fn ctrl_c() -> ShutdownSignal {
    match tokio::signal::ctrl_c().await {
        Ok(()) => ShutdownSignal::Interrupt,
        Err(e) => {
            warn!("Failed to listen for Ctrl+C: {}", e);
            ShutdownSignal::Unavailable
        }
    }
}

/// Wait for SIGTERM, SIGINT or Ctrl+C
pub async fn wait_for_shutdown_signal() -> ShutdownSignal {
    let received = next_signal().await;
    info!("Received {:?}, deactivating modules", received);
    received
}

/// Token cancelled once a shutdown signal arrives
///
/// Hosts embedding the runtime next to other services can select on the
/// token instead of owning the signal wait themselves.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if wait_for_shutdown_signal().await != ShutdownSignal::Unavailable {
            trigger.cancel();
        }
    });
    token
}
