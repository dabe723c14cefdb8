use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::{signal, sync::watch};

/// Represents different shutdown reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Operator asked to stop (SIGTERM, SIGINT)
    Signal,
    /// The last client session went away and did not come back
    ClientsGone,
    /// Shutdown forced by the embedding code
    Force,
}

/// Process-level shutdown trigger shared by the signal handler, the session
/// tracker and the orchestrator.
///
/// The first trigger wins; the reason stays observable for late subscribers.
#[derive(Debug, Clone)]
pub struct GracefulShutdown {
    shutdown_tx: Arc<watch::Sender<Option<ShutdownReason>>>,
    shutdown_initiated: Arc<AtomicBool>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(None);
        Self {
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check if shutdown has been initiated
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Relaxed)
    }

    /// Trigger shutdown. Returns `false` if it was already initiated.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) -> bool {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!("Shutdown triggered: {:?}", reason);
            self.shutdown_tx.send_replace(Some(reason));
            true
        } else {
            tracing::debug!("Shutdown already initiated, ignoring {:?}", reason);
            false
        }
    }

    /// Listen for SIGINT / SIGTERM and trigger a shutdown on the first one.
    pub async fn run_signal_handler(&self) {
        tracing::debug!("Signal handler started. Listening for SIGTERM and SIGINT");

        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => {
                        tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...")
                    }
                    Err(e) => {
                        tracing::error!("Failed to listen for Ctrl+C: {}", e);
                        return;
                    }
                }
            }
            _ = wait_for_sigterm() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.wait_for_shutdown_signal() => return,
        }

        self.trigger_shutdown(ShutdownReason::Signal);
    }

    /// Wait until shutdown is triggered and return its reason.
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        let mut receiver = self.shutdown_tx.subscribe();
        match receiver.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).unwrap_or(ShutdownReason::Force),
            Err(_) => ShutdownReason::Force,
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix systems, we only have Ctrl+C
    std::future::pending::<()>().await;
}
