//! Lifecycle of the running proxy.
//!
//! The orchestrator owns at most one [`ServiceGraph`] at a time and replaces
//! it wholesale on every accepted config change. Readers load the current
//! graph through an [`ArcSwapOption`], so a request never observes a half
//! built generation.
use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwapOption;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ConfigSnapshot,
    core::session::{SWEEP_INTERVAL, SessionTracker},
    error::ProxyError,
    ports::config_provider::ConfigWatch,
    service::graph::ServiceGraph,
    tracing_setup::LogHandle,
    utils::graceful_shutdown::{GracefulShutdown, ShutdownReason},
};

/// Grace period between "last client left" and the actual shutdown.
pub const EMPTY_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Reloading,
    Draining,
}

pub struct Orchestrator {
    sessions: Arc<SessionTracker>,
    graph: ArcSwapOption<ServiceGraph>,
    state_tx: watch::Sender<ServiceState>,
    log: Option<LogHandle>,
    shutdown: GracefulShutdown,
    sweeper: CancellationToken,
    /// Serializes start, reload and stop.
    lifecycle: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        sessions: Arc<SessionTracker>,
        shutdown: GracefulShutdown,
        log: Option<LogHandle>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ServiceState::Stopped);
        Arc::new(Self {
            sessions,
            graph: ArcSwapOption::empty(),
            state_tx,
            log,
            shutdown,
            sweeper: CancellationToken::new(),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    /// Shut the process down once the last client session is gone and stays
    /// gone for [`EMPTY_GRACE`].
    pub fn install_auto_shutdown(&self) {
        self.install_auto_shutdown_with(EMPTY_GRACE);
    }

    pub fn install_auto_shutdown_with(&self, grace: Duration) {
        let sessions = Arc::downgrade(&self.sessions);
        let shutdown = self.shutdown.clone();
        self.sessions.set_on_empty(Arc::new(move || {
            let sessions = sessions.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tracing::info!(
                    "No clients left, shutting down in {:?} unless one reconnects",
                    grace
                );
                tokio::time::sleep(grace).await;
                let Some(sessions) = sessions.upgrade() else {
                    return;
                };
                let remaining = sessions.count();
                if remaining == 0 {
                    shutdown.trigger_shutdown(ShutdownReason::ClientsGone);
                } else {
                    tracing::info!("{} client(s) reconnected, staying up", remaining);
                }
            });
        }));
    }

    /// Shut down now if no client session is registered.
    ///
    /// The empty callback only fires when the last session leaves, so a
    /// tracker that never held one needs this call to stop.
    pub fn shutdown_if_idle(&self) -> bool {
        if self.sessions.count() > 0 {
            return false;
        }
        tracing::info!("No clients registered, shutting down");
        self.shutdown.trigger_shutdown(ShutdownReason::ClientsGone);
        true
    }

    /// Start the first graph and the session sweeper.
    pub async fn start(&self, snapshot: Arc<ConfigSnapshot>) -> Result<(), ProxyError> {
        let _guard = self.lifecycle.lock().await;
        self.start_locked(snapshot).await?;

        tokio::spawn(
            self.sessions
                .clone()
                .run_sweeper(SWEEP_INTERVAL, self.sweeper.child_token()),
        );
        Ok(())
    }

    async fn start_locked(&self, snapshot: Arc<ConfigSnapshot>) -> Result<(), ProxyError> {
        self.state_tx.send_replace(ServiceState::Starting);
        if let Some(log) = &self.log {
            log.set_level(&snapshot.log_level);
        }

        match ServiceGraph::start(snapshot, self.sessions.clone()).await {
            Ok(graph) => {
                tracing::info!(
                    "ccenv running: api http://{} status http://{}",
                    graph.api_addr(),
                    graph.status_addr()
                );
                self.graph.store(Some(Arc::new(graph)));
                self.state_tx.send_replace(ServiceState::Running);
                Ok(())
            }
            Err(e) => {
                self.state_tx.send_replace(ServiceState::Stopped);
                Err(e)
            }
        }
    }

    /// Replace the running graph with one built from `snapshot`.
    ///
    /// On failure the service stays stopped until the next successful reload.
    pub async fn reload(&self, snapshot: Arc<ConfigSnapshot>) -> Result<(), ProxyError> {
        let _guard = self.lifecycle.lock().await;
        if self.shutdown.is_shutdown_initiated() {
            tracing::debug!("Shutdown in progress, ignoring reload");
            return Ok(());
        }

        tracing::info!("Configuration changed, rebuilding service");
        self.state_tx.send_replace(ServiceState::Reloading);
        if let Some(old) = self.graph.swap(None) {
            if let Err(e) = old.shutdown().await {
                tracing::warn!("Previous service did not stop cleanly: {}", e);
            }
        }

        let result = self.start_locked(snapshot).await;
        if let Err(e) = &result {
            tracing::error!(
                "Failed to start service after reload: {}. Service stays stopped until the next valid configuration",
                e
            );
        }
        result
    }

    /// Drain and stop the running graph and the sweeper.
    pub async fn stop(&self) -> Result<(), ProxyError> {
        let _guard = self.lifecycle.lock().await;
        self.sweeper.cancel();

        let Some(graph) = self.graph.swap(None) else {
            self.state_tx.send_replace(ServiceState::Stopped);
            return Ok(());
        };
        self.state_tx.send_replace(ServiceState::Draining);
        let result = graph.shutdown().await;
        self.state_tx.send_replace(ServiceState::Stopped);
        tracing::info!("Service stopped");
        result
    }

    /// Drive the service: apply config updates until shutdown is triggered,
    /// then stop everything and close logging.
    pub async fn run(&self, watch: Option<ConfigWatch>) -> ShutdownReason {
        let (mut snapshots, mut errors) = match watch {
            Some(watch) => (Some(watch.snapshots), Some(watch.errors)),
            None => (None, None),
        };

        let reason = loop {
            tokio::select! {
                reason = self.shutdown.wait_for_shutdown_signal() => break reason,
                Some(snapshot) = recv_or_pending(&mut snapshots) => {
                    // Failure is logged inside; keep waiting for the next change.
                    let _ = self.reload(snapshot).await;
                }
                Some(err) = recv_or_pending(&mut errors) => {
                    tracing::warn!("Ignoring invalid configuration change: {}", err);
                }
            }
        };

        tracing::info!("Shutting down: {:?}", reason);
        if let Err(e) = self.stop().await {
            tracing::error!("Error while stopping service: {}", e);
        }
        if let Some(log) = &self.log {
            log.shutdown();
        }
        reason
    }

    pub fn current(&self) -> Option<Arc<ServiceGraph>> {
        self.graph.load_full()
    }

    pub fn state(&self) -> ServiceState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.state_tx.subscribe()
    }

    pub fn sessions(&self) -> &Arc<SessionTracker> {
        &self.sessions
    }

    pub fn shutdown_handle(&self) -> &GracefulShutdown {
        &self.shutdown
    }
}

/// Receive from an optional channel. A missing or closed channel never
/// resolves, so its `select!` branch goes quiet.
async fn recv_or_pending<T>(rx: &mut Option<tokio::sync::mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(inner) => match inner.recv().await {
            Some(value) => Some(value),
            None => {
                *rx = None;
                std::future::pending().await
            }
        },
        None => std::future::pending().await,
    }
}
