//! Registry of local client processes sharing one running proxy.
//!
//! Clients register on start, heartbeat periodically and unregister on exit.
//! When the registry becomes empty, by unregistration or by the inactivity
//! sweep, the empty-callback is spawned onto the runtime. It is never called
//! inline, so it may freely query the tracker again.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const INACTIVITY_WINDOW: Duration = Duration::from_secs(5 * 60);
pub const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(3 * 60);

/// Invoked when the last session goes away.
pub type EmptyCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClientSession {
    pub id: String,
    #[serde(rename = "register_at")]
    pub registered_at: DateTime<Utc>,
    #[serde(rename = "last_ping")]
    pub last_heartbeat: DateTime<Utc>,
    pub pid: u32,
    pub hostname: String,
    #[serde(skip)]
    last_seen: Instant,
}

/// Body of `GET /ccenv/status`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub total_clients: usize,
    pub clients: HashMap<String, ClientSession>,
    pub server_time: DateTime<Utc>,
}

/// Body of the register, unregister and heartbeat calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRequest {
    pub client_id: String,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub hostname: String,
}

/// Answer to the register, unregister and heartbeat calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl SessionResponse {
    pub fn ok(message: impl Into<String>, count: usize) -> Self {
        Self {
            success: true,
            message: message.into(),
            count: Some(count),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            count: None,
        }
    }
}

pub struct SessionTracker {
    sessions: RwLock<HashMap<String, ClientSession>>,
    on_empty: Mutex<Option<EmptyCallback>>,
    inactivity_window: Duration,
}

impl std::fmt::Debug for SessionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTracker")
            .field("count", &self.count())
            .field("inactivity_window", &self.inactivity_window)
            .finish()
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::with_inactivity_window(INACTIVITY_WINDOW)
    }

    pub fn with_inactivity_window(inactivity_window: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            on_empty: Mutex::new(None),
            inactivity_window,
        }
    }

    pub fn set_on_empty(&self, callback: EmptyCallback) {
        *self.on_empty.lock().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// Adds or refreshes a session and returns the resulting count.
    pub fn register(&self, id: &str, pid: u32, hostname: &str) -> usize {
        let now = Utc::now();
        let session = ClientSession {
            id: id.to_string(),
            registered_at: now,
            last_heartbeat: now,
            pid,
            hostname: hostname.to_string(),
            last_seen: Instant::now(),
        };

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.insert(id.to_string(), session);
        let count = sessions.len();
        tracing::info!(
            client_id = %id,
            pid,
            hostname = %hostname,
            active = count,
            "Client registered"
        );
        count
    }

    /// Refreshes a known session. Unknown ids return `false` and create nothing.
    pub fn heartbeat(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get_mut(id) {
            Some(session) => {
                session.last_heartbeat = Utc::now();
                session.last_seen = Instant::now();
                tracing::trace!(client_id = %id, "Client heartbeat");
                true
            }
            None => {
                tracing::debug!(client_id = %id, "Heartbeat from unknown client");
                false
            }
        }
    }

    pub fn unregister(&self, id: &str) -> bool {
        let (removed, remaining) = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let removed = sessions.remove(id).is_some();
            (removed, sessions.len())
        };

        if removed {
            tracing::info!(client_id = %id, active = remaining, "Client unregistered");
            if remaining == 0 {
                self.fire_on_empty();
            }
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn get(&self, id: &str) -> Option<ClientSession> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn list_all(&self) -> HashMap<String, ClientSession> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn status(&self) -> SessionStatus {
        let clients = self.list_all();
        SessionStatus {
            total_clients: clients.len(),
            clients,
            server_time: Utc::now(),
        }
    }

    /// Drops sessions idle for longer than the inactivity window.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let (removed, remaining) = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let before = sessions.len();
            sessions.retain(|id, session| {
                let keep = now.duration_since(session.last_seen) <= self.inactivity_window;
                if !keep {
                    tracing::info!(client_id = %id, pid = session.pid, "Removing inactive client");
                }
                keep
            });
            (before - sessions.len(), sessions.len())
        };

        if removed > 0 && remaining == 0 {
            self.fire_on_empty();
        }
        removed
    }

    fn fire_on_empty(&self) {
        let callback = self
            .on_empty
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(callback) = callback else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { callback() });
            }
            Err(_) => tracing::warn!("No runtime available to run the empty-session callback"),
        }
    }

    /// Periodic sweep loop. Runs until `cancel` fires.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut sweep_tick = tokio::time::interval_at(Instant::now() + interval, interval);
        let mut status_tick =
            tokio::time::interval_at(Instant::now() + STATUS_LOG_INTERVAL, STATUS_LOG_INTERVAL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Session sweeper stopped");
                    return;
                }
                _ = sweep_tick.tick() => {
                    let removed = self.sweep();
                    if removed > 0 {
                        tracing::debug!(removed, "Session sweep completed");
                    }
                }
                _ = status_tick.tick() => {
                    tracing::info!(active = self.count(), "Active client sessions");
                }
            }
        }
    }
}
