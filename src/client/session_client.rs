//! Client side of the `/ccenv/*` session protocol.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::session::{SessionRequest, SessionResponse};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SessionClientError {
    #[error("proxy unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("proxy rejected {call}: {message}")]
    Rejected { call: &'static str, message: String },
}

/// Best-effort host name without pulling in a platform crate.
pub fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// `ccenv_<hostname>_<pid>_<unix-seconds>`
pub fn generate_client_id(hostname: &str, pid: u32) -> String {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("ccenv_{hostname}_{pid}_{unix}")
}

#[derive(Debug, Clone)]
pub struct SessionClient {
    http: reqwest::Client,
    base_url: String,
    request: SessionRequest,
}

impl SessionClient {
    /// A client identifying as this process.
    pub fn new(base_url: impl Into<String>) -> Result<Self, SessionClientError> {
        let hostname = local_hostname();
        let pid = std::process::id();
        let client_id = generate_client_id(&hostname, pid);
        Self::with_identity(base_url, client_id, pid, hostname)
    }

    pub fn with_identity(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        pid: u32,
        hostname: impl Into<String>,
    ) -> Result<Self, SessionClientError> {
        // The proxy is local; never route session calls through HTTP_PROXY.
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request: SessionRequest {
                client_id: client_id.into(),
                pid,
                hostname: hostname.into(),
            },
        })
    }

    pub fn client_id(&self) -> &str {
        &self.request.client_id
    }

    async fn call(&self, call: &'static str) -> Result<SessionResponse, SessionClientError> {
        let response = self
            .http
            .post(format!("{}/ccenv/{}", self.base_url, call))
            .json(&self.request)
            .send()
            .await?
            .json::<SessionResponse>()
            .await?;
        Ok(response)
    }

    async fn call_checked(
        &self,
        call: &'static str,
    ) -> Result<SessionResponse, SessionClientError> {
        let response = self.call(call).await?;
        if response.success {
            Ok(response)
        } else {
            Err(SessionClientError::Rejected {
                call,
                message: response.message,
            })
        }
    }

    /// Register with the proxy. Returns the active client count.
    pub async fn register(&self) -> Result<usize, SessionClientError> {
        let response = self.call_checked("register").await?;
        Ok(response.count.unwrap_or_default())
    }

    /// `Ok(false)` means the proxy does not know this client.
    pub async fn heartbeat(&self) -> Result<bool, SessionClientError> {
        Ok(self.call("heartbeat").await?.success)
    }

    pub async fn unregister(&self) -> Result<(), SessionClientError> {
        self.call_checked("unregister").await.map(|_| ())
    }

    /// Heartbeat every `interval` until cancelled. A rejected heartbeat
    /// triggers a re-registration.
    pub async fn run_heartbeat(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Heartbeat stopped");
                    return;
                }
                _ = ticker.tick() => match self.heartbeat().await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!("Heartbeat rejected, registering again");
                        if let Err(e) = self.register().await {
                            tracing::error!("Re-registration failed: {}", e);
                        }
                    }
                    Err(e) => tracing::warn!("Heartbeat failed: {}", e),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{Router, body::Body, extract::Request};

    use super::*;
    use crate::{
        adapters::{Forwarder, UpstreamClient},
        config::RoutingStrategy,
        core::{ProviderRouter, SessionTracker},
        ports::http_client::HttpClient,
    };

    async fn serve_sessions(sessions: Arc<SessionTracker>) -> String {
        let router = Arc::new(ProviderRouter::from_providers(
            Vec::new(),
            RoutingStrategy::Failover,
        ));
        let client: Arc<dyn HttpClient> =
            Arc::new(UpstreamClient::new(Duration::from_secs(5), None).unwrap());
        let forwarder = Arc::new(Forwarder::new(router, client, sessions));
        let app = Router::new().fallback(move |req: Request<Body>| {
            let forwarder = forwarder.clone();
            async move { forwarder.handle_request(req).await }
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://{addr}")
    }

    #[test]
    fn test_client_id_format() {
        let id = generate_client_id("box", 42);
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts[..3], ["ccenv", "box", "42"]);
        assert!(parts[3].parse::<u64>().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_register_heartbeat_unregister() {
        let sessions = Arc::new(SessionTracker::new());
        let base = serve_sessions(sessions.clone()).await;
        let client = SessionClient::with_identity(&base, "c1", 7, "box").unwrap();

        assert_eq!(client.register().await.unwrap(), 1);
        assert_eq!(sessions.get("c1").unwrap().pid, 7);

        assert!(client.heartbeat().await.unwrap());

        client.unregister().await.unwrap();
        assert_eq!(sessions.count(), 0);
        assert!(!client.heartbeat().await.unwrap());
        assert!(matches!(
            client.unregister().await,
            Err(SessionClientError::Rejected {
                call: "unregister",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_loop_reregisters() {
        let sessions = Arc::new(SessionTracker::new());
        let base = serve_sessions(sessions.clone()).await;
        let client = SessionClient::with_identity(&base, "c2", 8, "box").unwrap();

        // Never registered: the first beat is rejected and the loop registers.
        let cancel = CancellationToken::new();
        let task = {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                client
                    .run_heartbeat(Duration::from_millis(50), cancel)
                    .await
            })
        };

        tokio::time::timeout(Duration::from_secs(2), async {
            while sessions.get("c2").is_none() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_proxy() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client =
            SessionClient::with_identity(format!("http://{addr}"), "c3", 9, "box").unwrap();
        assert!(matches!(
            client.register().await,
            Err(SessionClientError::Transport(_))
        ));
    }
}
