use std::{net::SocketAddr, sync::Arc};

use axum::{Router, body::Body, extract::Request};
use tower_http::trace::TraceLayer;

use crate::{
    adapters::{Forwarder, StatusPage, UpstreamClient},
    config::ConfigSnapshot,
    core::{ProviderRouter, SessionTracker},
    error::ProxyError,
    ports::http_client::HttpClient,
    service::listener::{ManagedListener, SHUTDOWN_GRACE, bind_tcp},
};

const API_LISTENER: &str = "api";
const STATUS_LISTENER: &str = "status";

/// One running generation of the proxy: router, forwarder and both listeners,
/// all built from a single config snapshot.
///
/// A graph is never mutated after `start`; a reload builds a fresh one.
pub struct ServiceGraph {
    snapshot: Arc<ConfigSnapshot>,
    router: Arc<ProviderRouter>,
    api: ManagedListener,
    status: ManagedListener,
}

impl std::fmt::Debug for ServiceGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceGraph")
            .field("api", &self.api.local_addr())
            .field("status", &self.status.local_addr())
            .field("strategy", &self.router.strategy())
            .finish()
    }
}

impl ServiceGraph {
    pub async fn start(
        snapshot: Arc<ConfigSnapshot>,
        sessions: Arc<SessionTracker>,
    ) -> Result<Self, ProxyError> {
        let client = UpstreamClient::new(snapshot.upstream_timeout, snapshot.api_proxy.as_deref())?;
        Self::start_with_client(snapshot, sessions, Arc::new(client)).await
    }

    /// Start with a caller-supplied upstream client.
    pub async fn start_with_client(
        snapshot: Arc<ConfigSnapshot>,
        sessions: Arc<SessionTracker>,
        client: Arc<dyn HttpClient>,
    ) -> Result<Self, ProxyError> {
        let router = Arc::new(ProviderRouter::new(&snapshot));
        let forwarder = Arc::new(Forwarder::new(router.clone(), client, sessions));

        let api_app = Router::new()
            .fallback(move |req: Request<Body>| {
                let forwarder = forwarder.clone();
                async move { forwarder.handle_request(req).await }
            })
            .layer(TraceLayer::new_for_http());

        let listener = bind_tcp(API_LISTENER, &snapshot.host, snapshot.api_port).await?;
        let api = ManagedListener::serve(API_LISTENER, listener, api_app, SHUTDOWN_GRACE)?;

        let status_listener =
            match bind_tcp(STATUS_LISTENER, &snapshot.host, snapshot.status_port).await {
                Ok(listener) => listener,
                Err(e) => {
                    if let Err(stop_err) = api.shutdown().await {
                        tracing::warn!(
                            "Failed to stop api listener after status bind error: {}",
                            stop_err
                        );
                    }
                    return Err(e);
                }
            };
        let status_addr = match status_listener.local_addr() {
            Ok(addr) => addr,
            Err(source) => {
                if let Err(stop_err) = api.shutdown().await {
                    tracing::warn!("Failed to stop api listener: {}", stop_err);
                }
                return Err(ProxyError::PortBind {
                    listener: STATUS_LISTENER,
                    addr: format!("{}:{}", snapshot.host, snapshot.status_port),
                    source,
                });
            }
        };

        let page = StatusPage {
            api_addr: api.local_addr(),
            status_addr,
            eligible_providers: router.eligible_count(),
            total_providers: snapshot.providers.len(),
            strategy: router.strategy(),
        };
        let status = ManagedListener::serve(
            STATUS_LISTENER,
            status_listener,
            page.into_router(),
            SHUTDOWN_GRACE,
        )?;

        tracing::info!(
            api = %api.local_addr(),
            status = %status.local_addr(),
            strategy = %router.strategy(),
            providers = router.eligible_count(),
            "Service graph started"
        );

        Ok(Self {
            snapshot,
            router,
            api,
            status,
        })
    }

    /// Stop both listeners concurrently. Every listener gets its chance to
    /// drain; the first error is returned after all of them finished.
    pub async fn shutdown(&self) -> Result<(), ProxyError> {
        let (api, status) = tokio::join!(self.api.shutdown(), self.status.shutdown());

        let mut first = None;
        for (name, result) in [(API_LISTENER, api), (STATUS_LISTENER, status)] {
            if let Err(e) = result {
                tracing::error!("Failed to stop {} listener: {}", name, e);
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn api_addr(&self) -> SocketAddr {
        self.api.local_addr()
    }

    pub fn status_addr(&self) -> SocketAddr {
        self.status.local_addr()
    }

    pub fn router(&self) -> &Arc<ProviderRouter> {
        &self.router
    }

    pub fn snapshot(&self) -> &Arc<ConfigSnapshot> {
        &self.snapshot
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::routing::get;

    use super::*;
    use crate::service::listener::ListenerError;

    fn local_snapshot(api_port: u16, status_port: u16) -> Arc<ConfigSnapshot> {
        Arc::new(ConfigSnapshot {
            host: "127.0.0.1".to_string(),
            api_port,
            status_port,
            ..ConfigSnapshot::default()
        })
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let graph = ServiceGraph::start(local_snapshot(0, 0), Arc::new(SessionTracker::new()))
            .await
            .unwrap();
        assert_ne!(graph.api_addr(), graph.status_addr());

        let page = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap()
            .get(format!("http://{}/", graph.status_addr()))
            .send()
            .await
            .unwrap();
        assert!(page.status().is_success());

        graph.shutdown().await.unwrap();
        assert!(tokio::net::TcpStream::connect(graph.api_addr()).await.is_err());
    }

    #[tokio::test]
    async fn test_status_bind_failure_tears_down_api_listener() {
        let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = blocker.local_addr().unwrap().port();

        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let api_port = probe.local_addr().unwrap().port();
        drop(probe);

        let result = ServiceGraph::start(
            local_snapshot(api_port, taken),
            Arc::new(SessionTracker::new()),
        )
        .await;
        assert!(matches!(
            result,
            Err(ProxyError::PortBind {
                listener: "status",
                ..
            })
        ));

        // The api port is free again.
        tokio::net::TcpListener::bind(("127.0.0.1", api_port))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_status_listener_when_api_grace_expires() {
        let hanging = Router::new().route(
            "/hang",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late"
            }),
        );
        let api = ManagedListener::serve(
            API_LISTENER,
            bind_tcp(API_LISTENER, "127.0.0.1", 0).await.unwrap(),
            hanging,
            Duration::from_millis(200),
        )
        .unwrap();
        let status = ManagedListener::serve(
            STATUS_LISTENER,
            bind_tcp(STATUS_LISTENER, "127.0.0.1", 0).await.unwrap(),
            Router::new().route("/", get(|| async { "ok" })),
            SHUTDOWN_GRACE,
        )
        .unwrap();
        let snapshot = local_snapshot(0, 0);
        let graph = ServiceGraph {
            router: Arc::new(ProviderRouter::new(&snapshot)),
            snapshot,
            api,
            status,
        };
        let (api_addr, status_addr) = (graph.api_addr(), graph.status_addr());

        let request = tokio::spawn(async move {
            reqwest::Client::builder()
                .no_proxy()
                .build()?
                .get(format!("http://{api_addr}/hang"))
                .send()
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let result = graph.shutdown().await;
        assert!(matches!(
            result,
            Err(ProxyError::Listener(ListenerError::GraceExpired { name: "api", .. }))
        ));
        assert!(request.await.unwrap().is_err());
        assert!(tokio::net::TcpStream::connect(status_addr).await.is_err());
        assert!(tokio::net::TcpStream::connect(api_addr).await.is_err());
    }
}
