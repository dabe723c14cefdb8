//! A TCP listener with its own accept loop and bounded graceful shutdown.
use std::{
    net::SocketAddr,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use axum::Router;
use hyper::server::conn::http1;
use hyper_util::{
    rt::TokioIo,
    server::graceful::GracefulShutdown,
    service::TowerToHyperService,
};
use thiserror::Error;
use tokio::{net::TcpListener, task::JoinHandle, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::ProxyError;

/// How long in-flight connections may keep running once shutdown starts.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ListenerError {
    #[error("{name} listener at {addr}: {aborted} connection(s) still open after {grace:?}, aborted")]
    GraceExpired {
        name: &'static str,
        addr: SocketAddr,
        aborted: usize,
        grace: Duration,
    },

    #[error("{name} listener at {addr}: serve task failed: {reason}")]
    Task {
        name: &'static str,
        addr: SocketAddr,
        reason: String,
    },
}

/// Bind `host:port`, reporting failures as [`ProxyError::PortBind`].
pub async fn bind_tcp(
    name: &'static str,
    host: &str,
    port: u16,
) -> Result<TcpListener, ProxyError> {
    TcpListener::bind((host, port))
        .await
        .map_err(|source| ProxyError::PortBind {
            listener: name,
            addr: format!("{host}:{port}"),
            source,
        })
}

pub struct ManagedListener {
    name: &'static str,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<Result<(), ListenerError>>>>,
}

impl ManagedListener {
    /// Start serving `app` on an already bound listener.
    pub fn serve(
        name: &'static str,
        listener: TcpListener,
        app: Router,
        grace: Duration,
    ) -> Result<Self, ProxyError> {
        let local_addr = listener.local_addr().map_err(|source| ProxyError::PortBind {
            listener: name,
            addr: "unknown".to_string(),
            source,
        })?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            name,
            local_addr,
            listener,
            app,
            cancel.clone(),
            grace,
        ));

        tracing::info!("{} listener started on http://{}", name, local_addr);
        Ok(Self {
            name,
            local_addr,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, drain in-flight connections, abort stragglers.
    ///
    /// Later calls return immediately.
    pub async fn shutdown(&self) -> Result<(), ProxyError> {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return Ok(());
        };

        match task.await {
            Ok(Ok(())) => {
                tracing::info!("{} listener on {} stopped", self.name, self.local_addr);
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(ListenerError::Task {
                name: self.name,
                addr: self.local_addr,
                reason: e.to_string(),
            }
            .into()),
        }
    }
}

impl Drop for ManagedListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    name: &'static str,
    addr: SocketAddr,
    listener: TcpListener,
    app: Router,
    cancel: CancellationToken,
    grace: Duration,
) -> Result<(), ListenerError> {
    let graceful = GracefulShutdown::new();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let service = TowerToHyperService::new(app.clone());
                    let conn = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service);
                    let conn = graceful.watch(conn);
                    connections.spawn(async move {
                        if let Err(e) = conn.await {
                            tracing::debug!(%peer, "Connection closed with error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    tracing::warn!("{} listener failed to accept: {}", name, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    tracing::debug!(
        "{} listener draining {} connection(s)",
        name,
        connections.len()
    );

    let drain = async {
        graceful.shutdown().await;
        while connections.join_next().await.is_some() {}
    };

    match tokio::time::timeout(grace, drain).await {
        Ok(()) => Ok(()),
        Err(_) => {
            let aborted = connections.len();
            connections.abort_all();
            while connections.join_next().await.is_some() {}
            tracing::warn!(
                "{} listener aborted {} connection(s) after {:?}",
                name,
                aborted,
                grace
            );
            Err(ListenerError::GraceExpired {
                name,
                addr,
                aborted,
                grace,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::routing::get;

    use super::*;

    async fn client_get(addr: SocketAddr, path: &str) -> reqwest::Result<reqwest::Response> {
        reqwest::Client::builder()
            .no_proxy()
            .build()?
            .get(format!("http://{addr}{path}"))
            .send()
            .await
    }

    #[tokio::test]
    async fn test_serves_and_stops() {
        let app = Router::new().route("/", get(|| async { "ok" }));
        let listener = bind_tcp("test", "127.0.0.1", 0).await.unwrap();
        let managed = ManagedListener::serve("test", listener, app, SHUTDOWN_GRACE).unwrap();
        let addr = managed.local_addr();

        let body = client_get(addr, "/").await.unwrap().text().await.unwrap();
        assert_eq!(body, "ok");

        managed.shutdown().await.unwrap();
        assert!(client_get(addr, "/").await.is_err());

        // Idempotent.
        managed.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_in_flight_request_completes_within_grace() {
        let app = Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                "done"
            }),
        );
        let listener = bind_tcp("test", "127.0.0.1", 0).await.unwrap();
        let managed = ManagedListener::serve("test", listener, app, SHUTDOWN_GRACE).unwrap();
        let addr = managed.local_addr();

        let request = tokio::spawn(async move { client_get(addr, "/slow").await?.text().await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        managed.shutdown().await.unwrap();
        assert_eq!(request.await.unwrap().unwrap(), "done");
    }

    #[tokio::test]
    async fn test_grace_expiry_aborts_connections() {
        let app = Router::new().route(
            "/hang",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late"
            }),
        );
        let listener = bind_tcp("test", "127.0.0.1", 0).await.unwrap();
        let managed =
            ManagedListener::serve("test", listener, app, Duration::from_millis(200)).unwrap();
        let addr = managed.local_addr();

        let request = tokio::spawn(async move { client_get(addr, "/hang").await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let result = managed.shutdown().await;
        assert!(matches!(
            result,
            Err(ProxyError::Listener(ListenerError::GraceExpired { aborted: 1, .. }))
        ));
        assert!(request.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_bind_conflict_reports_port_bind() {
        let first = bind_tcp("api", "127.0.0.1", 0).await.unwrap();
        let port = first.local_addr().unwrap().port();
        let result = bind_tcp("status", "127.0.0.1", port).await;
        assert!(matches!(
            result,
            Err(ProxyError::PortBind { listener: "status", .. })
        ));
    }
}
