//! Fake upstream providers and helpers shared by the integration tests.
#![allow(dead_code)]

use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use ccenv::config::{ConfigSnapshot, Credential, ProviderConfig, RoutingStrategy};
use futures_util::{StreamExt, stream};

/// What a fake provider answers with.
#[derive(Clone)]
pub enum Behavior {
    /// 200 with the received body.
    Echo,
    /// Fixed status and JSON error body.
    Status(u16),
    /// 200 `text/event-stream` with the given chunks, `delay` apart.
    Stream(Vec<&'static str>, Duration),
}

#[derive(Debug, Clone)]
pub struct Captured {
    pub method: String,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

struct UpstreamState {
    behavior: Behavior,
    hits: AtomicUsize,
    requests: Mutex<Vec<Captured>>,
}

pub struct FakeUpstream {
    pub addr: SocketAddr,
    state: Arc<UpstreamState>,
}

impl FakeUpstream {
    pub async fn spawn(behavior: Behavior) -> Self {
        let state = Arc::new(UpstreamState {
            behavior,
            hits: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        });
        let app = Router::new().fallback(answer).with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<Captured> {
        self.state.requests.lock().unwrap().last().cloned()
    }
}

async fn answer(State(state): State<Arc<UpstreamState>>, req: Request) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let (parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    state.requests.lock().unwrap().push(Captured {
        method: parts.method.to_string(),
        path_and_query: parts
            .uri
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_default(),
        headers: parts.headers,
        body: body.clone(),
    });

    match state.behavior.clone() {
        Behavior::Echo => Response::builder()
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap(),
        Behavior::Status(code) => Response::builder()
            .status(StatusCode::from_u16(code).unwrap())
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"type":"error","error":{"type":"api_error","message":"upstream broke"}}"#,
            ))
            .unwrap(),
        Behavior::Stream(chunks, delay) => {
            let chunks = stream::iter(chunks).then(move |chunk| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, Infallible>(Bytes::from_static(chunk.as_bytes()))
            });
            Response::builder()
                .header("content-type", "text/event-stream")
                .body(Body::from_stream(chunks))
                .unwrap()
        }
    }
}

pub fn provider(name: &str, base_url: &str, credential: Credential) -> ProviderConfig {
    ProviderConfig {
        name: name.to_string(),
        enabled: true,
        base_url: Some(base_url.to_string()),
        credential: Some(credential),
        target_model: None,
    }
}

/// Loopback snapshot on ephemeral ports.
pub fn snapshot(strategy: RoutingStrategy, providers: Vec<ProviderConfig>) -> ConfigSnapshot {
    ConfigSnapshot {
        host: "127.0.0.1".to_string(),
        api_port: 0,
        status_port: 0,
        strategy,
        providers,
        ..ConfigSnapshot::default()
    }
}

pub fn http() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}
