use std::{sync::Arc, time::Instant};

use axum::{
    Json,
    body::{Body, Bytes},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use hyper::Request;
use serde::Serialize;
use tracing::Instrument;

use crate::{
    config::{Credential, ProviderConfig, RoutingStrategy},
    core::{
        relay::relay,
        rewrite,
        router::{ProviderRouter, ProviderStatus},
        session::{SessionRequest, SessionResponse, SessionTracker},
    },
    error::ProxyError,
    ports::http_client::{HttpClient, UpstreamBody},
};

/// Upper bound for buffered inbound request bodies.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

const MESSAGES_PATH: &str = "/v1/messages";
const CLIENT_INFO_PREFIX: &str = "/ccenv/client/";
const X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Serialize)]
struct ProvidersResponse {
    strategy: RoutingStrategy,
    providers: Vec<ProviderStatus>,
}

/// API-side request handler: provider forwarding plus the client session protocol.
pub struct Forwarder {
    router: Arc<ProviderRouter>,
    client: Arc<dyn HttpClient>,
    sessions: Arc<SessionTracker>,
}

impl Forwarder {
    pub fn new(
        router: Arc<ProviderRouter>,
        client: Arc<dyn HttpClient>,
        sessions: Arc<SessionTracker>,
    ) -> Self {
        Self {
            router,
            client,
            sessions,
        }
    }

    pub fn router(&self) -> &Arc<ProviderRouter> {
        &self.router
    }

    pub fn sessions(&self) -> &Arc<SessionTracker> {
        &self.sessions
    }

    /// Main request handler that routes requests appropriately
    pub async fn handle_request(&self, req: Request<Body>) -> Response {
        let trace_id = new_trace_id();
        let span = tracing::info_span!(
            "request",
            trace_id = %trace_id,
            method = %req.method(),
            path = %req.uri().path(),
        );
        self.dispatch(req).instrument(span).await
    }

    async fn dispatch(&self, req: Request<Body>) -> Response {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        match path.as_str() {
            MESSAGES_PATH if method != Method::POST => {
                tracing::warn!("Rejected {} on {}", method, MESSAGES_PATH);
                ProxyError::MethodNotAllowed { allowed: "POST" }.into_response()
            }
            MESSAGES_PATH => self.forward(req, true).await,
            "/health" => self.forward(req, false).await,
            p if p.starts_with("/v1/") => self.forward(req, false).await,
            "/ccenv/register" | "/ccenv/unregister" | "/ccenv/heartbeat" => {
                self.handle_session_call(req).await
            }
            "/ccenv/status" => match method {
                Method::GET => Json(self.sessions.status()).into_response(),
                _ => session_method_not_allowed("GET"),
            },
            "/ccenv/providers" => match method {
                Method::GET => Json(ProvidersResponse {
                    strategy: self.router.strategy(),
                    providers: self.router.provider_status(),
                })
                .into_response(),
                _ => session_method_not_allowed("GET"),
            },
            p if p.starts_with(CLIENT_INFO_PREFIX) => {
                if method != Method::GET {
                    return session_method_not_allowed("GET");
                }
                self.handle_client_info(&p[CLIENT_INFO_PREFIX.len()..])
            }
            _ => {
                tracing::info!("Unmatched request: {} {}", method, path);
                ProxyError::NotFound { path: path.clone() }.into_response()
            }
        }
    }

    /// Select a provider, forward the request and relay the answer.
    async fn forward(&self, req: Request<Body>, rewrite_model: bool) -> Response {
        let provider = match self.router.select_provider() {
            Ok(provider) => provider,
            Err(e) => {
                tracing::error!("Provider selection failed: {}", e);
                return e.into_response();
            }
        };

        let (parts, body) = req.into_parts();
        let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(provider = %provider.name, "Failed to read request body: {}", e);
                self.router.record_failure(&provider.name);
                return ProxyError::RequestBody(e.to_string()).into_response();
            }
        };

        let body = if rewrite_model {
            match self.apply_model_mapping(&provider, body) {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!(provider = %provider.name, "{}", e);
                    self.router.record_failure(&provider.name);
                    return e.into_response();
                }
            }
        } else {
            body
        };

        let upstream_req = match build_upstream_request(&provider, &parts, body) {
            Ok(req) => req,
            Err(e) => {
                tracing::error!(provider = %provider.name, "{}", e);
                self.router.record_failure(&provider.name);
                return e.into_response();
            }
        };

        let started = Instant::now();
        let upstream = match self.client.send_request(upstream_req).await {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::error!(provider = %provider.name, "Request forwarding failed: {}", e);
                self.router.record_failure(&provider.name);
                return ProxyError::UpstreamTransport(e).into_response();
            }
        };

        if upstream.status.is_server_error() {
            tracing::warn!(
                provider = %provider.name,
                status = upstream.status.as_u16(),
                "Provider returned server error"
            );
            self.router.record_failure(&provider.name);
        } else {
            self.router.record_success(&provider.name);
        }

        tracing::info!(
            provider = %provider.name,
            status = upstream.status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "{} {}",
            parts.method,
            parts.uri.path()
        );

        let body = match upstream.body {
            UpstreamBody::Streaming(stream) => {
                let (body, pump) = relay(stream);
                tokio::spawn(
                    async move {
                        if let Ok(stats) = pump.await {
                            tracing::debug!(
                                chunks = stats.chunks,
                                bytes = stats.bytes,
                                outcome = ?stats.outcome,
                                "Response relay finished"
                            );
                        }
                    }
                    .in_current_span(),
                );
                body
            }
            UpstreamBody::Buffered(bytes) => Body::from(bytes),
        };

        let mut response = Response::new(body);
        *response.status_mut() = upstream.status;
        *response.headers_mut() = upstream.headers;
        response
    }

    fn apply_model_mapping(
        &self,
        provider: &ProviderConfig,
        body: Bytes,
    ) -> Result<Bytes, ProxyError> {
        let requested = rewrite::extract_model(&body);
        let Some(target) = provider.target_model.as_deref() else {
            if let Some(model) = requested {
                tracing::info!(provider = %provider.name, "Request model: {}", model);
            }
            return Ok(body);
        };

        let rewritten = rewrite::rewrite_model(&body, target)?;
        match requested {
            Some(model) if model != target => {
                tracing::info!(provider = %provider.name, "Model mapping: {} -> {}", model, target);
            }
            _ => tracing::info!(provider = %provider.name, "Request model: {}", target),
        }
        Ok(rewritten)
    }

    async fn handle_session_call(&self, req: Request<Body>) -> Response {
        if req.method() != Method::POST {
            return session_method_not_allowed("POST");
        }
        let path = req.uri().path().to_string();

        let bytes = match axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(e) => return session_bad_request(format!("failed to read request body: {e}")),
        };
        let call: SessionRequest = match serde_json::from_slice(&bytes) {
            Ok(call) => call,
            Err(e) => return session_bad_request(format!("malformed request data: {e}")),
        };
        if call.client_id.trim().is_empty() {
            return session_bad_request("client_id must not be empty");
        }

        let answer = match path.as_str() {
            "/ccenv/register" => {
                let count = self.sessions.register(&call.client_id, call.pid, &call.hostname);
                SessionResponse::ok("client registered", count)
            }
            "/ccenv/unregister" => {
                if self.sessions.unregister(&call.client_id) {
                    SessionResponse::ok("client unregistered", self.sessions.count())
                } else {
                    SessionResponse::rejected("client not found or already unregistered")
                }
            }
            _ => {
                if self.sessions.heartbeat(&call.client_id) {
                    SessionResponse::ok("heartbeat updated", self.sessions.count())
                } else {
                    SessionResponse::rejected("client not registered, register first")
                }
            }
        };

        Json(answer).into_response()
    }

    fn handle_client_info(&self, id: &str) -> Response {
        if id.is_empty() {
            return session_bad_request("client id must not be empty");
        }
        match self.sessions.get(id) {
            Some(session) => Json(session).into_response(),
            None => (
                StatusCode::NOT_FOUND,
                Json(SessionResponse::rejected("client not found")),
            )
                .into_response(),
        }
    }
}

fn session_method_not_allowed(allowed: &str) -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(SessionResponse::rejected(format!(
            "only {allowed} requests are supported"
        ))),
    )
        .into_response()
}

fn session_bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(SessionResponse::rejected(message)),
    )
        .into_response()
}

/// Short opaque id correlating the log lines of one request.
fn new_trace_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Copy end-to-end headers, then set the provider credential and body length.
fn upstream_headers(
    inbound: &HeaderMap,
    credential: Option<&Credential>,
    body_len: usize,
) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 2);
    for (name, value) in inbound {
        if HOP_BY_HOP.contains(name)
            || name == header::HOST
            || name == header::CONTENT_LENGTH
            || name == header::AUTHORIZATION
            || name == X_API_KEY
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    match credential {
        Some(Credential::Bearer(token)) => {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(header::AUTHORIZATION, value);
            }
        }
        Some(Credential::ApiKey(key)) => {
            if let Ok(value) = HeaderValue::from_str(key) {
                headers.insert(X_API_KEY, value);
            }
        }
        None => {}
    }

    if body_len > 0 {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body_len));
    }
    headers
}

fn build_upstream_request(
    provider: &ProviderConfig,
    parts: &Parts,
    body: Bytes,
) -> Result<Request<Bytes>, ProxyError> {
    let base_url = provider.base_url.as_deref().ok_or_else(|| {
        ProxyError::InvalidUpstreamRequest(format!("provider '{}' has no base URL", provider.name))
    })?;
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path(), |pq| pq.as_str());
    let target = format!("{base_url}{path_and_query}");

    let headers = upstream_headers(&parts.headers, provider.credential.as_ref(), body.len());
    let mut request = Request::builder()
        .method(parts.method.clone())
        .uri(target.as_str())
        .body(body)
        .map_err(|e| ProxyError::InvalidUpstreamRequest(format!("{target}: {e}")))?;
    *request.headers_mut() = headers;
    Ok(request)
}
