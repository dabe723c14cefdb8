use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use hyper::{Request, header};
use tracing::Instrument;

use crate::ports::http_client::{
    HttpClient, HttpClientError, HttpClientResult, UpstreamBody, UpstreamResponse,
};

/// Provider client built on `reqwest` with rustls.
///
/// Responsibilities:
/// * Bounds every call (headers and body) by the configured total timeout
/// * Routes traffic through the configured API proxy only; environment proxies are ignored
/// * Hands the response body back as a stream so it can be relayed chunk by chunk
///
/// Retries and failover live in the router, not here.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(timeout: Duration, api_proxy: Option<&str>) -> HttpClientResult<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90));

        if let Some(proxy_url) = api_proxy {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| {
                HttpClientError::InvalidRequest(format!("invalid API proxy '{proxy_url}': {e}"))
            })?;
            builder = builder.proxy(proxy);
            tracing::info!(proxy = %proxy_url, "Using API proxy for provider traffic");
        } else {
            builder = builder.no_proxy();
        }

        let client = builder
            .build()
            .map_err(|e| HttpClientError::InvalidRequest(format!("failed to build client: {e}")))?;

        tracing::debug!(timeout_ms = timeout.as_millis() as u64, "Created upstream HTTP client");
        Ok(Self { client, timeout })
    }

    fn map_error(&self, e: reqwest::Error) -> HttpClientError {
        if e.is_timeout() {
            HttpClientError::Timeout(self.timeout.as_millis() as u64)
        } else if e.is_builder() {
            HttpClientError::InvalidRequest(e.to_string())
        } else if e.is_body() || e.is_decode() {
            HttpClientError::BodyError(e.to_string())
        } else {
            HttpClientError::ConnectionError(e.to_string())
        }
    }
}

#[async_trait]
impl HttpClient for UpstreamClient {
    async fn send_request(&self, req: Request<Bytes>) -> HttpClientResult<UpstreamResponse> {
        let span = tracing::info_span!(
            "provider_request",
            http.method = %req.method(),
            http.url = %req.uri(),
            http.status_code = tracing::field::Empty,
        );
        self.execute(req).instrument(span).await
    }
}

impl UpstreamClient {
    async fn execute(&self, req: Request<Bytes>) -> HttpClientResult<UpstreamResponse> {
        if req.uri().host().is_none() {
            tracing::error!("Outgoing URI has no host: {}", req.uri());
            return Err(HttpClientError::InvalidRequest(
                "Outgoing URI has no host".to_string(),
            ));
        }

        tracing::debug!("Outgoing request headers: {:?}", req.headers());

        let request = reqwest::Request::try_from(req)
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        tracing::Span::current().record("http.status_code", status.as_u16());

        let mut headers = response.headers().clone();
        // The downstream connection does its own framing.
        headers.remove(header::TRANSFER_ENCODING);
        headers.remove(header::CONNECTION);

        let client = self.clone();
        let body = response
            .bytes_stream()
            .map_err(move |e| client.map_error(e))
            .boxed();

        Ok(UpstreamResponse {
            status,
            headers,
            body: UpstreamBody::Streaming(body),
        })
    }
}
