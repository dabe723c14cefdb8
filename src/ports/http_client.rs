use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use hyper::{HeaderMap, Request, StatusCode};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to the provider fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when request times out
    #[error("Timeout error after {0} ms")]
    Timeout(u64),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Error while reading the response body
    #[error("Body error: {0}")]
    BodyError(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// Response body as handed back by the client.
pub enum UpstreamBody {
    /// Incrementally delivered body.
    Streaming(BoxStream<'static, HttpClientResult<Bytes>>),
    /// Fully materialized body.
    Buffered(Bytes),
}

impl std::fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamBody::Streaming(_) => f.write_str("Streaming(..)"),
            UpstreamBody::Buffered(bytes) => write!(f, "Buffered({} bytes)", bytes.len()),
        }
    }
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: UpstreamBody,
}

/// HttpClient defines the port (interface) for calling provider APIs
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send a fully buffered request to a provider.
    ///
    /// Resolves once response headers arrive; the body is read afterwards
    /// through [`UpstreamResponse::body`].
    async fn send_request(&self, req: Request<Bytes>) -> HttpClientResult<UpstreamResponse>;
}
