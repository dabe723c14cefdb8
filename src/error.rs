//! Error taxonomy and the structured JSON error envelope.
//!
//! Every proxy-originated non-2xx response uses the same shape so client
//! tooling can treat local and upstream failures uniformly:
//!
//! ```json
//! { "type": "error", "error": { "type": "overloaded_error", "message": "CCENV ..." } }
//! ```
use std::path::PathBuf;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    config::ValidationError, core::rewrite::RewriteError, ports::http_client::HttpClientError,
    service::listener::ListenerError,
};

/// Prefix marking messages produced by the proxy itself.
const MESSAGE_PREFIX: &str = "CCENV";

/// Errors raised while loading, parsing or watching the configuration file.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("configuration file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to parse configuration {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: config::ConfigError,
    },

    #[error("invalid configuration: {}", format_validation_errors(.0))]
    Invalid(Vec<ValidationError>),

    #[error("failed to watch configuration: {0}")]
    Watch(#[from] notify::Error),

    #[error("invalid configuration path: {0}")]
    InvalidPath(String),

    /// No settings file existed, so the example was written in its place.
    #[error("no configuration found, an example was written to {}", path.display())]
    ExampleWritten { path: PathBuf },

    #[error("failed to write configuration {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Caller-facing and lifecycle errors of the proxy service.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    /// Every provider is switched off, lacks credentials or is cooling down.
    #[error("no provider available")]
    NoProviderAvailable,

    #[error("request forwarding failed: {0}")]
    UpstreamTransport(#[from] HttpClientError),

    #[error("failed to rewrite request model: {0}")]
    BodyRewrite(#[from] RewriteError),

    #[error("failed to build provider request: {0}")]
    InvalidUpstreamRequest(String),

    #[error("failed to read request body: {0}")]
    RequestBody(String),

    #[error("only {allowed} requests are supported")]
    MethodNotAllowed { allowed: &'static str },

    #[error("path '{path}' does not exist or is not supported")]
    NotFound { path: String },

    #[error("failed to bind {listener} listener on {addr}: {source}")]
    PortBind {
        listener: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ProxyError {
    /// HTTP status used when the error is reported to a caller.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoProviderAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
            ProxyError::RequestBody(_) => StatusCode::BAD_REQUEST,
            ProxyError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::NotFound { .. } => StatusCode::NOT_FOUND,
            ProxyError::BodyRewrite(_)
            | ProxyError::InvalidUpstreamRequest(_)
            | ProxyError::PortBind { .. }
            | ProxyError::Listener(_)
            | ProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Envelope error kind used when the error is reported to a caller.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::NoProviderAvailable => ErrorKind::Overloaded,
            ProxyError::RequestBody(_)
            | ProxyError::MethodNotAllowed { .. }
            | ProxyError::NotFound { .. } => ErrorKind::InvalidRequest,
            _ => ErrorKind::Api,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        ErrorEnvelope::new(self.kind(), self.to_string()).into_response_with(self.status())
    }
}

/// Error kinds carried in `error.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "invalid_request_error")]
    InvalidRequest,
    #[serde(rename = "overloaded_error")]
    Overloaded,
    #[serde(rename = "api_error")]
    Api,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
}

/// `{ "type": "error", "error": { "type": ..., "message": ... } }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(rename = "type")]
    pub envelope_type: String,
    pub error: ErrorBody,
}

impl ErrorEnvelope {
    pub fn new(kind: ErrorKind, message: impl AsRef<str>) -> Self {
        Self {
            envelope_type: "error".to_string(),
            error: ErrorBody {
                kind,
                message: format!("{MESSAGE_PREFIX} {}", message.as_ref()),
            },
        }
    }

    pub fn into_response_with(self, status: StatusCode) -> Response {
        (status, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    #[test]
    fn test_status_and_kind_mapping() {
        let err = ProxyError::NoProviderAvailable;
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.kind(), ErrorKind::Overloaded);

        let err = ProxyError::UpstreamTransport(HttpClientError::Timeout(600_000));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.kind(), ErrorKind::Api);

        let err = ProxyError::NotFound {
            path: "/nope".to_string(),
        };
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_envelope_shape() {
        let response = ProxyError::NoProviderAvailable.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"]["type"], "overloaded_error");
        assert_eq!(json["error"]["message"], "CCENV no provider available");
    }
}
