//! ccenv - a transparent multi-provider reverse proxy for local LLM command-line clients.
//!
//! The client talks to `http://<host>:<port>` as if it were the vendor API.
//! ccenv picks a configured provider for every request, swaps in that
//! provider's credential (and optionally its model name), and streams the
//! answer back unchanged.
//!
//! # Features
//! - Failover or round-robin selection across providers, with a 5 minute
//!   cooldown after 5 consecutive failures
//! - Lossless request-model rewriting and chunk-for-chunk response streaming
//! - Client session tracking (register / heartbeat / unregister) with
//!   automatic shutdown once the last client has gone
//! - Hot reload of `~/.claude-code-env/settings.json`, rebuilding the whole
//!   service graph
//! - A read-only status page on a secondary port
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use ccenv::{GracefulShutdown, Orchestrator, SessionTracker, config};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let snapshot = config::load_config(&config::default_config_path())?;
//! let orchestrator = Orchestrator::new(
//!     Arc::new(SessionTracker::new()),
//!     GracefulShutdown::new(),
//!     None,
//! );
//! orchestrator.start(Arc::new(snapshot)).await?;
//! orchestrator.run(None).await;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! Traits at the seams live in `ports`, their implementations in `adapters`,
//! and the routing and session logic in `core`. `service` assembles them into
//! running listeners and owns the lifecycle.
pub mod config;
pub mod error;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod client;
pub mod core;
pub mod service;

pub use crate::{
    adapters::{FileConfigSource, Forwarder, UpstreamClient},
    core::{ProviderRouter, SessionTracker},
    error::{ConfigError, ProxyError},
    ports::{config_provider::ConfigSource, http_client::HttpClient},
    service::{Orchestrator, ServiceGraph, ServiceState},
    utils::{GracefulShutdown, ShutdownReason},
};
