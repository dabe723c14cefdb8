use std::{fs::OpenOptions, path::PathBuf, sync::Mutex};

use thiserror::Error;
use tracing_subscriber::{
    EnvFilter, Registry, layer::SubscriberExt, reload, util::SubscriberInitExt,
};

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    /// Human readable output on stderr.
    Stderr,
    /// JSON lines appended to a file, leaving the terminal to the interactive client.
    File(PathBuf),
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LoggingError {
    #[error("failed to open log file {}: {source}", path.display())]
    OpenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install subscriber: {0}")]
    Init(String),
}

/// Handle to the installed subscriber.
///
/// Constructed once at startup and passed to the orchestrator, which adjusts
/// verbosity on every reload and closes logging when the service stops.
#[derive(Debug, Clone)]
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    /// `RUST_LOG` was set; configured levels are ignored.
    env_override: bool,
}

/// Map a configured verbosity (`DEBUG|INFO|WARN|ERROR`) to filter directives.
pub fn level_directives(level: &str) -> String {
    let level = match level.trim().to_ascii_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "WARN" | "WARNING" => "warn",
        "ERROR" => "error",
        _ => "info",
    };
    format!("warn,ccenv={level},tower_http={level}")
}

/// Install the global subscriber.
pub fn init_logging(level: &str, target: LogTarget) -> Result<LogHandle, LoggingError> {
    let (filter, env_override) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(level_directives(level)), false),
    };
    let (filter, handle) = reload::Layer::new(filter);

    let (stderr_layer, file_layer) = match &target {
        LogTarget::Stderr => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false),
            ),
            None,
        ),
        LogTarget::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|source| LoggingError::OpenFile {
                    path: path.clone(),
                    source,
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::OpenFile {
                    path: path.clone(),
                    source,
                })?;
            (
                None,
                Some(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_span_list(false)
                        .with_target(true)
                        .with_writer(Mutex::new(file)),
                ),
            )
        }
    };

    Registry::default()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    tracing::debug!(?target, env_override, "Logging initialized");
    Ok(LogHandle {
        filter: handle,
        env_override,
    })
}

impl LogHandle {
    /// Apply a configured verbosity. No-op when `RUST_LOG` is in charge.
    pub fn set_level(&self, level: &str) {
        if self.env_override {
            tracing::debug!("RUST_LOG is set, ignoring configured level {}", level);
            return;
        }
        let directives = level_directives(level);
        match self.filter.reload(EnvFilter::new(&directives)) {
            Ok(()) => tracing::debug!("Log level set to {}", directives),
            Err(e) => tracing::warn!("Failed to update log level: {}", e),
        }
    }

    /// Flush and stop emitting service logs.
    pub fn shutdown(&self) {
        tracing::info!("ccenv logging shutdown");
        if !self.env_override {
            let _ = self.filter.reload(EnvFilter::new("off"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_directives() {
        assert_eq!(level_directives("DEBUG"), "warn,ccenv=debug,tower_http=debug");
        assert_eq!(level_directives("warn"), "warn,ccenv=warn,tower_http=warn");
        assert_eq!(level_directives("ERROR"), "warn,ccenv=error,tower_http=error");
        assert_eq!(level_directives("verbose"), "warn,ccenv=info,tower_http=info");
        assert_eq!(level_directives(""), "warn,ccenv=info,tower_http=info");
    }
}
