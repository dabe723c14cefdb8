use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{config::ConfigSnapshot, error::ConfigError};

/// Receivers handed out by [`ConfigSource::watch`].
///
/// Snapshots and failures travel on separate channels so a broken edit never
/// reaches the component that rebuilds the running service.
#[derive(Debug)]
pub struct ConfigWatch {
    pub snapshots: mpsc::Receiver<Arc<ConfigSnapshot>>,
    pub errors: mpsc::Receiver<ConfigError>,
}

/// Trait for configuration sources that can load and watch for configuration changes.
pub trait ConfigSource: Send + Sync {
    /// Load the current configuration.
    fn load(&self) -> Result<ConfigSnapshot, ConfigError>;

    /// Start watching for changes. Can be taken once; later calls return `None`.
    fn watch(&self) -> Option<ConfigWatch>;
}
