use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::{
    config::{ConfigSnapshot, loader::load_config},
    error::ConfigError,
    ports::config_provider::{ConfigSource, ConfigWatch},
};

/// Quiet period after the last file event before the file is re-read.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

const CHANNEL_CAPACITY: usize = 8;

/// Configuration source that loads from a local file and watches for changes.
pub struct FileConfigSource {
    path: PathBuf,
    debounce: Duration,
    // Kept alive for as long as the source exists.
    _watcher: notify::RecommendedWatcher,
    trigger_rx: Mutex<Option<mpsc::Receiver<()>>>,
    error_tx: mpsc::Sender<ConfigError>,
    error_rx: Mutex<Option<mpsc::Receiver<ConfigError>>>,
    last_loaded: Arc<Mutex<Option<ConfigSnapshot>>>,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Self::with_debounce(path, DEFAULT_DEBOUNCE)
    }

    pub fn with_debounce(
        path: impl Into<PathBuf>,
        debounce: Duration,
    ) -> Result<Self, ConfigError> {
        let path = path.into();
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (error_tx, error_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let config_filename = path
            .file_name()
            .ok_or_else(|| ConfigError::InvalidPath(path.display().to_string()))?
            .to_owned();

        let watch_error_tx = error_tx.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        if (event.kind.is_modify() || event.kind.is_create())
                            && event
                                .paths
                                .iter()
                                .any(|p| p.file_name() == Some(&config_filename))
                        {
                            tracing::debug!("Config file changed: {:?}", event.kind);
                            // A pending trigger already covers this event.
                            let _ = trigger_tx.try_send(());
                        }
                    }
                    Err(e) => {
                        tracing::error!("File watch error: {:?}", e);
                        let _ = watch_error_tx.try_send(ConfigError::Watch(e));
                    }
                }
            })?;

        let watch_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        watcher.watch(watch_dir, RecursiveMode::NonRecursive)?;
        tracing::debug!(path = %path.display(), "Watching configuration file");

        Ok(Self {
            path,
            debounce,
            _watcher: watcher,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            error_tx,
            error_rx: Mutex::new(Some(error_rx)),
            last_loaded: Arc::new(Mutex::new(None)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<ConfigSnapshot, ConfigError> {
        let snapshot = load_config(&self.path)?;
        *self
            .last_loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        Ok(snapshot)
    }

    fn watch(&self) -> Option<ConfigWatch> {
        let mut trigger_rx = self
            .trigger_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let errors = self
            .error_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;

        let (snapshot_tx, snapshots) = mpsc::channel(CHANNEL_CAPACITY);
        let error_tx = self.error_tx.clone();
        let last_loaded = Arc::clone(&self.last_loaded);
        let path = self.path.clone();
        let debounce = self.debounce;

        tokio::spawn(async move {
            while trigger_rx.recv().await.is_some() {
                tokio::time::sleep(debounce).await;
                while trigger_rx.try_recv().is_ok() {}

                match load_config(&path) {
                    Ok(snapshot) => {
                        {
                            let mut last =
                                last_loaded.lock().unwrap_or_else(PoisonError::into_inner);
                            if last.as_ref() == Some(&snapshot) {
                                tracing::debug!("Config file touched without changes, skipping");
                                continue;
                            }
                            *last = Some(snapshot.clone());
                        }
                        tracing::info!(path = %path.display(), "Configuration change detected");
                        if snapshot_tx.send(Arc::new(snapshot)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to reload configuration"
                        );
                        if error_tx.send(e).await.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Config watch loop stopped");
        });

        Some(ConfigWatch { snapshots, errors })
    }
}
