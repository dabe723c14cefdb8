use std::{
    io::Write,
    path::{Path, PathBuf},
};

use config::{Config, File, FileFormat};

use crate::{
    config::{models::ConfigSnapshot, models::SettingsFile, validation::ServerConfigValidator},
    error::ConfigError,
};

/// Directory holding the settings file and the log file.
pub const CONFIG_DIR_NAME: &str = ".claude-code-env";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const LOG_FILE_NAME: &str = "ccenv.log";

/// `~/.claude-code-env`, falling back to the working directory when `HOME` is unset.
pub fn config_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}

pub fn default_config_path() -> PathBuf {
    config_dir().join(SETTINGS_FILE_NAME)
}

pub fn default_log_path() -> PathBuf {
    config_dir().join(LOG_FILE_NAME)
}

/// Starting point written by `ccenv init`.
pub const EXAMPLE_SETTINGS: &str = r#"{
  "version": "2.0",
  "CCENV_HOST": "localhost",
  "CCENV_PORT": 9999,
  "LOGGING_LEVEL": "INFO",
  "API_TIMEOUT_MS": 600000,
  "providers": [
    {
      "name": "provider-a",
      "state": "on",
      "env": {
        "ANTHROPIC_BASE_URL": "https://api.example.com",
        "ANTHROPIC_AUTH_TOKEN": "sk-replace-me",
        "ANTHROPIC_MODEL": "deepseek-ai/DeepSeek-V3"
      }
    },
    {
      "name": "provider-b",
      "state": "off",
      "env": {
        "ANTHROPIC_BASE_URL": "https://api.example.org",
        "ANTHROPIC_API_KEY": "sk-replace-me-too"
      }
    }
  ],
  "routing": {
    "strategy": "default"
  }
}
"#;

/// Write [`EXAMPLE_SETTINGS`] to `path`, creating parent directories.
/// An existing file is never overwritten.
pub fn write_example_config(path: &Path) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(io_err)?;
    file.write_all(EXAMPLE_SETTINGS.as_bytes()).map_err(io_err)
}

/// Load the settings file, or write the example when there is none yet.
///
/// Creates missing parent directories, so this runs before anything
/// watches the settings directory.
pub fn load_config_or_write_example(config_path: &Path) -> Result<ConfigSnapshot, ConfigError> {
    match load_config(config_path) {
        Err(ConfigError::NotFound { path }) => {
            write_example_config(&path)?;
            Err(ConfigError::ExampleWritten { path })
        }
        other => other,
    }
}

/// Load, normalize and validate the settings file.
pub fn load_config(config_path: &Path) -> Result<ConfigSnapshot, ConfigError> {
    let snapshot = load_config_unchecked(config_path)?;
    ServerConfigValidator::validate(&snapshot).map_err(ConfigError::Invalid)?;
    Ok(snapshot)
}

/// Load and normalize without validation (used by the validate command to
/// report every problem at once).
pub fn load_config_unchecked(config_path: &Path) -> Result<ConfigSnapshot, ConfigError> {
    if !config_path.is_file() {
        return Err(ConfigError::NotFound {
            path: config_path.to_path_buf(),
        });
    }

    let path_str = config_path
        .to_str()
        .ok_or_else(|| ConfigError::InvalidPath(config_path.display().to_string()))?;

    let settings: SettingsFile = Config::builder()
        .add_source(File::new(path_str, FileFormat::Json))
        .build()
        .and_then(Config::try_deserialize)
        .map_err(|source| ConfigError::Parse {
            path: config_path.to_path_buf(),
            source,
        })?;

    Ok(ConfigSnapshot::from_settings(&settings))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::config::models::{Credential, RoutingStrategy};

    fn write_settings(content: &str) -> NamedTempFile {
        let mut temp_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(temp_file, "{content}").unwrap();
        temp_file
    }

    #[test]
    fn test_load_json_config() {
        let temp_file = write_settings(
            r#"{
  "version": "1.0.0",
  "CCENV_HOST": "127.0.0.1",
  "CCENV_PORT": 9000,
  "API_PROXY": "http://127.0.0.1:7890",
  "LOGGING_LEVEL": "debug",
  "API_TIMEOUT_MS": 30000,
  "routing": { "strategy": "robin" },
  "providers": [
    {
      "name": "primary",
      "state": "on",
      "env": {
        "ANTHROPIC_BASE_URL": "https://api.primary.com",
        "ANTHROPIC_AUTH_TOKEN": "sk-primary-token",
        "ANTHROPIC_MODEL": "deepseek-ai/DeepSeek-V3"
      }
    },
    {
      "name": "backup",
      "state": "off",
      "env": { "ANTHROPIC_BASE_URL": "https://api.backup.com", "ANTHROPIC_API_KEY": "sk-backup" }
    }
  ]
}"#,
        );

        let snapshot = load_config(temp_file.path()).unwrap();
        assert_eq!(snapshot.version.as_deref(), Some("1.0.0"));
        assert_eq!(snapshot.host, "127.0.0.1");
        assert_eq!(snapshot.api_port, 9000);
        assert_eq!(snapshot.status_port, 8999);
        assert_eq!(snapshot.log_level, "DEBUG");
        assert_eq!(snapshot.upstream_timeout, Duration::from_millis(30_000));
        assert_eq!(snapshot.strategy, RoutingStrategy::RoundRobin);
        assert_eq!(snapshot.providers.len(), 2);

        let primary = &snapshot.providers[0];
        assert_eq!(primary.name, "primary");
        assert!(primary.enabled);
        assert_eq!(
            primary.credential,
            Some(Credential::Bearer("sk-primary-token".to_string()))
        );
        assert_eq!(
            primary.target_model.as_deref(),
            Some("deepseek-ai/DeepSeek-V3")
        );
        assert!(!snapshot.providers[1].enabled);
    }

    #[test]
    fn test_example_config_loads_and_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        write_example_config(&path).unwrap();
        let snapshot = load_config(&path).unwrap();
        assert_eq!(snapshot.api_port, 9999);
        assert_eq!(snapshot.active_providers().count(), 1);

        assert!(matches!(
            write_example_config(&path),
            Err(ConfigError::Write { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(&dir.path().join("settings.json"));
        assert!(matches!(result, Err(ConfigError::NotFound { .. })));
    }

    #[test]
    fn test_first_run_writes_example_into_missing_directory() {
        let home = tempfile::tempdir().unwrap();
        let path = home.path().join(CONFIG_DIR_NAME).join(SETTINGS_FILE_NAME);

        let result = load_config_or_write_example(&path);
        assert!(matches!(result, Err(ConfigError::ExampleWritten { .. })));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), EXAMPLE_SETTINGS);

        // The directory now exists and the second run loads the example.
        let snapshot = load_config_or_write_example(&path).unwrap();
        assert_eq!(snapshot.providers.len(), 2);
        assert!(crate::adapters::FileConfigSource::new(&path).is_ok());
    }

    #[test]
    fn test_malformed_json() {
        let temp_file = write_settings("{ \"providers\": [ ");
        let result = load_config(temp_file.path());
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let temp_file = write_settings(
            r#"{ "providers": [ { "name": "a", "state": "on", "env": {} } ] }"#,
        );
        assert!(matches!(
            load_config(temp_file.path()),
            Err(ConfigError::Invalid(_))
        ));
        assert!(load_config_unchecked(temp_file.path()).is_ok());
    }
}
