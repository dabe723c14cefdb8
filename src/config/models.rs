//! Configuration data structures for ccenv.
//!
//! [`SettingsFile`] mirrors the on-disk JSON document key for key. It is
//! normalized once into an immutable [`ConfigSnapshot`], which is what the
//! rest of the crate consumes. A new snapshot always replaces the previous one
//! wholesale.
use std::{collections::HashMap, fmt, time::Duration};

use serde::{Deserialize, Serialize};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_API_PORT: u16 = 9999;
pub const DEFAULT_TIMEOUT_MS: u64 = 600_000;
pub const DEFAULT_LOG_LEVEL: &str = "INFO";

pub const ENV_BASE_URL: &str = "ANTHROPIC_BASE_URL";
pub const ENV_AUTH_TOKEN: &str = "ANTHROPIC_AUTH_TOKEN";
pub const ENV_API_KEY: &str = "ANTHROPIC_API_KEY";
pub const ENV_MODEL: &str = "ANTHROPIC_MODEL";

/// Raw settings document as written by the operator.
///
/// Every field is optional; defaults are applied by [`ConfigSnapshot::from_settings`].
/// Lowercase aliases keep deserialization working whichever key case the
/// loader hands over.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct SettingsFile {
    pub version: Option<String>,
    #[serde(rename = "CCENV_HOST", alias = "ccenv_host")]
    pub host: Option<String>,
    #[serde(rename = "CCENV_PORT", alias = "ccenv_port")]
    pub port: Option<u16>,
    #[serde(rename = "CCENV_STATUS_PORT", alias = "ccenv_status_port")]
    pub status_port: Option<u16>,
    #[serde(rename = "API_PROXY", alias = "api_proxy")]
    pub api_proxy: Option<String>,
    #[serde(rename = "LOGGING_LEVEL", alias = "logging_level")]
    pub logging_level: Option<String>,
    #[serde(rename = "API_TIMEOUT_MS", alias = "api_timeout_ms")]
    pub api_timeout_ms: Option<u64>,
    pub providers: Vec<ProviderEntry>,
    pub routing: RoutingSection,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ProviderEntry {
    pub name: String,
    /// `"on"` or `"off"`; anything other than `"on"` disables the provider.
    pub state: String,
    pub env: HashMap<String, String>,
}

impl ProviderEntry {
    /// Looks up an env value, ignoring key case and treating empty values as absent.
    fn env_value(&self, key: &str) -> Option<String> {
        self.env
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct RoutingSection {
    pub strategy: Option<String>,
}

/// Provider selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Always the first available provider in configuration order.
    #[default]
    Failover,
    /// Rotate among the currently available providers.
    RoundRobin,
}

impl RoutingStrategy {
    /// Parses the file value; unknown strategies fall back to failover.
    pub fn from_setting(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("robin") => RoutingStrategy::RoundRobin,
            _ => RoutingStrategy::Failover,
        }
    }

    pub fn as_setting(&self) -> &'static str {
        match self {
            RoutingStrategy::Failover => "default",
            RoutingStrategy::RoundRobin => "robin",
        }
    }
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingStrategy::Failover => f.write_str("failover"),
            RoutingStrategy::RoundRobin => f.write_str("round-robin"),
        }
    }
}

/// Upstream credential. A bearer token wins when both are configured.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    ApiKey(String),
}

impl Credential {
    pub fn auth_type(&self) -> &'static str {
        match self {
            Credential::Bearer(_) => "Bearer Token",
            Credential::ApiKey(_) => "API Key",
        }
    }

    pub fn masked(&self) -> String {
        match self {
            Credential::Bearer(v) | Credential::ApiKey(v) => mask_secret(v),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Bearer(_) => write!(f, "Bearer({})", self.masked()),
            Credential::ApiKey(_) => write!(f, "ApiKey({})", self.masked()),
        }
    }
}

/// Keeps the first and last four characters of secrets longer than eight characters.
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}{}{tail}", "*".repeat(chars.len() - 8))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub name: String,
    pub enabled: bool,
    pub base_url: Option<String>,
    pub credential: Option<Credential>,
    pub target_model: Option<String>,
}

impl ProviderConfig {
    fn from_entry(entry: &ProviderEntry) -> Self {
        let credential = entry
            .env_value(ENV_AUTH_TOKEN)
            .map(Credential::Bearer)
            .or_else(|| entry.env_value(ENV_API_KEY).map(Credential::ApiKey));

        Self {
            name: entry.name.trim().to_string(),
            enabled: entry.state.trim().eq_ignore_ascii_case("on"),
            base_url: entry
                .env_value(ENV_BASE_URL)
                .map(|url| url.trim_end_matches('/').to_string()),
            credential,
            target_model: entry.env_value(ENV_MODEL),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.credential.is_some()
    }
}

/// The immutable, normalized result of parsing the whole settings file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub version: Option<String>,
    pub host: String,
    pub api_port: u16,
    pub status_port: u16,
    pub api_proxy: Option<String>,
    pub log_level: String,
    pub upstream_timeout: Duration,
    pub strategy: RoutingStrategy,
    pub providers: Vec<ProviderConfig>,
}

impl ConfigSnapshot {
    pub fn from_settings(settings: &SettingsFile) -> Self {
        let api_port = settings.port.unwrap_or(DEFAULT_API_PORT);
        let status_port = settings
            .status_port
            .unwrap_or_else(|| api_port.saturating_sub(1));

        let api_proxy = settings
            .api_proxy
            .as_deref()
            .map(str::trim)
            .filter(|p| p.starts_with("http://") || p.starts_with("https://"))
            .map(str::to_string);

        let host = settings
            .host
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .unwrap_or(DEFAULT_HOST)
            .to_string();

        let log_level = settings
            .logging_level
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(DEFAULT_LOG_LEVEL)
            .to_uppercase();

        let timeout_ms = settings
            .api_timeout_ms
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_TIMEOUT_MS);

        Self {
            version: settings.version.clone(),
            host,
            api_port,
            status_port,
            api_proxy,
            log_level,
            upstream_timeout: Duration::from_millis(timeout_ms),
            strategy: RoutingStrategy::from_setting(settings.routing.strategy.as_deref()),
            providers: settings
                .providers
                .iter()
                .map(ProviderConfig::from_entry)
                .collect(),
        }
    }

    /// Providers that are switched on and carry a credential.
    pub fn active_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers
            .iter()
            .filter(|p| p.enabled && p.has_credentials())
    }

    /// Base URL a local client uses to reach the API listener.
    pub fn local_base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.api_port)
    }
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self::from_settings(&SettingsFile::default())
    }
}
