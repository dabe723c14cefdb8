//! Provider selection with failure-triggered cooldown.
//!
//! The router owns one runtime state record per configured provider. A
//! provider that collects [`FAILURE_THRESHOLD`] failures is excluded from
//! selection for [`COOLDOWN`]. Expiry is reconciled lazily on the next
//! selection; no timer runs in the background.
use std::{
    sync::{Arc, PoisonError, RwLock, RwLockWriteGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::{
    config::{ConfigSnapshot, ProviderConfig, RoutingStrategy},
    error::ProxyError,
};

/// Consecutive failures that put a provider into cooldown.
pub const FAILURE_THRESHOLD: u32 = 5;
/// Length of the cooldown window.
pub const COOLDOWN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
struct ProviderState {
    config: Arc<ProviderConfig>,
    /// Switched on and carrying a credential. Fixed for the router's lifetime.
    eligible: bool,
    failure_count: u32,
    last_failure: Option<Instant>,
    disabled: bool,
    disabled_until: Option<Instant>,
}

impl ProviderState {
    fn new(config: ProviderConfig) -> Self {
        let eligible = config.enabled && config.has_credentials();
        Self {
            config: Arc::new(config),
            eligible,
            failure_count: 0,
            last_failure: None,
            disabled: false,
            disabled_until: None,
        }
    }

    fn available(&self) -> bool {
        self.eligible && !self.disabled
    }
}

#[derive(Debug)]
struct RouterState {
    providers: Vec<ProviderState>,
    cursor: usize,
}

/// Diagnostic view of one provider, served by `/ccenv/providers`.
///
/// `disabled` is reported as stored, so it can stay `true` past
/// `disabled_until` until the next selection reconciles it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProviderStatus {
    pub name: String,
    pub enabled: bool,
    pub has_credentials: bool,
    pub target_model: Option<String>,
    pub failure_count: u32,
    pub disabled: bool,
    pub disabled_until: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

/// Thread-safe provider router.
#[derive(Debug)]
pub struct ProviderRouter {
    strategy: RoutingStrategy,
    state: RwLock<RouterState>,
}

impl ProviderRouter {
    pub fn new(snapshot: &ConfigSnapshot) -> Self {
        Self::from_providers(snapshot.providers.clone(), snapshot.strategy)
    }

    pub fn from_providers(providers: Vec<ProviderConfig>, strategy: RoutingStrategy) -> Self {
        let providers: Vec<ProviderState> = providers.into_iter().map(ProviderState::new).collect();

        for provider in &providers {
            if provider.config.enabled && !provider.eligible {
                tracing::warn!(
                    provider = %provider.config.name,
                    "Provider has no credentials configured; it will never be selected"
                );
            }
        }

        tracing::debug!(
            strategy = %strategy,
            total = providers.len(),
            eligible = providers.iter().filter(|p| p.eligible).count(),
            "Provider router created"
        );

        Self {
            strategy,
            state: RwLock::new(RouterState {
                providers,
                cursor: 0,
            }),
        }
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, RouterState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Picks a provider according to the routing strategy.
    pub fn select_provider(&self) -> Result<Arc<ProviderConfig>, ProxyError> {
        let now = Instant::now();
        let mut state = self.write_state();

        for provider in state.providers.iter_mut() {
            if provider.disabled && provider.disabled_until.is_none_or(|until| now >= until) {
                provider.disabled = false;
                provider.disabled_until = None;
                provider.failure_count = 0;
                tracing::info!(
                    provider = %provider.config.name,
                    "Provider cooldown expired, re-enabled"
                );
            }
        }

        let available: Vec<usize> = state
            .providers
            .iter()
            .enumerate()
            .filter(|(_, p)| p.available())
            .map(|(i, _)| i)
            .collect();

        let index = match (self.strategy, available.len()) {
            (_, 0) => return Err(ProxyError::NoProviderAvailable),
            (RoutingStrategy::Failover, _) | (RoutingStrategy::RoundRobin, 1) => available[0],
            (RoutingStrategy::RoundRobin, len) => {
                let picked = available[state.cursor % len];
                state.cursor = state.cursor.wrapping_add(1);
                picked
            }
        };

        Ok(Arc::clone(&state.providers[index].config))
    }

    /// Counts a failure against `name`, arming (or re-arming) the cooldown at the threshold.
    pub fn record_failure(&self, name: &str) {
        let now = Instant::now();
        let mut state = self.write_state();
        let Some(provider) = state.providers.iter_mut().find(|p| p.config.name == name) else {
            tracing::warn!(provider = %name, "Failure recorded for unknown provider");
            return;
        };

        provider.failure_count = provider.failure_count.saturating_add(1);
        provider.last_failure = Some(now);

        if provider.failure_count >= FAILURE_THRESHOLD {
            provider.disabled = true;
            provider.disabled_until = Some(now + COOLDOWN);
            tracing::warn!(
                provider = %name,
                failures = provider.failure_count,
                cooldown_secs = COOLDOWN.as_secs(),
                "Provider disabled after repeated failures"
            );
        } else {
            tracing::debug!(
                provider = %name,
                failures = provider.failure_count,
                "Provider failure recorded"
            );
        }
    }

    /// Clears the failure counter. An active cooldown is left untouched.
    pub fn record_success(&self, name: &str) {
        let mut state = self.write_state();
        match state.providers.iter_mut().find(|p| p.config.name == name) {
            Some(provider) if provider.failure_count > 0 => {
                tracing::debug!(provider = %name, "Provider recovered, failure count reset");
                provider.failure_count = 0;
            }
            Some(_) => {}
            None => tracing::warn!(provider = %name, "Success recorded for unknown provider"),
        }
    }

    pub fn provider_status(&self) -> Vec<ProviderStatus> {
        let now = Instant::now();
        let wall_now = Utc::now();
        let to_wall = |instant: Instant| -> Option<DateTime<Utc>> {
            let offset = if instant >= now {
                chrono::Duration::from_std(instant - now).ok()?
            } else {
                -chrono::Duration::from_std(now - instant).ok()?
            };
            Some(wall_now + offset)
        };

        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .providers
            .iter()
            .map(|p| ProviderStatus {
                name: p.config.name.clone(),
                enabled: p.config.enabled,
                has_credentials: p.config.has_credentials(),
                target_model: p.config.target_model.clone(),
                failure_count: p.failure_count,
                disabled: p.disabled,
                disabled_until: p.disabled_until.and_then(to_wall),
                last_failure: p.last_failure.and_then(to_wall),
            })
            .collect()
    }

    /// Number of providers that are switched on and carry credentials.
    pub fn eligible_count(&self) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.providers.iter().filter(|p| p.eligible).count()
    }
}
