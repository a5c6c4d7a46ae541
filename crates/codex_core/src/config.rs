//! Repository configuration.
//!
//! # Responsibility
//! - Hold the tunables of the optimistic-concurrency loop and store startup.
//! - Provide the category templates used to seed a new codex.
//!
//! # Invariants
//! - Every field has a default; a partial JSON object is a valid config.
//! - `max_attempts >= 1` and `ready_poll_interval_ms >= 1` after loading.

use crate::model::codex::CategoryTemplate;
use serde::Deserialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_BACKOFF_MS: u64 = 50;
const DEFAULT_MAX_BACKOFF_MS: u64 = 1_000;
const DEFAULT_READY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_READY_POLL_INTERVAL_MS: u64 = 50;
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Configuration load/validation error.
#[derive(Debug)]
pub enum ConfigError {
    Json(serde_json::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(err) => write!(f, "invalid repository config: {err}"),
            Self::Invalid(message) => write!(f, "invalid repository config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Json(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

/// Tunables for [`crate::CodexRepository`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Total write attempts per mutation, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub base_backoff_ms: u64,
    /// Upper bound for a single retry delay.
    pub max_backoff_ms: u64,
    /// How long to wait for the store to report ready before failing.
    pub ready_timeout_ms: u64,
    pub ready_poll_interval_ms: u64,
    /// Buffered snapshots per subscriber before it starts lagging.
    pub channel_capacity: usize,
    pub default_categories: Vec<CategoryTemplate>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff_ms: DEFAULT_BASE_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            ready_timeout_ms: DEFAULT_READY_TIMEOUT_MS,
            ready_poll_interval_ms: DEFAULT_READY_POLL_INTERVAL_MS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            default_categories: default_category_templates(),
        }
    }
}

impl RepositoryConfig {
    /// Parses a JSON object; missing fields take their defaults.
    ///
    /// # Errors
    /// - Returns `ConfigError::Json` for malformed JSON or wrong field types.
    /// - Returns `ConfigError::Invalid` when a value is out of range.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.ready_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "ready_poll_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (0-based): `base * 2^retry`, capped.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1_u64.checked_shl(retry).unwrap_or(u64::MAX);
        let delay_ms = self
            .base_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms.max(1))
    }
}

/// Characters / Locations / Objects / Notes.
pub fn default_category_templates() -> Vec<CategoryTemplate> {
    [
        ("Characters", "People and creatures in the story", "user"),
        ("Locations", "Places where the story happens", "map-pin"),
        ("Objects", "Items, artifacts and possessions", "box"),
        ("Notes", "Anything else worth remembering", "sticky-note"),
    ]
    .into_iter()
    .map(|(title, description, icon)| CategoryTemplate {
        title: title.to_string(),
        description: Some(description.to_string()),
        icon: Some(icon.to_string()),
    })
    .collect()
}
