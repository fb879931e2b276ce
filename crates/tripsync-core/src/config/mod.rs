//! Runtime configuration for the trip store and sync scheduler.
//!
//! A `CoreConfig` is read from a JSON document provisioned by the application
//! and can be overridden through `TRIPSYNC_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::{normalize_text_option, parse_flag};

const ENV_DB_PATH: &str = "TRIPSYNC_DB_PATH";
const ENV_SYNC_PERIOD: &str = "TRIPSYNC_SYNC_PERIOD_SECS";
const ENV_SYNC_MIN_PERIOD: &str = "TRIPSYNC_SYNC_MIN_PERIOD_SECS";
const ENV_AUTO_SYNC: &str = "TRIPSYNC_AUTO_SYNC";

const DEFAULT_SYNC_PERIOD_SECS: u64 = 15;
const DEFAULT_SYNC_MIN_PERIOD_SECS: u64 = 60;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    /// Store location; `None` keeps everything in memory
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub sync: SyncSchedule,
}

/// When timer-driven sync passes run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct SyncSchedule {
    /// Timer period between sync attempts
    pub period_secs: u64,
    /// A timer tick is skipped when the previous pass ended more recently than this
    pub min_period_secs: u64,
    pub auto_sync: bool,
}

impl Default for SyncSchedule {
    fn default() -> Self {
        Self {
            period_secs: DEFAULT_SYNC_PERIOD_SECS,
            min_period_secs: DEFAULT_SYNC_MIN_PERIOD_SECS,
            auto_sync: true,
        }
    }
}

impl SyncSchedule {
    pub const fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub const fn min_period(&self) -> Duration {
        Duration::from_secs(self.min_period_secs)
    }
}

impl CoreConfig {
    /// Parse and validate a JSON config document
    pub fn from_json(payload: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(payload)
            .map_err(|error| Error::Config(format!("invalid config JSON: {error}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let payload = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&payload)
    }

    /// Apply `TRIPSYNC_*` environment overrides
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(path) = normalize_text_option(lookup(ENV_DB_PATH)) {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Some(value) = normalize_text_option(lookup(ENV_SYNC_PERIOD)) {
            self.sync.period_secs = parse_secs(ENV_SYNC_PERIOD, &value)?;
        }
        if let Some(value) = normalize_text_option(lookup(ENV_SYNC_MIN_PERIOD)) {
            self.sync.min_period_secs = parse_secs(ENV_SYNC_MIN_PERIOD, &value)?;
        }
        if let Some(value) = normalize_text_option(lookup(ENV_AUTO_SYNC)) {
            self.sync.auto_sync = parse_flag(&value);
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync.period_secs == 0 {
            return Err(Error::Config(
                "sync.period_secs must be greater than zero".to_string(),
            ));
        }
        if self
            .database_path
            .as_ref()
            .is_some_and(|path| path.as_os_str().is_empty())
        {
            return Err(Error::Config("database_path must not be empty".to_string()));
        }
        Ok(())
    }
}

fn parse_secs(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{key} must be a whole number of seconds, got '{value}'")))
}
