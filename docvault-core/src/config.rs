//! Document engine configuration.
//!
//! Injected at document construction instead of living in process-wide
//! mutable state. `DocumentConfig::default()` is the scoped default.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Timing knobs for autosave, versioning and stall detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentConfig {
    /// Delay between the last registered change and the autosave (default 30s)
    #[serde(default = "default_autosave_delay")]
    pub autosave_delay_secs: f64,

    /// Autosave delay for remotely-synced locations (default 120s)
    #[serde(default = "default_remote_autosave_delay")]
    pub remote_autosave_delay_secs: f64,

    /// Minimum time between retained versions created by explicit saves
    /// (default 900 = 15 min, 0 disables automatic versioning)
    #[serde(default = "default_autoversioning_interval")]
    pub autoversioning_interval_secs: f64,

    /// Time after which a queued operation is reported as stalled (default 30s)
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: f64,
}

fn default_autosave_delay() -> f64 { 30.0 }
fn default_remote_autosave_delay() -> f64 { 120.0 }
fn default_autoversioning_interval() -> f64 { 900.0 }
fn default_operation_timeout() -> f64 { 30.0 }

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            autosave_delay_secs: default_autosave_delay(),
            remote_autosave_delay_secs: default_remote_autosave_delay(),
            autoversioning_interval_secs: default_autoversioning_interval(),
            operation_timeout_secs: default_operation_timeout(),
        }
    }
}

impl DocumentConfig {
    /// Defaults overridden by `DOCVAULT_AUTOSAVE_DELAY`,
    /// `DOCVAULT_REMOTE_AUTOSAVE_DELAY`, `DOCVAULT_AUTOVERSIONING_INTERVAL`
    /// and `DOCVAULT_OPERATION_TIMEOUT` (seconds).
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = env_secs("DOCVAULT_AUTOSAVE_DELAY")? {
            config.autosave_delay_secs = v;
        }
        if let Some(v) = env_secs("DOCVAULT_REMOTE_AUTOSAVE_DELAY")? {
            config.remote_autosave_delay_secs = v;
        }
        if let Some(v) = env_secs("DOCVAULT_AUTOVERSIONING_INTERVAL")? {
            config.autoversioning_interval_secs = v;
        }
        if let Some(v) = env_secs("DOCVAULT_OPERATION_TIMEOUT")? {
            config.operation_timeout_secs = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&data)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("autosave_delay_secs", self.autosave_delay_secs),
            ("remote_autosave_delay_secs", self.remote_autosave_delay_secs),
            ("autoversioning_interval_secs", self.autoversioning_interval_secs),
            ("operation_timeout_secs", self.operation_timeout_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                anyhow::bail!("{name} must be a non-negative number of seconds, got {value}");
            }
            if Duration::try_from_secs_f64(value).is_err() {
                anyhow::bail!("{name} is too large, got {value}");
            }
        }
        Ok(())
    }

    pub fn autosave_delay(&self) -> Duration {
        secs(self.autosave_delay_secs)
    }

    pub fn remote_autosave_delay(&self) -> Duration {
        secs(self.remote_autosave_delay_secs)
    }

    /// `None` when automatic versioning is disabled.
    pub fn autoversioning_interval(&self) -> Option<Duration> {
        if self.autoversioning_interval_secs == 0.0 {
            None
        } else {
            Some(secs(self.autoversioning_interval_secs))
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        secs(self.operation_timeout_secs)
    }
}

/// Out-of-range values saturate instead of panicking.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(if value > 0.0 {
        Duration::MAX
    } else {
        Duration::ZERO
    })
}

fn env_secs(key: &str) -> Result<Option<f64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<f64>()
            .map(Some)
            .with_context(|| format!("{key} must be a number of seconds")),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {key}")),
    }
}
