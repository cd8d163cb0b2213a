use crate::dedup::DedupConfig;
use crate::retry::BackoffPolicy;
use crate::trigger::TriggerConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error raised while parsing or validating pipeline configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config must be a JSON object")]
    NotAnObject,
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Typed knobs for one pipeline instance. Invalid values are rejected at
/// load time rather than clamped, so a misconfigured deployment fails loudly
/// instead of running with surprising bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub trigger: TriggerConfig,
    pub dedup: DedupSettings,
    pub merge_backoff: BackoffPolicy,
    pub analytical_backoff: BackoffPolicy,
}

/// Dedup knobs as they appear in config blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    pub max_batch_events: usize,
    pub workers: usize,
}

impl Default for DedupSettings {
    fn default() -> Self {
        let defaults = DedupConfig::default();
        Self {
            max_batch_events: defaults.max_batch_events,
            workers: defaults.workers,
        }
    }
}

impl From<DedupSettings> for DedupConfig {
    fn from(settings: DedupSettings) -> Self {
        Self {
            max_batch_events: settings.max_batch_events,
            workers: settings.workers,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            trigger: TriggerConfig::default(),
            dedup: DedupSettings::default(),
            merge_backoff: BackoffPolicy::default(),
            analytical_backoff: BackoffPolicy {
                base_delay_ms: 100,
                multiplier: 2,
                max_delay_ms: 10_000,
                max_attempts: 3,
            },
        }
    }
}

impl PipelineConfig {
    /// Parses a JSON config blob, filling absent knobs with defaults.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        if !value.is_object() {
            return Err(ConfigError::NotAnObject);
        }
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects knob values the pipeline cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trigger.interval_ms == 0 {
            return Err(invalid("trigger.interval_ms must be positive"));
        }
        if self.trigger.record_cap == 0 {
            return Err(invalid("trigger.record_cap must be positive"));
        }
        if self.trigger.queue_capacity == 0 {
            return Err(invalid("trigger.queue_capacity must be positive"));
        }
        if self.dedup.max_batch_events == 0 {
            return Err(invalid("dedup.max_batch_events must be positive"));
        }
        if self.dedup.workers == 0 {
            return Err(invalid("dedup.workers must be at least 1"));
        }
        if self.merge_backoff.max_attempts == 0 {
            return Err(invalid("merge_backoff.max_attempts must be at least 1"));
        }
        if self.analytical_backoff.max_attempts == 0 {
            return Err(invalid(
                "analytical_backoff.max_attempts must be at least 1",
            ));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}
