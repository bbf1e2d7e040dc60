use crate::core::errors::{ConductorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// A concurrency limit applied to runs (or steps) carrying a given tag.
///
/// Without a `value`, the limit is shared by every run that carries the tag
/// key, regardless of the tag's value. With a `value`, only runs carrying
/// that exact key/value pair count against it. With
/// `apply_limit_per_unique_value`, one independent bucket is tracked per
/// distinct value observed for the key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagConcurrencyLimit {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    pub limit: i64,
    #[serde(default, rename = "applyLimitPerUniqueValue")]
    pub apply_limit_per_unique_value: bool,
}

impl TagConcurrencyLimit {
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(ConductorError::configuration_field(
                "tag concurrency limit key must not be empty",
                "tag_concurrency_limits.key",
            ));
        }
        if self.limit < 0 {
            return Err(ConductorError::configuration_field(
                format!(
                    "tag concurrency limit for key '{}' must be >= 0, got {}",
                    self.key, self.limit
                ),
                "tag_concurrency_limits.limit",
            ));
        }
        if self.apply_limit_per_unique_value && self.value.is_some() {
            return Err(ConductorError::configuration_field(
                format!(
                    "tag concurrency limit for key '{}' sets both a value and applyLimitPerUniqueValue",
                    self.key
                ),
                "tag_concurrency_limits",
            ));
        }
        Ok(())
    }
}

fn default_max_concurrent_runs() -> i64 {
    10
}

fn default_dequeue_interval_ms() -> u64 {
    1_000
}

/// Run queue configuration, read at daemon startup or reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunQueueConfig {
    /// Global cap on concurrently started runs. `-1` disables the global
    /// check (tag limits still apply); `0` blocks all admission, stalling
    /// the queue by design.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: i64,
    /// Ordered list of tag-scoped limits.
    #[serde(default)]
    pub tag_concurrency_limits: Vec<TagConcurrencyLimit>,
    #[serde(default = "default_dequeue_interval_ms")]
    pub dequeue_interval_ms: u64,
}

impl Default for RunQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
            tag_concurrency_limits: Vec::new(),
            dequeue_interval_ms: default_dequeue_interval_ms(),
        }
    }
}

impl RunQueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_runs < -1 {
            return Err(ConductorError::configuration_field(
                format!(
                    "max_concurrent_runs must be -1 (unlimited), 0 (block all) or positive, got {}",
                    self.max_concurrent_runs
                ),
                "max_concurrent_runs",
            ));
        }
        if self.dequeue_interval_ms == 0 {
            return Err(ConductorError::configuration_field(
                "dequeue_interval_ms must be greater than 0",
                "dequeue_interval_ms",
            ));
        }
        for limit in &self.tag_concurrency_limits {
            limit.validate()?;
        }
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConductorError::io("read_run_queue_config", e))?;
        Self::from_yaml_str(&contents)
    }

    pub fn dequeue_interval(&self) -> Duration {
        Duration::from_millis(self.dequeue_interval_ms)
    }
}

/// Per-job executor concurrency configuration, scoped to one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepConcurrencyConfig {
    /// Cap on steps executing in parallel within the run. `None` means
    /// unbounded.
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub tag_concurrency_limits: Vec<TagConcurrencyLimit>,
}

impl StepConcurrencyConfig {
    pub fn validate(&self) -> Result<()> {
        for limit in &self.tag_concurrency_limits {
            limit.validate()?;
        }
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }
}

fn default_max_materializations_per_minute() -> u32 {
    1
}

fn default_claim_blocked_interval_ms() -> u64 {
    1_000
}

/// Daemon loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_dequeue_interval_ms")]
    pub dequeue_interval_ms: u64,
    /// Per-asset cap on auto-materialize kick-offs.
    #[serde(default = "default_max_materializations_per_minute")]
    pub max_materializations_per_minute: u32,
    /// Minimum interval between re-checks of a blocked global
    /// concurrency-key claim.
    #[serde(default = "default_claim_blocked_interval_ms")]
    pub claim_blocked_interval_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            dequeue_interval_ms: default_dequeue_interval_ms(),
            max_materializations_per_minute: default_max_materializations_per_minute(),
            claim_blocked_interval_ms: default_claim_blocked_interval_ms(),
        }
    }
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dequeue_interval_ms == 0 {
            return Err(ConductorError::configuration_field(
                "dequeue_interval_ms must be greater than 0",
                "dequeue_interval_ms",
            ));
        }
        if self.max_materializations_per_minute == 0 {
            return Err(ConductorError::configuration_field(
                "max_materializations_per_minute must be greater than 0",
                "max_materializations_per_minute",
            ));
        }
        Ok(())
    }

    pub fn dequeue_interval(&self) -> Duration {
        Duration::from_millis(self.dequeue_interval_ms)
    }

    pub fn claim_blocked_interval(&self) -> Duration {
        Duration::from_millis(self.claim_blocked_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunQueueConfig::default();
        assert_eq!(config.max_concurrent_runs, 10);
        assert!(config.tag_concurrency_limits.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_max_concurrent_runs() {
        let config = RunQueueConfig {
            max_concurrent_runs: -2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sentinel_values_accepted() {
        for value in [-1, 0, 25] {
            let config = RunQueueConfig {
                max_concurrent_runs: value,
                ..Default::default()
            };
            assert!(config.validate().is_ok(), "value {} should be valid", value);
        }
    }

    #[test]
    fn test_negative_tag_limit_rejected() {
        let config = RunQueueConfig {
            tag_concurrency_limits: vec![TagConcurrencyLimit {
                key: "database".to_string(),
                value: None,
                limit: -1,
                apply_limit_per_unique_value: false,
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
max_concurrent_runs: 25
tag_concurrency_limits:
  - key: database
    value: redshift
    limit: 4
  - key: use-case
    limit: 3
    applyLimitPerUniqueValue: true
"#;
        let config = RunQueueConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.max_concurrent_runs, 25);
        assert_eq!(config.tag_concurrency_limits.len(), 2);
        assert_eq!(
            config.tag_concurrency_limits[0].value.as_deref(),
            Some("redshift")
        );
        assert!(config.tag_concurrency_limits[1].apply_limit_per_unique_value);
    }

    #[test]
    fn test_yaml_invalid_limit_fails_fast() {
        let yaml = r#"
max_concurrent_runs: -5
"#;
        assert!(RunQueueConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_value_and_per_unique_value_conflict() {
        let limit = TagConcurrencyLimit {
            key: "team".to_string(),
            value: Some("data".to_string()),
            limit: 2,
            apply_limit_per_unique_value: true,
        };
        assert!(limit.validate().is_err());
    }

    #[test]
    fn test_step_config_yaml() {
        let yaml = r#"
max_concurrent: 4
tag_concurrency_limits:
  - key: database
    limit: 1
"#;
        let config = StepConcurrencyConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.max_concurrent, Some(4));
        assert_eq!(config.tag_concurrency_limits.len(), 1);
    }

    #[test]
    fn test_daemon_config_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.max_materializations_per_minute, 1);
        assert_eq!(config.claim_blocked_interval(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }
}
