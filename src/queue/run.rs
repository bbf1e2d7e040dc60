use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;
use uuid::Uuid;

/// Reserved tag consulted cross-run via the global slot table.
pub const CONCURRENCY_KEY_TAG: &str = "conductor/concurrency_key";
/// Reserved tag: maximum number of run retries after a failure.
pub const MAX_RETRIES_TAG: &str = "conductor/max_retries";
/// Reserved tag: retry strategy, `FROM_FAILURE` (default) or `ALL_STEPS`.
pub const RETRY_STRATEGY_TAG: &str = "conductor/retry_strategy";
/// Reserved tag marking a run kicked off by the auto-materialize daemon.
pub const AUTO_MATERIALIZE_TAG: &str = "conductor/auto_materialize";
/// Reserved tag grouping backfill runs; typically limited key-only so all
/// backfills share one bucket regardless of value.
pub const BACKFILL_TAG: &str = "conductor/backfill";

/// Lifecycle of a run. `Queued` is initial; `Started` is entered only via
/// queue admission; `Success`, `Failure` and `Canceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Queued,
    Started,
    Success,
    Failure,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Canceled)
    }
}

/// How a retried run re-executes its steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetryStrategy {
    #[default]
    FromFailure,
    AllSteps,
}

impl RetryStrategy {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "FROM_FAILURE" => Some(Self::FromFailure),
            "ALL_STEPS" => Some(Self::AllSteps),
            _ => None,
        }
    }
}

/// A request for one execution attempt of a pipeline. Immutable once
/// enqueued; status lives in the queue, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub run_id: String,
    pub tags: BTreeMap<String, String>,
    pub submitted_at: NaiveDateTime,
    pub priority: Option<i32>,
    /// 0 for a first attempt; incremented by the daemon's retry path.
    pub attempt: u32,
}

impl RunRequest {
    pub fn new<S: Into<String>>(run_id: S) -> Self {
        Self {
            run_id: run_id.into(),
            tags: BTreeMap::new(),
            submitted_at: Utc::now().naive_utc(),
            priority: None,
            attempt: 0,
        }
    }

    /// Create a request with a generated run id.
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    pub fn with_tag<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Effective priority: unset means 0.
    pub fn priority(&self) -> i32 {
        self.priority.unwrap_or(0)
    }

    /// Retry budget from the reserved tag. Missing or unparseable values
    /// mean no retries.
    pub fn max_retries(&self) -> u32 {
        match self.tags.get(MAX_RETRIES_TAG) {
            None => 0,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(run_id = %self.run_id, raw = %raw, "unparseable max_retries tag, treating as 0");
                0
            }),
        }
    }

    /// Retry strategy from the reserved tag, defaulting to
    /// [`RetryStrategy::FromFailure`].
    pub fn retry_strategy(&self) -> RetryStrategy {
        match self.tags.get(RETRY_STRATEGY_TAG) {
            None => RetryStrategy::default(),
            Some(raw) => RetryStrategy::parse(raw).unwrap_or_else(|| {
                warn!(run_id = %self.run_id, raw = %raw, "unknown retry strategy, using FROM_FAILURE");
                RetryStrategy::default()
            }),
        }
    }

    pub fn is_auto_materialize(&self) -> bool {
        self.tags
            .get(AUTO_MATERIALIZE_TAG)
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    /// Build the follow-up request for a retry of this run: fresh id,
    /// same tags and priority, attempt incremented.
    pub fn retry_request(&self) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            tags: self.tags.clone(),
            submitted_at: Utc::now().naive_utc(),
            priority: self.priority,
            attempt: self.attempt + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminality() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Started.is_terminal());
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Failure.is_terminal());
        assert!(RunStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_reserved_tag_accessors() {
        let run = RunRequest::new("run_1")
            .with_tag(MAX_RETRIES_TAG, "3")
            .with_tag(RETRY_STRATEGY_TAG, "ALL_STEPS")
            .with_tag(AUTO_MATERIALIZE_TAG, "true");
        assert_eq!(run.max_retries(), 3);
        assert_eq!(run.retry_strategy(), RetryStrategy::AllSteps);
        assert!(run.is_auto_materialize());
    }

    #[test]
    fn test_tag_defaults() {
        let run = RunRequest::new("run_1");
        assert_eq!(run.max_retries(), 0);
        assert_eq!(run.retry_strategy(), RetryStrategy::FromFailure);
        assert!(!run.is_auto_materialize());
        assert_eq!(run.priority(), 0);
    }

    #[test]
    fn test_garbage_tags_fall_back() {
        let run = RunRequest::new("run_1")
            .with_tag(MAX_RETRIES_TAG, "lots")
            .with_tag(RETRY_STRATEGY_TAG, "SOMETIMES");
        assert_eq!(run.max_retries(), 0);
        assert_eq!(run.retry_strategy(), RetryStrategy::FromFailure);
    }

    #[test]
    fn test_retry_request() {
        let run = RunRequest::new("run_1")
            .with_tag(MAX_RETRIES_TAG, "2")
            .with_priority(5);
        let retry = run.retry_request();
        assert_ne!(retry.run_id, run.run_id);
        assert_eq!(retry.attempt, 1);
        assert_eq!(retry.priority, Some(5));
        assert_eq!(retry.tags, run.tags);
    }
}
