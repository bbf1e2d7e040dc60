//! The run queue: pending run requests and the admission state machine.

pub mod queue;
pub mod run;

pub use queue::RunQueue;
pub use run::{
    RetryStrategy, RunRequest, RunStatus, AUTO_MATERIALIZE_TAG, BACKFILL_TAG, CONCURRENCY_KEY_TAG,
    MAX_RETRIES_TAG, RETRY_STRATEGY_TAG,
};
