// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
}

// The queueing-and-concurrency subsystems
pub mod daemon; // Polling loop and auto-materialize evaluation
pub mod queue; // Run queue and admission state machine
pub mod slots; // Shared concurrency slot accounting
pub mod steps; // Per-run step concurrency control

pub mod instance;

// Re-exports for convenience
pub use crate::core::config::{
    DaemonConfig, RunQueueConfig, StepConcurrencyConfig, TagConcurrencyLimit,
};
pub use crate::core::errors::{ConductorError, Result};
pub use crate::daemon::{
    AssetKey, AssetNode, AssetStateView, AutoMaterialize, AutoMaterializeEvaluator, Daemon,
    DaemonHandle, ExecutionBackend, FreshnessPolicy,
};
pub use crate::instance::Instance;
pub use crate::queue::{RetryStrategy, RunQueue, RunRequest, RunStatus};
pub use crate::slots::{LimitScope, ScopeKey, SlotClaim, SlotLimit, SlotTable};
pub use crate::steps::StepConcurrencyController;
