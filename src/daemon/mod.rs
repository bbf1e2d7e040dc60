//! The coordinating daemon: a fixed-interval polling loop that admits
//! queued runs, hands them to the execution backend, and evaluates
//! auto-materialization.

pub mod automaterialize;

pub use automaterialize::{
    AssetKey, AssetNode, AssetStateView, AutoMaterializeEvaluator, FreshnessPolicy, ASSET_KEY_TAG,
};

use crate::core::config::DaemonConfig;
use crate::core::errors::Result;
use crate::queue::{RunQueue, RunRequest, RunStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// The execution backend collaborator. Dispatch is a single call that
/// either acknowledges start (slots stay reserved) or fails
/// synchronously (slots are released immediately and the run is marked
/// failed).
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn launch(&self, run: &RunRequest) -> anyhow::Result<()>;
}

/// Auto-materialize wiring: the evaluator plus the event-log view it
/// reads asset state from.
pub struct AutoMaterialize {
    pub evaluator: Arc<AutoMaterializeEvaluator>,
    pub view: Arc<dyn AssetStateView>,
}

/// One coordinating daemon per deployment. Polling is cooperative: each
/// tick is short and atomic, and stopping the daemon just stops the
/// timer.
pub struct Daemon {
    config: DaemonConfig,
    queue: Arc<RunQueue>,
    backend: Arc<dyn ExecutionBackend>,
    auto_materialize: Option<AutoMaterialize>,
}

impl Daemon {
    pub fn new(
        config: DaemonConfig,
        queue: Arc<RunQueue>,
        backend: Arc<dyn ExecutionBackend>,
        auto_materialize: Option<AutoMaterialize>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            queue,
            backend,
            auto_materialize,
        })
    }

    /// One poll iteration: drain every currently-admissible run into the
    /// backend, then evaluate auto-materialization. Public so tests and
    /// embedding callers can drive the loop themselves.
    pub async fn tick(&self) -> Result<()> {
        loop {
            match self.queue.try_dequeue_next()? {
                Some(run) => self.dispatch(run).await?,
                None => break,
            }
        }

        if let Some(auto) = &self.auto_materialize {
            let now = Utc::now().naive_utc();
            for request in auto.evaluator.evaluate(auto.view.as_ref(), now) {
                if let Err(err) = self.queue.enqueue(request) {
                    // Duplicate ids cannot happen for generated requests;
                    // log and keep the loop alive regardless.
                    error!(error = %err, "failed to enqueue auto-materialize run");
                }
            }
        }
        Ok(())
    }

    /// Hand an admitted run to the backend. A synchronous launch failure
    /// never leaks the reserved slots: the run is marked failed (which
    /// releases them) and, when its tags configure retries, a fresh
    /// retry request is enqueued.
    async fn dispatch(&self, run: RunRequest) -> Result<()> {
        match self.backend.launch(&run).await {
            Ok(()) => {
                debug!(run_id = %run.run_id, "backend acknowledged start");
                Ok(())
            }
            Err(err) => {
                warn!(run_id = %run.run_id, error = %err, "dispatch failed");
                self.queue.record_finished(&run.run_id, RunStatus::Failure)?;
                self.handle_failure(&run)?;
                Ok(())
            }
        }
    }

    /// Common failure bookkeeping: retry when the run's tags allow it;
    /// otherwise, for auto-materialize runs, set the asset's cooldown
    /// (run retries take precedence over the cooldown).
    fn handle_failure(&self, run: &RunRequest) -> Result<()> {
        if run.attempt < run.max_retries() {
            let retry = run.retry_request();
            info!(
                run_id = %run.run_id,
                retry_id = %retry.run_id,
                attempt = retry.attempt,
                "enqueueing run retry"
            );
            self.queue.enqueue(retry)?;
            return Ok(());
        }
        if run.is_auto_materialize() {
            if let (Some(auto), Some(asset)) = (
                &self.auto_materialize,
                AutoMaterializeEvaluator::asset_for_request(run),
            ) {
                auto.evaluator.record_failure(&asset, Utc::now().naive_utc());
            }
        }
        Ok(())
    }

    /// Record the terminal outcome of a run the backend finished
    /// asynchronously. Releases slots, applies the retry policy on
    /// failure, and keeps auto-materialize cooldowns in sync.
    pub fn record_run_outcome(&self, run: &RunRequest, status: RunStatus) -> Result<()> {
        self.queue.record_finished(&run.run_id, status)?;
        match status {
            RunStatus::Failure => self.handle_failure(run)?,
            RunStatus::Success => {
                if run.is_auto_materialize() {
                    if let (Some(auto), Some(asset)) = (
                        &self.auto_materialize,
                        AutoMaterializeEvaluator::asset_for_request(run),
                    ) {
                        auto.evaluator.record_success(&asset);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Spawn the polling loop. Each tick is driven by a fixed interval;
    /// missed ticks are delayed, not bunched.
    pub fn start(self) -> DaemonHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            info!(
                interval_ms = self.config.dequeue_interval_ms,
                "daemon loop started"
            );
            let mut ticker = interval(self.config.dequeue_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.tick().await {
                            error!(error = %err, category = err.category(), "daemon tick failed");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("daemon loop shutting down");
                            break;
                        }
                    }
                }
            }
        });
        DaemonHandle {
            shutdown_tx,
            handle,
        }
    }
}

/// Handle to a running daemon loop.
pub struct DaemonHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl DaemonHandle {
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(self) -> Result<()> {
        self.trigger_shutdown();
        self.handle
            .await
            .map_err(|e| crate::core::errors::ConductorError::internal(format!(
                "daemon task panicked: {e}"
            )))
    }
}
