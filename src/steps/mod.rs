//! Per-run step concurrency control.
//!
//! Each running pipeline gets its own controller gating how many steps
//! execute in parallel, seeded from that run's executor configuration.
//! Steps carrying the reserved concurrency-key tag additionally claim a
//! slot from the shared cross-run [`SlotTable`] pool, the one place step
//! admission crosses into cross-run state.

use crate::core::config::StepConcurrencyConfig;
use crate::core::errors::{ConductorError, Result};
use crate::queue::CONCURRENCY_KEY_TAG;
use crate::slots::{claims_for_tags, ScopeKey, SlotTable};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const DEFAULT_CLAIM_BLOCKED_INTERVAL: Duration = Duration::from_secs(1);

struct ActiveStep {
    local_buckets: Vec<ScopeKey>,
    holds_pool_slot: bool,
}

#[derive(Default)]
struct ControllerInner {
    active: HashMap<String, ActiveStep>,
    local_counts: HashMap<ScopeKey, usize>,
    /// Steps denied admission, in first-denied order.
    pending: Vec<String>,
    /// Last time a step's blocked global pool claim was actually checked.
    last_pool_check: HashMap<String, Instant>,
    failed: bool,
    closed: bool,
}

/// Gates parallel step execution within a single run, subject to the
/// run's `max_concurrent` cap and per-tag limits. A denied step stays
/// pending inside the run; denial is never an error.
pub struct StepConcurrencyController {
    run_id: String,
    config: StepConcurrencyConfig,
    global: Arc<SlotTable>,
    claim_blocked_interval: Duration,
    inner: Mutex<ControllerInner>,
}

impl StepConcurrencyController {
    pub fn new(
        run_id: impl Into<String>,
        config: StepConcurrencyConfig,
        global: Arc<SlotTable>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            run_id: run_id.into(),
            config,
            global,
            claim_blocked_interval: DEFAULT_CLAIM_BLOCKED_INTERVAL,
            inner: Mutex::new(ControllerInner::default()),
        })
    }

    /// Override the minimum interval between re-checks of a blocked
    /// global pool claim.
    pub fn with_claim_blocked_interval(mut self, interval: Duration) -> Self {
        self.claim_blocked_interval = interval;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ControllerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pool_holder(&self, step_key: &str) -> String {
        format!("{}/{}", self.run_id, step_key)
    }

    /// Try to admit a step. Checks, in order: run not failed or closed,
    /// step not already active, the run-wide `max_concurrent` cap, every
    /// matching local tag limit, and finally the global pool when the
    /// step carries the concurrency-key tag. All local state moves under
    /// one lock; the global pool claim uses the shared table's own
    /// atomic reserve.
    pub fn try_start_step(&self, step_key: &str, tags: &BTreeMap<String, String>) -> Result<bool> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ConductorError::run(
                &self.run_id,
                format!("step '{step_key}' submitted after controller close"),
            ));
        }
        if inner.active.contains_key(step_key) {
            return Err(ConductorError::run(
                &self.run_id,
                format!("step '{step_key}' is already active"),
            ));
        }
        if inner.failed {
            debug!(run_id = %self.run_id, step_key, "run failed, not admitting further steps");
            return Ok(false);
        }

        if let Some(max) = self.config.max_concurrent {
            if inner.active.len() >= max {
                Self::mark_pending(&mut inner, step_key);
                return Ok(false);
            }
        }

        let local_claims = claims_for_tags(&self.config.tag_concurrency_limits, tags);
        let locally_admissible = local_claims.iter().all(|claim| {
            let current = inner
                .local_counts
                .get(&claim.scope_key)
                .copied()
                .unwrap_or(0);
            claim.limit.admits(current)
        });
        if !locally_admissible {
            Self::mark_pending(&mut inner, step_key);
            return Ok(false);
        }

        let pool_key = tags.get(CONCURRENCY_KEY_TAG);
        let mut holds_pool_slot = false;
        if let Some(key) = pool_key {
            // Blocked claims are re-checked at most once per interval to
            // keep a stalled step from hammering the shared table.
            if let Some(last) = inner.last_pool_check.get(step_key) {
                if last.elapsed() < self.claim_blocked_interval {
                    Self::mark_pending(&mut inner, step_key);
                    return Ok(false);
                }
            }
            if !self.global.try_claim_pool(&self.pool_holder(step_key), key)? {
                inner
                    .last_pool_check
                    .insert(step_key.to_string(), Instant::now());
                Self::mark_pending(&mut inner, step_key);
                debug!(run_id = %self.run_id, step_key, key = %key, "global pool slot unavailable");
                return Ok(false);
            }
            holds_pool_slot = self.global.pool_limit(key).is_some();
        }

        for claim in &local_claims {
            *inner
                .local_counts
                .entry(claim.scope_key.clone())
                .or_insert(0) += 1;
        }
        inner.active.insert(
            step_key.to_string(),
            ActiveStep {
                local_buckets: local_claims.into_iter().map(|c| c.scope_key).collect(),
                holds_pool_slot,
            },
        );
        inner.pending.retain(|s| s.as_str() != step_key);
        inner.last_pool_check.remove(step_key);
        debug!(run_id = %self.run_id, step_key, "step admitted");
        Ok(true)
    }

    fn mark_pending(inner: &mut ControllerInner, step_key: &str) {
        if !inner.pending.iter().any(|s| s.as_str() == step_key) {
            inner.pending.push(step_key.to_string());
        }
    }

    /// Release a finished step's local slots and, if it held one, its
    /// global pool slot.
    pub fn finish_step(&self, step_key: &str) -> Result<()> {
        let mut inner = self.lock();
        let active = inner.active.remove(step_key).ok_or_else(|| {
            ConductorError::run(&self.run_id, format!("step '{step_key}' is not active"))
        })?;
        for scope_key in &active.local_buckets {
            let count = inner.local_counts.get_mut(scope_key).ok_or_else(|| {
                ConductorError::slots(
                    "finish_step",
                    format!("no local count for bucket '{scope_key}'"),
                )
            })?;
            *count = count.checked_sub(1).ok_or_else(|| {
                ConductorError::slots(
                    "finish_step",
                    format!("local count for bucket '{scope_key}' would go negative"),
                )
            })?;
        }
        if active.holds_pool_slot {
            self.global.release(&self.pool_holder(step_key))?;
        }
        debug!(run_id = %self.run_id, step_key, "step finished");
        Ok(())
    }

    /// Stop admitting further steps for this run. Run-level slots are
    /// untouched; already-active steps run to completion.
    pub fn mark_failed(&self) {
        let mut inner = self.lock();
        if !inner.failed {
            inner.failed = true;
            warn!(run_id = %self.run_id, "run failed, step admission halted");
        }
    }

    pub fn has_pending_claims(&self) -> bool {
        !self.lock().pending.is_empty()
    }

    /// Steps denied admission and not yet admitted, in first-denied order.
    pub fn pending_steps(&self) -> Vec<String> {
        self.lock().pending.clone()
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    /// Release everything this run still holds, local and pool.
    /// Idempotent; called on run completion or abandonment.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Ok(());
        }
        let still_active: Vec<(String, ActiveStep)> = inner.active.drain().collect();
        for (step_key, active) in still_active {
            if active.holds_pool_slot {
                self.global.release(&self.pool_holder(&step_key))?;
            }
        }
        inner.local_counts.clear();
        inner.pending.clear();
        inner.closed = true;
        debug!(run_id = %self.run_id, "step controller closed");
        Ok(())
    }
}
