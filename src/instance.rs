//! Deployment-level facade bundling the shared slot table and the run
//! queue, and exposing the runtime-mutation surface the
//! `instance concurrency set <key> <limit>` command maps onto.

use crate::core::config::{RunQueueConfig, StepConcurrencyConfig};
use crate::core::errors::Result;
use crate::queue::RunQueue;
use crate::slots::SlotTable;
use crate::steps::StepConcurrencyController;
use std::sync::Arc;

pub struct Instance {
    slots: Arc<SlotTable>,
    queue: Arc<RunQueue>,
}

impl Instance {
    pub fn new(config: RunQueueConfig) -> Result<Self> {
        let slots = Arc::new(SlotTable::new());
        let queue = Arc::new(RunQueue::new(config, Arc::clone(&slots))?);
        Ok(Self { slots, queue })
    }

    pub fn queue(&self) -> &Arc<RunQueue> {
        &self.queue
    }

    pub fn slots(&self) -> &Arc<SlotTable> {
        &self.slots
    }

    /// Set a named concurrency pool's limit at runtime; no restart
    /// required.
    pub fn set_concurrency_limit(&self, key: &str, limit: usize) {
        self.slots.set_key_limit(key, limit);
    }

    /// Build the step controller for one run, wired to the shared table
    /// for cross-run concurrency keys.
    pub fn step_controller(
        &self,
        run_id: &str,
        config: StepConcurrencyConfig,
    ) -> Result<StepConcurrencyController> {
        StepConcurrencyController::new(run_id, config, Arc::clone(&self.slots))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{RunRequest, CONCURRENCY_KEY_TAG};
    use std::collections::BTreeMap;

    #[test]
    fn test_instance_wires_queue_and_slots() {
        let instance = Instance::new(RunQueueConfig::default()).unwrap();
        instance.queue().enqueue(RunRequest::new("run_1")).unwrap();
        assert!(instance.queue().try_dequeue_next().unwrap().is_some());
    }

    #[test]
    fn test_runtime_concurrency_limit_reaches_step_controllers() {
        let instance = Instance::new(RunQueueConfig::default()).unwrap();
        instance.set_concurrency_limit("database", 1);

        let ctl_a = instance
            .step_controller("run_a", StepConcurrencyConfig::default())
            .unwrap();
        let ctl_b = instance
            .step_controller("run_b", StepConcurrencyConfig::default())
            .unwrap();

        let mut tags = BTreeMap::new();
        tags.insert(CONCURRENCY_KEY_TAG.to_string(), "database".to_string());

        // The pool is shared across runs.
        assert!(ctl_a.try_start_step("query", &tags).unwrap());
        assert!(!ctl_b.try_start_step("query", &tags).unwrap());

        ctl_a.finish_step("query").unwrap();
        let ctl_b = ctl_b.with_claim_blocked_interval(std::time::Duration::ZERO);
        assert!(ctl_b.try_start_step("query", &tags).unwrap());
    }
}
