use crate::core::config::RunQueueConfig;
use crate::core::errors::{ConductorError, Result};
use crate::queue::run::{RunRequest, RunStatus};
use crate::slots::{claims_for_tags, ScopeKey, SlotClaim, SlotLimit, SlotTable};
use dashmap::DashMap;
use std::cmp::Reverse;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

struct PendingRun {
    seq: u64,
    request: RunRequest,
}

/// Ordered collection of pending run requests. Admits runs into
/// `Started` only when every applicable concurrency claim is reservable,
/// and is the sole writer of that transition.
pub struct RunQueue {
    config: RunQueueConfig,
    slots: Arc<SlotTable>,
    pending: Mutex<Vec<PendingRun>>,
    statuses: DashMap<String, RunStatus>,
    next_seq: AtomicU64,
}

impl RunQueue {
    pub fn new(config: RunQueueConfig, slots: Arc<SlotTable>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            slots,
            pending: Mutex::new(Vec::new()),
            statuses: DashMap::new(),
            next_seq: AtomicU64::new(0),
        })
    }

    fn pending_lock(&self) -> MutexGuard<'_, Vec<PendingRun>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &RunQueueConfig {
        &self.config
    }

    pub fn slots(&self) -> &Arc<SlotTable> {
        &self.slots
    }

    /// Append a request in FIFO position. Run ids are unique for the
    /// lifetime of the queue.
    pub fn enqueue(&self, request: RunRequest) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.statuses.entry(request.run_id.clone()) {
            Entry::Occupied(_) => {
                return Err(ConductorError::run(&request.run_id, "run id already enqueued"));
            }
            Entry::Vacant(entry) => {
                entry.insert(RunStatus::Queued);
            }
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        debug!(run_id = %request.run_id, seq, priority = request.priority(), "enqueued run");
        self.pending_lock().push(PendingRun { seq, request });
        Ok(())
    }

    /// The claim set admission must reserve for a request: the global
    /// bucket (per the `max_concurrent_runs` policy) plus one claim per
    /// matching tag limit.
    fn claims_for_run(&self, request: &RunRequest) -> Vec<SlotClaim> {
        let global_limit = match self.config.max_concurrent_runs {
            -1 => SlotLimit::Unlimited,
            n => SlotLimit::Capped(n.max(0) as usize),
        };
        let mut claims = vec![SlotClaim::new(ScopeKey::global(), global_limit)];
        claims.extend(claims_for_tags(
            &self.config.tag_concurrency_limits,
            &request.tags,
        ));
        claims
    }

    /// Scan pending requests in priority-then-FIFO order and admit the
    /// first one whose claims can all be reserved. Never blocks; `None`
    /// means nothing is admissible right now. An inadmissible run is
    /// skipped, not a barrier, so a later-arrived admissible run can go
    /// first.
    pub fn try_dequeue_next(&self) -> Result<Option<RunRequest>> {
        let mut pending = self.pending_lock();

        let mut order: Vec<usize> = (0..pending.len()).collect();
        order.sort_by_key(|&i| (Reverse(pending[i].request.priority()), pending[i].seq));

        for index in order {
            let claims = self.claims_for_run(&pending[index].request);
            let run_id = pending[index].request.run_id.clone();
            if self.slots.try_reserve(&run_id, &claims)? {
                let admitted = pending.remove(index).request;
                self.statuses.insert(run_id.clone(), RunStatus::Started);
                info!(run_id = %run_id, attempt = admitted.attempt, "admitted run");
                return Ok(Some(admitted));
            }
        }
        Ok(None)
    }

    /// Cancel a run. Canceling a queued run is pure removal with no slot
    /// interaction; canceling a started run releases its slots before
    /// the status is recorded.
    pub fn cancel(&self, run_id: &str) -> Result<()> {
        // Admission holds the pending lock across reserve and the
        // `Started` transition, so the status must be read under the
        // same lock: a check outside it can observe `Queued` for a run
        // a concurrent dequeue is about to admit, and the queued branch
        // would then cancel without releasing the freshly reserved
        // slots.
        let mut pending = self.pending_lock();
        let status = self
            .status(run_id)
            .ok_or_else(|| ConductorError::run(run_id, "unknown run"))?;
        match status {
            RunStatus::Queued => {
                pending.retain(|p| p.request.run_id != run_id);
                self.statuses.insert(run_id.to_string(), RunStatus::Canceled);
                info!(run_id, "canceled queued run");
                Ok(())
            }
            RunStatus::Started => {
                self.slots.release(run_id)?;
                self.statuses.insert(run_id.to_string(), RunStatus::Canceled);
                info!(run_id, "canceled started run");
                Ok(())
            }
            _ => Err(ConductorError::run(
                run_id,
                format!("cannot cancel run in terminal status {status:?}"),
            )),
        }
    }

    /// Record a started run's terminal outcome and release its slots.
    /// Release is idempotent, so reporting completion after a
    /// cancellation already freed the slots is harmless.
    pub fn record_finished(&self, run_id: &str, status: RunStatus) -> Result<()> {
        if !matches!(status, RunStatus::Success | RunStatus::Failure) {
            return Err(ConductorError::run(
                run_id,
                format!("record_finished requires Success or Failure, got {status:?}"),
            ));
        }
        let current = self
            .status(run_id)
            .ok_or_else(|| ConductorError::run(run_id, "unknown run"))?;
        if current != RunStatus::Started {
            return Err(ConductorError::run(
                run_id,
                format!("cannot finish run in status {current:?}"),
            ));
        }
        self.slots.release(run_id)?;
        self.statuses.insert(run_id.to_string(), status);
        info!(run_id, ?status, "run finished");
        Ok(())
    }

    pub fn status(&self, run_id: &str) -> Option<RunStatus> {
        self.statuses.get(run_id).map(|entry| *entry.value())
    }

    /// Number of runs still waiting for admission. This is the
    /// observable for admission stalls; a stall is expected behavior,
    /// not an error.
    pub fn queue_depth(&self) -> usize {
        self.pending_lock().len()
    }

    pub fn started_count(&self) -> usize {
        self.statuses
            .iter()
            .filter(|entry| *entry.value() == RunStatus::Started)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::TagConcurrencyLimit;

    fn queue_with(config: RunQueueConfig) -> RunQueue {
        RunQueue::new(config, Arc::new(SlotTable::new())).unwrap()
    }

    fn tag_limit(key: &str, value: Option<&str>, limit: i64) -> TagConcurrencyLimit {
        TagConcurrencyLimit {
            key: key.to_string(),
            value: value.map(|v| v.to_string()),
            limit,
            apply_limit_per_unique_value: false,
        }
    }

    #[test]
    fn test_fifo_default_order() {
        let queue = queue_with(RunQueueConfig::default());
        queue.enqueue(RunRequest::new("first")).unwrap();
        queue.enqueue(RunRequest::new("second")).unwrap();

        assert_eq!(queue.try_dequeue_next().unwrap().unwrap().run_id, "first");
        assert_eq!(queue.try_dequeue_next().unwrap().unwrap().run_id, "second");
        assert!(queue.try_dequeue_next().unwrap().is_none());
    }

    #[test]
    fn test_priority_scanned_before_fifo() {
        let queue = queue_with(RunQueueConfig::default());
        queue.enqueue(RunRequest::new("low")).unwrap();
        queue
            .enqueue(RunRequest::new("high").with_priority(10))
            .unwrap();
        queue.enqueue(RunRequest::new("low_2")).unwrap();

        assert_eq!(queue.try_dequeue_next().unwrap().unwrap().run_id, "high");
        assert_eq!(queue.try_dequeue_next().unwrap().unwrap().run_id, "low");
    }

    #[test]
    fn test_duplicate_run_id_rejected() {
        let queue = queue_with(RunQueueConfig::default());
        queue.enqueue(RunRequest::new("run_1")).unwrap();
        assert!(queue.enqueue(RunRequest::new("run_1")).is_err());
    }

    #[test]
    fn test_head_of_line_blocking_avoided() {
        let config = RunQueueConfig {
            max_concurrent_runs: -1,
            tag_concurrency_limits: vec![tag_limit("database", Some("redshift"), 1)],
            ..Default::default()
        };
        let queue = queue_with(config);
        queue
            .enqueue(RunRequest::new("holder").with_tag("database", "redshift"))
            .unwrap();
        queue
            .enqueue(RunRequest::new("blocked").with_tag("database", "redshift"))
            .unwrap();
        queue.enqueue(RunRequest::new("unrelated")).unwrap();

        assert_eq!(queue.try_dequeue_next().unwrap().unwrap().run_id, "holder");
        // "blocked" is skipped; the later-arrived admissible run goes first.
        assert_eq!(queue.try_dequeue_next().unwrap().unwrap().run_id, "unrelated");
        assert!(queue.try_dequeue_next().unwrap().is_none());
        assert_eq!(queue.queue_depth(), 1);
    }

    #[test]
    fn test_global_limit_zero_stalls() {
        let config = RunQueueConfig {
            max_concurrent_runs: 0,
            ..Default::default()
        };
        let queue = queue_with(config);
        for i in 0..5 {
            queue.enqueue(RunRequest::new(format!("run_{i}"))).unwrap();
        }
        assert!(queue.try_dequeue_next().unwrap().is_none());
        assert_eq!(queue.queue_depth(), 5);
    }

    #[test]
    fn test_cancel_queued_is_pure_removal() {
        let queue = queue_with(RunQueueConfig::default());
        queue.enqueue(RunRequest::new("run_1")).unwrap();
        queue.cancel("run_1").unwrap();
        assert_eq!(queue.status("run_1"), Some(RunStatus::Canceled));
        assert_eq!(queue.queue_depth(), 0);
        // Nothing was reserved, so nothing to release.
        assert!(!queue.slots().release("run_1").unwrap());
    }

    #[test]
    fn test_cancel_started_releases_slots() {
        let config = RunQueueConfig {
            max_concurrent_runs: 1,
            ..Default::default()
        };
        let queue = queue_with(config);
        queue.enqueue(RunRequest::new("run_1")).unwrap();
        queue.enqueue(RunRequest::new("run_2")).unwrap();

        assert_eq!(queue.try_dequeue_next().unwrap().unwrap().run_id, "run_1");
        assert!(queue.try_dequeue_next().unwrap().is_none());

        queue.cancel("run_1").unwrap();
        assert_eq!(queue.try_dequeue_next().unwrap().unwrap().run_id, "run_2");
    }

    #[test]
    fn test_finish_transitions_and_releases() {
        let config = RunQueueConfig {
            max_concurrent_runs: 1,
            ..Default::default()
        };
        let queue = queue_with(config);
        queue.enqueue(RunRequest::new("run_1")).unwrap();
        queue.try_dequeue_next().unwrap().unwrap();

        queue.record_finished("run_1", RunStatus::Success).unwrap();
        assert_eq!(queue.status("run_1"), Some(RunStatus::Success));
        assert_eq!(queue.slots().usage(&ScopeKey::global()), 0);
    }

    #[test]
    fn test_finish_requires_started() {
        let queue = queue_with(RunQueueConfig::default());
        queue.enqueue(RunRequest::new("run_1")).unwrap();
        assert!(queue.record_finished("run_1", RunStatus::Success).is_err());
        assert!(queue.record_finished("run_1", RunStatus::Queued).is_err());
        assert!(queue.record_finished("missing", RunStatus::Failure).is_err());
    }

    #[test]
    fn test_priority_extremes_sort_without_overflow() {
        let queue = queue_with(RunQueueConfig::default());
        queue
            .enqueue(RunRequest::new("floor").with_priority(i32::MIN))
            .unwrap();
        queue.enqueue(RunRequest::new("default")).unwrap();
        queue
            .enqueue(RunRequest::new("ceiling").with_priority(i32::MAX))
            .unwrap();

        assert_eq!(queue.try_dequeue_next().unwrap().unwrap().run_id, "ceiling");
        assert_eq!(queue.try_dequeue_next().unwrap().unwrap().run_id, "default");
        assert_eq!(queue.try_dequeue_next().unwrap().unwrap().run_id, "floor");
    }

    #[test]
    fn test_cancel_racing_admission_never_leaks_slots() {
        // Whichever side wins, the run must end Canceled with the global
        // bucket empty; a cancel that lands between admission's reserve
        // and its status write must still release.
        for iteration in 0..200 {
            let queue = Arc::new(queue_with(RunQueueConfig {
                max_concurrent_runs: 1,
                ..Default::default()
            }));
            queue.enqueue(RunRequest::new("run_1")).unwrap();

            let dequeuer = {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || queue.try_dequeue_next().unwrap())
            };
            let canceler = {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || queue.cancel("run_1").unwrap())
            };
            dequeuer.join().unwrap();
            canceler.join().unwrap();

            assert_eq!(queue.status("run_1"), Some(RunStatus::Canceled));
            assert_eq!(
                queue.slots().usage(&ScopeKey::global()),
                0,
                "slot leaked on iteration {iteration}"
            );
        }
    }

    #[test]
    fn test_cancel_terminal_is_error() {
        let queue = queue_with(RunQueueConfig::default());
        queue.enqueue(RunRequest::new("run_1")).unwrap();
        queue.try_dequeue_next().unwrap().unwrap();
        queue.record_finished("run_1", RunStatus::Failure).unwrap();
        assert!(queue.cancel("run_1").is_err());
    }
}
