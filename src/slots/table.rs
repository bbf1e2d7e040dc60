use crate::core::errors::{ConductorError, Result};
use crate::slots::scope::{ScopeKey, SlotClaim, SlotLimit};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct SlotTableInner {
    /// Active holder count per bucket.
    counts: HashMap<ScopeKey, usize>,
    /// Buckets reserved per holder, for exactly-once release.
    held: HashMap<String, Vec<ScopeKey>>,
    /// Configured limits for named cross-run concurrency pools. A key
    /// with no entry is limitless and untracked.
    key_limits: HashMap<String, usize>,
}

/// Tracks, per concurrency bucket, how many concurrent holders are
/// permitted and how many are currently active.
///
/// The check-then-reserve of an admission decision is one atomic unit
/// under a single mutex, so two concurrent dequeue attempts can never
/// both take the last slot of a limit of 1. Release is idempotent, keyed
/// on the holder id.
#[derive(Debug, Default)]
pub struct SlotTable {
    inner: Mutex<SlotTableInner>,

    // Statistics
    total_reservations: AtomicU64,
    total_releases: AtomicU64,
    total_denials: AtomicU64,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned lock means a panic mid-update; slot counts are plain
    // integer writes that cannot themselves panic, so the state is still
    // consistent and we keep serving.
    fn lock(&self) -> MutexGuard<'_, SlotTableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Would admitting a candidate with these claims violate any limit?
    /// Read-only; a `true` here is stale the moment the lock drops, so
    /// admission itself must go through [`SlotTable::try_reserve`].
    pub fn can_admit(&self, claims: &[SlotClaim]) -> bool {
        let inner = self.lock();
        Self::admissible(&inner, claims)
    }

    fn admissible(inner: &SlotTableInner, claims: &[SlotClaim]) -> bool {
        claims.iter().all(|claim| {
            let current = inner.counts.get(&claim.scope_key).copied().unwrap_or(0);
            claim.limit.admits(current)
        })
    }

    /// Atomically check every claim and reserve all of them, or none.
    /// Returns `false` when some limit is exhausted. Reserving twice for
    /// the same holder is a caller bug and an error.
    pub fn try_reserve(&self, holder: &str, claims: &[SlotClaim]) -> Result<bool> {
        let mut inner = self.lock();
        if inner.held.contains_key(holder) {
            return Err(ConductorError::slots(
                "reserve",
                format!("holder '{holder}' already holds reserved slots"),
            ));
        }
        if !Self::admissible(&inner, claims) {
            self.total_denials.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        let mut reserved = Vec::with_capacity(claims.len());
        for claim in claims {
            *inner.counts.entry(claim.scope_key.clone()).or_insert(0) += 1;
            reserved.push(claim.scope_key.clone());
        }
        inner.held.insert(holder.to_string(), reserved);
        self.total_reservations.fetch_add(1, Ordering::Relaxed);
        debug!(holder, claims = claims.len(), "reserved slots");
        Ok(true)
    }

    /// Release every slot reserved by `holder`, exactly once. A holder
    /// with nothing reserved (never admitted, or already released) is a
    /// no-op returning `false`.
    pub fn release(&self, holder: &str) -> Result<bool> {
        let mut inner = self.lock();
        let reserved = match inner.held.remove(holder) {
            Some(reserved) => reserved,
            None => return Ok(false),
        };
        for scope_key in &reserved {
            let count = inner.counts.get_mut(scope_key).ok_or_else(|| {
                ConductorError::slots(
                    "release",
                    format!("no count recorded for bucket '{scope_key}'"),
                )
            })?;
            *count = count.checked_sub(1).ok_or_else(|| {
                ConductorError::slots(
                    "release",
                    format!("count for bucket '{scope_key}' would go negative"),
                )
            })?;
        }
        self.total_releases.fetch_add(1, Ordering::Relaxed);
        debug!(holder, released = reserved.len(), "released slots");
        Ok(true)
    }

    /// Set the limit of a named concurrency pool. Takes effect on the
    /// next claim; no restart required.
    pub fn set_key_limit(&self, key: &str, limit: usize) {
        let mut inner = self.lock();
        inner.key_limits.insert(key.to_string(), limit);
        debug!(key, limit, "set concurrency pool limit");
    }

    /// Configured limit of a pool, if any.
    pub fn pool_limit(&self, key: &str) -> Option<usize> {
        self.lock().key_limits.get(key).copied()
    }

    /// Claim one slot of the named pool for `holder`. A pool with no
    /// configured limit is limitless: the claim succeeds and nothing is
    /// tracked, so the matching release is a no-op.
    pub fn try_claim_pool(&self, holder: &str, key: &str) -> Result<bool> {
        let mut inner = self.lock();
        let limit = match inner.key_limits.get(key).copied() {
            Some(limit) => limit,
            None => return Ok(true),
        };
        if inner.held.contains_key(holder) {
            return Err(ConductorError::slots(
                "pool_claim",
                format!("holder '{holder}' already holds a pool slot"),
            ));
        }
        let scope_key = ScopeKey::pool(key);
        let current = inner.counts.get(&scope_key).copied().unwrap_or(0);
        if !SlotLimit::Capped(limit).admits(current) {
            self.total_denials.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        *inner.counts.entry(scope_key.clone()).or_insert(0) += 1;
        inner.held.insert(holder.to_string(), vec![scope_key]);
        self.total_reservations.fetch_add(1, Ordering::Relaxed);
        debug!(holder, key, "claimed pool slot");
        Ok(true)
    }

    /// Current active count for a bucket.
    pub fn usage(&self, scope_key: &ScopeKey) -> usize {
        self.lock().counts.get(scope_key).copied().unwrap_or(0)
    }

    /// Snapshot of every non-zero bucket, for observability.
    pub fn snapshot(&self) -> HashMap<ScopeKey, usize> {
        self.lock()
            .counts
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(key, count)| (key.clone(), *count))
            .collect()
    }

    pub fn total_reservations(&self) -> u64 {
        self.total_reservations.load(Ordering::Relaxed)
    }

    pub fn total_denials(&self) -> u64 {
        self.total_denials.load(Ordering::Relaxed)
    }

    /// Log a warning for any bucket still held. Intended for shutdown
    /// diagnostics.
    pub fn warn_if_held(&self) {
        let inner = self.lock();
        for (holder, reserved) in &inner.held {
            warn!(holder = %holder, buckets = reserved.len(), "slots still held at shutdown");
        }
    }
}
