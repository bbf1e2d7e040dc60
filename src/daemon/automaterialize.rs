//! Auto-materialize evaluation: decides which assets need recomputation
//! and turns them into queued runs, with per-asset rate limiting and
//! failure cooldowns.

use crate::queue::{RunRequest, AUTO_MATERIALIZE_TAG};
use chrono::{Duration as ChronoDuration, NaiveDateTime};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// Tag carrying the asset an auto-materialize run targets.
pub const ASSET_KEY_TAG: &str = "conductor/asset_key";

/// Cooldown applied after a failed attempt for an asset with no
/// freshness policy to derive a cadence from.
const DEFAULT_FAILURE_COOLDOWN: Duration = Duration::from_secs(3600);

const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Persistent-storage identity of an asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetKey(pub String);

impl AssetKey {
    pub fn new<S: Into<String>>(key: S) -> Self {
        AssetKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Declarative staleness bound: the asset should never lag its upstream
/// data by more than `maximum_lag`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessPolicy {
    pub maximum_lag: Duration,
}

/// One asset in the auto-materialize graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetNode {
    pub key: AssetKey,
    pub deps: Vec<AssetKey>,
    pub freshness: Option<FreshnessPolicy>,
}

impl AssetNode {
    pub fn new<S: Into<String>>(key: S) -> Self {
        Self {
            key: AssetKey::new(key),
            deps: Vec::new(),
            freshness: None,
        }
    }

    pub fn with_dep<S: Into<String>>(mut self, dep: S) -> Self {
        self.deps.push(AssetKey::new(dep));
        self
    }

    pub fn with_freshness(mut self, maximum_lag: Duration) -> Self {
        self.freshness = Some(FreshnessPolicy { maximum_lag });
        self
    }
}

/// The event-log collaborator: what the evaluator needs to know about
/// each asset's materialization state.
pub trait AssetStateView: Send + Sync {
    fn last_materialized_at(&self, key: &AssetKey) -> Option<NaiveDateTime>;
    fn last_upstream_change_at(&self, key: &AssetKey) -> Option<NaiveDateTime>;
    fn is_materializing(&self, key: &AssetKey) -> bool;
    /// Whether the asset's latest materialization already incorporates
    /// its own newest upstream materialization.
    fn has_incorporated_latest_upstream(&self, key: &AssetKey) -> bool;
}

/// Evaluates which assets are due and emits run requests for them.
pub struct AutoMaterializeEvaluator {
    nodes: HashMap<AssetKey, AssetNode>,
    /// Deterministic evaluation order.
    order: Vec<AssetKey>,
    cooldown_until: DashMap<AssetKey, NaiveDateTime>,
    recent_kickoffs: DashMap<AssetKey, Vec<NaiveDateTime>>,
    max_materializations_per_minute: u32,
}

impl AutoMaterializeEvaluator {
    pub fn new(assets: Vec<AssetNode>, max_materializations_per_minute: u32) -> Self {
        let order: Vec<AssetKey> = assets.iter().map(|a| a.key.clone()).collect();
        let nodes = assets.into_iter().map(|a| (a.key.clone(), a)).collect();
        Self {
            nodes,
            order,
            cooldown_until: DashMap::new(),
            recent_kickoffs: DashMap::new(),
            max_materializations_per_minute: max_materializations_per_minute.max(1),
        }
    }

    fn ancestors(&self, key: &AssetKey) -> Vec<AssetKey> {
        let mut seen = HashSet::new();
        let mut stack: Vec<AssetKey> = self
            .nodes
            .get(key)
            .map(|n| n.deps.clone())
            .unwrap_or_default();
        let mut result = Vec::new();
        while let Some(ancestor) = stack.pop() {
            if !seen.insert(ancestor.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&ancestor) {
                stack.extend(node.deps.iter().cloned());
            }
            result.push(ancestor);
        }
        result
    }

    fn is_due(&self, node: &AssetNode, view: &dyn AssetStateView, now: NaiveDateTime) -> bool {
        let materialized = view.last_materialized_at(&node.key);
        let upstream = view.last_upstream_change_at(&node.key);

        let upstream_changed = match (upstream, materialized) {
            (Some(upstream), Some(materialized)) => upstream > materialized,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if upstream_changed {
            return true;
        }

        if let Some(policy) = &node.freshness {
            let max_lag = ChronoDuration::from_std(policy.maximum_lag)
                .unwrap_or_else(|_| ChronoDuration::MAX);
            return match materialized {
                Some(materialized) => now - materialized > max_lag,
                // Never materialized but a freshness bound exists.
                None => true,
            };
        }
        false
    }

    fn rate_limited(&self, key: &AssetKey, now: NaiveDateTime) -> bool {
        let window = ChronoDuration::from_std(RATE_LIMIT_WINDOW).unwrap_or(ChronoDuration::MAX);
        let mut entry = self.recent_kickoffs.entry(key.clone()).or_default();
        entry.retain(|t| now - *t < window);
        entry.len() >= self.max_materializations_per_minute as usize
    }

    /// Evaluate every asset and return run requests for those due.
    ///
    /// An asset is skipped when an active cooldown suppresses it, when
    /// any ancestor is currently being materialized or has not yet
    /// incorporated its own newest upstream materialization, or when the
    /// per-asset rate limit is exhausted.
    pub fn evaluate(&self, view: &dyn AssetStateView, now: NaiveDateTime) -> Vec<RunRequest> {
        let mut requests = Vec::new();
        'assets: for key in &self.order {
            let node = &self.nodes[key];
            if let Some(until) = self.cooldown_until.get(key) {
                if *until > now {
                    debug!(asset = %key, until = %*until, "asset in failure cooldown");
                    continue;
                }
            }
            if !self.is_due(node, view, now) {
                continue;
            }
            for ancestor in self.ancestors(key) {
                if view.is_materializing(&ancestor) {
                    debug!(asset = %key, ancestor = %ancestor, "ancestor in flight, skipping");
                    continue 'assets;
                }
                if !view.has_incorporated_latest_upstream(&ancestor) {
                    debug!(asset = %key, ancestor = %ancestor, "ancestor stale, skipping");
                    continue 'assets;
                }
            }
            if self.rate_limited(key, now) {
                debug!(asset = %key, "rate limit reached, deferring");
                continue;
            }
            self.recent_kickoffs
                .entry(key.clone())
                .or_default()
                .push(now);
            info!(asset = %key, "kicking off auto-materialization");
            requests.push(
                RunRequest::generate()
                    .with_tag(AUTO_MATERIALIZE_TAG, "true")
                    .with_tag(ASSET_KEY_TAG, key.as_str()),
            );
        }
        requests
    }

    /// Record a failed auto-materialize attempt. The asset is not
    /// re-attempted until its next natural scheduling instant: now plus
    /// the freshness lag when a policy exists, a fixed deferral
    /// otherwise. Callers whose run tags configure retries skip this and
    /// let the retry policy take precedence.
    pub fn record_failure(&self, key: &AssetKey, now: NaiveDateTime) {
        let deferral = self
            .nodes
            .get(key)
            .and_then(|n| n.freshness.as_ref())
            .map(|p| p.maximum_lag)
            .unwrap_or(DEFAULT_FAILURE_COOLDOWN);
        let until = now + ChronoDuration::from_std(deferral).unwrap_or(ChronoDuration::MAX);
        info!(asset = %key, until = %until, "auto-materialization failed, cooling down");
        self.cooldown_until.insert(key.clone(), until);
    }

    /// Clear the asset's cooldown after a successful materialization.
    pub fn record_success(&self, key: &AssetKey) {
        if self.cooldown_until.remove(key).is_some() {
            debug!(asset = %key, "cooldown cleared");
        }
    }

    pub fn in_cooldown(&self, key: &AssetKey, now: NaiveDateTime) -> bool {
        self.cooldown_until
            .get(key)
            .map(|until| *until > now)
            .unwrap_or(false)
    }

    /// Look up the asset an emitted run request targets.
    pub fn asset_for_request(request: &RunRequest) -> Option<AssetKey> {
        request.tags.get(ASSET_KEY_TAG).map(AssetKey::new)
    }
}
