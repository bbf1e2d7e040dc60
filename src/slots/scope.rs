use crate::core::config::TagConcurrencyLimit;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Concrete identifier of one concurrency bucket.
///
/// Each constructor writes a distinct namespace prefix, and the key/value
/// form escapes its separator, so no two constructors (or two different
/// inputs to one constructor) can ever render the same bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeKey(String);

impl ScopeKey {
    pub fn global() -> Self {
        ScopeKey("global".to_string())
    }

    /// Bucket shared by every run carrying the tag key, any value.
    pub fn tag_key(key: &str) -> Self {
        ScopeKey(format!("key:{key}"))
    }

    /// Bucket for one exact key/value pair.
    pub fn tag_key_value(key: &str, value: &str) -> Self {
        ScopeKey(format!("kv:{}={}", escape(key), escape(value)))
    }

    /// Bucket for a named cross-run concurrency pool.
    pub fn pool(key: &str) -> Self {
        ScopeKey(format!("pool:{key}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Escape the key/value separator so tag content cannot forge it.
fn escape(part: &str) -> String {
    part.replace('\\', "\\\\").replace('=', "\\=")
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Holder cap for one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotLimit {
    Unlimited,
    Capped(usize),
}

impl SlotLimit {
    pub fn admits(&self, current: usize) -> bool {
        match self {
            SlotLimit::Unlimited => true,
            SlotLimit::Capped(limit) => current < *limit,
        }
    }
}

/// One bucket a candidate must hold a slot in before it may start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotClaim {
    pub scope_key: ScopeKey,
    pub limit: SlotLimit,
}

impl SlotClaim {
    pub fn new(scope_key: ScopeKey, limit: SlotLimit) -> Self {
        Self { scope_key, limit }
    }
}

/// Scope of one configured limit, with one evaluation rule per variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitScope {
    Global,
    /// Applies to any run carrying the key, regardless of value. With
    /// `per_unique_value`, each distinct observed value gets its own
    /// bucket under the one configured limit.
    TagKey { key: String, per_unique_value: bool },
    /// Applies only when the exact key/value pair is present.
    TagKeyValue { key: String, value: String },
}

impl LimitScope {
    pub fn from_limit(limit: &TagConcurrencyLimit) -> Self {
        match &limit.value {
            Some(value) => LimitScope::TagKeyValue {
                key: limit.key.clone(),
                value: value.clone(),
            },
            None => LimitScope::TagKey {
                key: limit.key.clone(),
                per_unique_value: limit.apply_limit_per_unique_value,
            },
        }
    }

    /// The bucket this scope resolves to for the given tags, or `None`
    /// when the scope does not apply to them.
    pub fn evaluate(&self, tags: &BTreeMap<String, String>) -> Option<ScopeKey> {
        match self {
            LimitScope::Global => Some(ScopeKey::global()),
            LimitScope::TagKey {
                key,
                per_unique_value,
            } => {
                let value = tags.get(key)?;
                if *per_unique_value {
                    Some(ScopeKey::tag_key_value(key, value))
                } else {
                    Some(ScopeKey::tag_key(key))
                }
            }
            LimitScope::TagKeyValue { key, value } => {
                if tags.get(key) == Some(value) {
                    Some(ScopeKey::tag_key_value(key, value))
                } else {
                    None
                }
            }
        }
    }
}

/// Derive the claim set for a candidate's tags from the configured tag
/// limits. The global claim is handled by the caller, which knows the
/// `max_concurrent_runs` policy.
pub fn claims_for_tags(
    limits: &[TagConcurrencyLimit],
    tags: &BTreeMap<String, String>,
) -> Vec<SlotClaim> {
    let mut claims = Vec::new();
    for limit in limits {
        let scope = LimitScope::from_limit(limit);
        if let Some(scope_key) = scope.evaluate(tags) {
            claims.push(SlotClaim::new(
                scope_key,
                SlotLimit::Capped(limit.limit.max(0) as usize),
            ));
        }
    }
    claims
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn limit(key: &str, value: Option<&str>, cap: i64, per_unique: bool) -> TagConcurrencyLimit {
        TagConcurrencyLimit {
            key: key.to_string(),
            value: value.map(|v| v.to_string()),
            limit: cap,
            apply_limit_per_unique_value: per_unique,
        }
    }

    #[test]
    fn test_key_only_scope_shares_bucket_across_values() {
        let scope = LimitScope::from_limit(&limit("backfill", None, 10, false));
        let a = scope.evaluate(&tags(&[("backfill", "alpha")])).unwrap();
        let b = scope.evaluate(&tags(&[("backfill", "beta")])).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, ScopeKey::tag_key("backfill"));
    }

    #[test]
    fn test_per_unique_value_scope_splits_buckets() {
        let scope = LimitScope::from_limit(&limit("use-case", None, 3, true));
        let marketing = scope.evaluate(&tags(&[("use-case", "marketing")])).unwrap();
        let sales = scope.evaluate(&tags(&[("use-case", "sales")])).unwrap();
        assert_ne!(marketing, sales);
    }

    #[test]
    fn test_key_value_scope_requires_exact_pair() {
        let scope = LimitScope::from_limit(&limit("database", Some("redshift"), 4, false));
        assert!(scope.evaluate(&tags(&[("database", "redshift")])).is_some());
        assert!(scope.evaluate(&tags(&[("database", "postgres")])).is_none());
        assert!(scope.evaluate(&tags(&[("team", "data")])).is_none());
    }

    #[test]
    fn test_scope_without_matching_tag_does_not_apply() {
        let scope = LimitScope::from_limit(&limit("database", None, 2, false));
        assert!(scope.evaluate(&tags(&[("team", "data")])).is_none());
    }

    #[test]
    fn test_claims_for_tags() {
        let limits = vec![
            limit("database", Some("redshift"), 4, false),
            limit("backfill", None, 10, false),
            limit("use-case", None, 3, true),
        ];
        let claims = claims_for_tags(
            &limits,
            &tags(&[("database", "redshift"), ("use-case", "marketing")]),
        );
        assert_eq!(claims.len(), 2);
        assert_eq!(claims[0].scope_key, ScopeKey::tag_key_value("database", "redshift"));
        assert_eq!(
            claims[1].scope_key,
            ScopeKey::tag_key_value("use-case", "marketing")
        );
        assert_eq!(claims[1].limit, SlotLimit::Capped(3));
    }

    #[test]
    fn test_scope_keys_never_collide_across_namespaces() {
        // Tag content containing the separator must not shift the
        // key/value boundary.
        assert_ne!(
            ScopeKey::tag_key_value("a", "b=c"),
            ScopeKey::tag_key_value("a=b", "c")
        );
        assert_ne!(
            ScopeKey::tag_key_value("a\\", "=b"),
            ScopeKey::tag_key_value("a", "\\=b")
        );
        // Tag keys spelled like another namespace stay in their own.
        assert_ne!(ScopeKey::pool("x=y"), ScopeKey::tag_key_value("pool:x", "y"));
        assert_ne!(ScopeKey::tag_key("pool:x"), ScopeKey::pool("x"));
        assert_ne!(ScopeKey::tag_key("global"), ScopeKey::global());
    }

    #[test]
    fn test_slot_limit_admits() {
        assert!(SlotLimit::Unlimited.admits(usize::MAX - 1));
        assert!(SlotLimit::Capped(2).admits(1));
        assert!(!SlotLimit::Capped(2).admits(2));
        assert!(!SlotLimit::Capped(0).admits(0));
    }
}
