//! # Conflict Resolution
//!
//! Deterministically reconciles multiple candidate values observed for the
//! same key across regions. Resolution is a pure function of the conflict
//! input: the same candidates produce the same winner on every replica and
//! under any thread schedule. Counters expose how much reconciliation work
//! the cluster is doing and which strategies resolve it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

/// Resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResolutionStrategy {
    /// Greatest timestamp wins; ties break toward the lexicographically
    /// greatest source id.
    #[default]
    LatestTimestamp,
    /// Single-writer register semantics; same rule as LatestTimestamp.
    LwwRegister,
    /// Keep every candidate, serialized deterministically sorted by source.
    MultiValue,
    /// Registered resolver function; falls back to LatestTimestamp on error.
    Custom,
}

impl ResolutionStrategy {
    fn label(&self) -> &'static str {
        match self {
            ResolutionStrategy::LatestTimestamp => "latest_timestamp",
            ResolutionStrategy::LwwRegister => "lww_register",
            ResolutionStrategy::MultiValue => "multi_value",
            ResolutionStrategy::Custom => "custom",
        }
    }
}

/// One candidate value for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: String,
    /// Milliseconds since the epoch, as stamped by the writing region.
    pub timestamp_ms: u64,
    /// Source id (region or node) that produced the value.
    pub source: String,
}

/// A detected conflict: several values proposed for one key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub key: String,
    pub candidates: Vec<VersionedValue>,
}

/// Resolution outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub key: String,
    pub value: String,
    pub strategy: String,
}

/// Registered custom resolver. Must be a pure function of the conflict.
pub type CustomResolver = Arc<dyn Fn(&Conflict) -> Result<String> + Send + Sync>;

/// Observability counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionStats {
    pub total: u64,
    pub by_latest_timestamp: u64,
    pub by_lww_register: u64,
    pub by_multi_value: u64,
    pub by_custom: u64,
    pub unresolved: u64,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    latest: AtomicU64,
    lww: AtomicU64,
    multi: AtomicU64,
    custom: AtomicU64,
    unresolved: AtomicU64,
}

/// Deterministic conflict resolver.
pub struct ConflictResolver {
    strategy: RwLock<ResolutionStrategy>,
    custom: RwLock<Option<CustomResolver>>,
    counters: Counters,
}

impl ConflictResolver {
    pub fn new(strategy: ResolutionStrategy) -> Self {
        Self {
            strategy: RwLock::new(strategy),
            custom: RwLock::new(None),
            counters: Counters::default(),
        }
    }

    pub fn set_strategy(&self, strategy: ResolutionStrategy) {
        *self.strategy.write() = strategy;
    }

    pub fn strategy(&self) -> ResolutionStrategy {
        *self.strategy.read()
    }

    pub fn register_custom(&self, resolver: CustomResolver) {
        *self.custom.write() = Some(resolver);
    }

    /// Resolve one conflict under the active strategy.
    pub fn resolve(&self, conflict: &Conflict) -> Resolution {
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        if conflict.candidates.is_empty() {
            self.counters.unresolved.fetch_add(1, Ordering::Relaxed);
            return Resolution {
                key: conflict.key.clone(),
                value: String::new(),
                strategy: "unresolved".into(),
            };
        }

        let strategy = self.strategy();
        match strategy {
            ResolutionStrategy::LatestTimestamp => {
                self.counters.latest.fetch_add(1, Ordering::Relaxed);
                self.latest_timestamp(conflict, strategy)
            }
            ResolutionStrategy::LwwRegister => {
                self.counters.lww.fetch_add(1, Ordering::Relaxed);
                self.latest_timestamp(conflict, strategy)
            }
            ResolutionStrategy::MultiValue => {
                self.counters.multi.fetch_add(1, Ordering::Relaxed);
                self.multi_value(conflict)
            }
            ResolutionStrategy::Custom => {
                self.counters.custom.fetch_add(1, Ordering::Relaxed);
                self.custom_or_fallback(conflict)
            }
        }
    }

    /// Resolve a batch; order of results matches the input.
    pub fn resolve_all(&self, conflicts: &[Conflict]) -> Vec<Resolution> {
        conflicts.iter().map(|c| self.resolve(c)).collect()
    }

    pub fn stats(&self) -> ResolutionStats {
        ResolutionStats {
            total: self.counters.total.load(Ordering::Relaxed),
            by_latest_timestamp: self.counters.latest.load(Ordering::Relaxed),
            by_lww_register: self.counters.lww.load(Ordering::Relaxed),
            by_multi_value: self.counters.multi.load(Ordering::Relaxed),
            by_custom: self.counters.custom.load(Ordering::Relaxed),
            unresolved: self.counters.unresolved.load(Ordering::Relaxed),
        }
    }

    fn latest_timestamp(&self, conflict: &Conflict, strategy: ResolutionStrategy) -> Resolution {
        let winner = conflict
            .candidates
            .iter()
            .max_by(|a, b| {
                (a.timestamp_ms, a.source.as_str()).cmp(&(b.timestamp_ms, b.source.as_str()))
            })
            .expect("candidates checked nonempty");
        Resolution {
            key: conflict.key.clone(),
            value: winner.value.clone(),
            strategy: strategy.label().to_string(),
        }
    }

    fn multi_value(&self, conflict: &Conflict) -> Resolution {
        let mut candidates = conflict.candidates.clone();
        candidates.sort_by(|a, b| {
            a.source
                .cmp(&b.source)
                .then(a.timestamp_ms.cmp(&b.timestamp_ms))
        });
        let values: Vec<&str> = candidates.iter().map(|c| c.value.as_str()).collect();
        // serde_json keeps the serialization stable for a sorted input.
        let value = serde_json::to_string(&values).unwrap_or_default();
        Resolution {
            key: conflict.key.clone(),
            value,
            strategy: ResolutionStrategy::MultiValue.label().to_string(),
        }
    }

    fn custom_or_fallback(&self, conflict: &Conflict) -> Resolution {
        let custom = self.custom.read().clone();
        match custom {
            Some(resolver) => match resolver(conflict) {
                Ok(value) => Resolution {
                    key: conflict.key.clone(),
                    value,
                    strategy: ResolutionStrategy::Custom.label().to_string(),
                },
                Err(e) => {
                    warn!(key = %conflict.key, error = %e,
                        "custom resolver failed, falling back to latest timestamp");
                    self.counters.unresolved.fetch_add(1, Ordering::Relaxed);
                    self.latest_timestamp(conflict, ResolutionStrategy::LatestTimestamp)
                }
            },
            None => self.latest_timestamp(conflict, ResolutionStrategy::LatestTimestamp),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClusterError;

    fn candidate(value: &str, timestamp_ms: u64, source: &str) -> VersionedValue {
        VersionedValue {
            value: value.to_string(),
            timestamp_ms,
            source: source.to_string(),
        }
    }

    fn conflict(candidates: Vec<VersionedValue>) -> Conflict {
        Conflict {
            key: "k".into(),
            candidates,
        }
    }

    #[test]
    fn test_latest_timestamp_wins() {
        let resolver = ConflictResolver::new(ResolutionStrategy::LatestTimestamp);
        let resolution = resolver.resolve(&conflict(vec![
            candidate("old", 100, "eu"),
            candidate("new", 200, "us"),
        ]));
        assert_eq!(resolution.value, "new");
        assert_eq!(resolution.strategy, "latest_timestamp");
    }

    #[test]
    fn test_timestamp_tie_breaks_by_source() {
        let resolver = ConflictResolver::new(ResolutionStrategy::LatestTimestamp);
        let resolution = resolver.resolve(&conflict(vec![
            candidate("from-ap", 100, "ap"),
            candidate("from-us", 100, "us"),
            candidate("from-eu", 100, "eu"),
        ]));
        // Lexicographically greatest source wins the tie.
        assert_eq!(resolution.value, "from-us");
    }

    #[test]
    fn test_multi_value_is_sorted_by_source() {
        let resolver = ConflictResolver::new(ResolutionStrategy::MultiValue);
        let resolution = resolver.resolve(&conflict(vec![
            candidate("v-us", 300, "us"),
            candidate("v-ap", 100, "ap"),
            candidate("v-eu", 200, "eu"),
        ]));
        assert_eq!(resolution.value, r#"["v-ap","v-eu","v-us"]"#);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let resolver = ConflictResolver::new(ResolutionStrategy::MultiValue);
        let input = conflict(vec![
            candidate("b", 2, "s2"),
            candidate("a", 1, "s1"),
            candidate("c", 3, "s3"),
        ]);
        let first = resolver.resolve(&input);
        for _ in 0..10 {
            assert_eq!(resolver.resolve(&input), first);
        }
    }

    #[test]
    fn test_custom_resolver() {
        let resolver = ConflictResolver::new(ResolutionStrategy::Custom);
        resolver.register_custom(Arc::new(|c: &Conflict| {
            Ok(format!("custom:{}", c.candidates.len()))
        }));
        let resolution = resolver.resolve(&conflict(vec![
            candidate("a", 1, "s1"),
            candidate("b", 2, "s2"),
        ]));
        assert_eq!(resolution.value, "custom:2");
        assert_eq!(resolution.strategy, "custom");
    }

    #[test]
    fn test_failing_custom_falls_back_to_latest() {
        let resolver = ConflictResolver::new(ResolutionStrategy::Custom);
        resolver.register_custom(Arc::new(|_: &Conflict| {
            Err(ClusterError::Internal("resolver bug".into()))
        }));
        let resolution = resolver.resolve(&conflict(vec![
            candidate("old", 1, "s1"),
            candidate("new", 2, "s2"),
        ]));
        assert_eq!(resolution.value, "new");
        assert_eq!(resolution.strategy, "latest_timestamp");
        assert_eq!(resolver.stats().unresolved, 1);
    }

    #[test]
    fn test_empty_conflict_counts_unresolved() {
        let resolver = ConflictResolver::new(ResolutionStrategy::LatestTimestamp);
        let resolution = resolver.resolve(&conflict(vec![]));
        assert_eq!(resolution.value, "");
        let stats = resolver.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.unresolved, 1);
    }

    #[test]
    fn test_counters_accumulate() {
        let resolver = ConflictResolver::new(ResolutionStrategy::LwwRegister);
        resolver.resolve_all(&[
            conflict(vec![candidate("a", 1, "s1")]),
            conflict(vec![candidate("b", 2, "s2")]),
        ]);
        let stats = resolver.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_lww_register, 2);
    }
}
