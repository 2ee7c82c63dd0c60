// Shard Map and Placement
//
// Maps keys to shards and shards to replica sets. Readers work against
// immutable `Arc` snapshots; mutations build a new snapshot and swap it in
// under a short exclusive lock, so key routing never blocks on a rebalance.
//
// Placement strategies:
// - Hash: hash(key) mod shard count. Consistent hashing is intentionally
//   treated as this plain modulo scheme; the strategy seam leaves room for a
//   ring implementation.
// - Range: first-byte buckets, or caller-provided key ranges.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};
use crate::node::NodeId;

/// Shard identifier.
pub type ShardId = String;

/// Placement strategy for key -> shard resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlacementStrategy {
    #[default]
    Hash,
    Range,
}

/// A shard and its replica set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub id: ShardId,
    /// Ordered replica set; first entry is the preferred replica.
    pub replicas: Vec<NodeId>,
    /// Inclusive start / exclusive end of the covered key range, when the
    /// strategy is range-based.
    pub key_range: Option<(String, String)>,
    /// Current byte-size estimate, maintained by the storage layer.
    pub size_bytes: u64,
    pub last_rebalanced: SystemTime,
}

impl ShardAssignment {
    pub fn new(id: ShardId, replicas: Vec<NodeId>) -> Self {
        Self {
            id,
            replicas,
            key_range: None,
            size_bytes: 0,
            last_rebalanced: SystemTime::now(),
        }
    }
}

/// Immutable routing view.
#[derive(Debug, Clone)]
pub struct ShardMapSnapshot {
    strategy: PlacementStrategy,
    shards: Vec<ShardAssignment>,
}

impl ShardMapSnapshot {
    pub fn shards(&self) -> &[ShardAssignment] {
        &self.shards
    }

    pub fn shard(&self, id: &str) -> Option<&ShardAssignment> {
        self.shards.iter().find(|s| s.id == id)
    }

    /// Deterministic key -> shard resolution. Returns None only when the
    /// map holds no shards.
    pub fn shard_for_key(&self, key: &str) -> Option<&ShardAssignment> {
        if self.shards.is_empty() {
            return None;
        }
        let index = match self.strategy {
            PlacementStrategy::Hash => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % self.shards.len() as u64) as usize
            }
            PlacementStrategy::Range => {
                // Caller-provided ranges win; otherwise first-byte buckets.
                if let Some(pos) = self.shards.iter().position(|s| match &s.key_range {
                    Some((start, end)) => key >= start.as_str() && key < end.as_str(),
                    None => false,
                }) {
                    pos
                } else {
                    let first = key.as_bytes().first().copied().unwrap_or(0) as usize;
                    first * self.shards.len() / 256
                }
            }
        };
        self.shards.get(index)
    }

    pub fn nodes_for_shard(&self, id: &str) -> Vec<NodeId> {
        self.shard(id)
            .map(|s| s.replicas.clone())
            .unwrap_or_default()
    }
}

/// Copy-on-write shard map.
pub struct ShardMap {
    snapshot: RwLock<Arc<ShardMapSnapshot>>,
}

impl ShardMap {
    pub fn new(strategy: PlacementStrategy) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(ShardMapSnapshot {
                strategy,
                shards: Vec::new(),
            })),
        }
    }

    /// Current immutable view; cheap to take and hold.
    pub fn snapshot(&self) -> Arc<ShardMapSnapshot> {
        self.snapshot.read().clone()
    }

    /// Create `shard_count` shards, assigning `replication_factor` replicas
    /// round-robin over `nodes`. Replaces any existing layout.
    pub fn create_shards(
        &self,
        nodes: &[NodeId],
        shard_count: usize,
        replication_factor: usize,
    ) -> Result<()> {
        if nodes.is_empty() {
            return Err(ClusterError::Unavailable(
                "no live nodes available for shard placement".into(),
            ));
        }
        if shard_count == 0 || replication_factor == 0 {
            return Err(ClusterError::InvalidArgument(
                "shard count and replication factor must be positive".into(),
            ));
        }

        let factor = replication_factor.min(nodes.len());
        let strategy = self.snapshot.read().strategy;
        let shards = (0..shard_count)
            .map(|i| {
                let replicas = (0..factor)
                    .map(|r| nodes[(i + r) % nodes.len()].clone())
                    .collect();
                ShardAssignment::new(format!("shard-{}", i), replicas)
            })
            .collect();

        self.swap(ShardMapSnapshot { strategy, shards });
        Ok(())
    }

    /// Install explicit key ranges for range placement. Each entry is
    /// (shard id, replica set, inclusive start, exclusive end).
    pub fn install_ranges(
        &self,
        ranges: Vec<(ShardId, Vec<NodeId>, String, String)>,
    ) -> Result<()> {
        if ranges.iter().any(|(_, replicas, _, _)| replicas.is_empty()) {
            return Err(ClusterError::InvalidArgument(
                "every shard needs a nonempty replica set".into(),
            ));
        }
        let shards = ranges
            .into_iter()
            .map(|(id, replicas, start, end)| {
                let mut assignment = ShardAssignment::new(id, replicas);
                assignment.key_range = Some((start, end));
                assignment
            })
            .collect();
        self.swap(ShardMapSnapshot {
            strategy: PlacementStrategy::Range,
            shards,
        });
        Ok(())
    }

    pub fn shard_count(&self) -> usize {
        self.snapshot.read().shards.len()
    }

    /// Move one replica of a shard from one node to another; used by the
    /// rebalancer after a successful data move.
    pub fn reassign_replica(&self, shard: &str, from: &NodeId, to: &NodeId) -> Result<()> {
        let current = self.snapshot();
        let mut shards = current.shards.clone();
        let assignment = shards
            .iter_mut()
            .find(|s| s.id == shard)
            .ok_or_else(|| ClusterError::NotFound(format!("shard {}", shard)))?;
        let position = assignment
            .replicas
            .iter()
            .position(|n| n == from)
            .ok_or_else(|| {
                ClusterError::NotFound(format!("node {} is not a replica of {}", from, shard))
            })?;
        if assignment.replicas.contains(to) {
            return Err(ClusterError::Duplicate(format!(
                "node {} already replicates {}",
                to, shard
            )));
        }
        assignment.replicas[position] = to.clone();
        assignment.last_rebalanced = SystemTime::now();

        self.swap(ShardMapSnapshot {
            strategy: current.strategy,
            shards,
        });
        Ok(())
    }

    pub fn add_replica(&self, shard: &str, node: &NodeId) -> Result<()> {
        let current = self.snapshot();
        let mut shards = current.shards.clone();
        let assignment = shards
            .iter_mut()
            .find(|s| s.id == shard)
            .ok_or_else(|| ClusterError::NotFound(format!("shard {}", shard)))?;
        if assignment.replicas.contains(node) {
            return Err(ClusterError::Duplicate(format!(
                "node {} already replicates {}",
                node, shard
            )));
        }
        assignment.replicas.push(node.clone());
        self.swap(ShardMapSnapshot {
            strategy: current.strategy,
            shards,
        });
        Ok(())
    }

    /// Remove a replica. The last replica of a live shard cannot be removed;
    /// that would leave keys mapped to an empty replica set.
    pub fn remove_replica(&self, shard: &str, node: &NodeId) -> Result<()> {
        let current = self.snapshot();
        let mut shards = current.shards.clone();
        let assignment = shards
            .iter_mut()
            .find(|s| s.id == shard)
            .ok_or_else(|| ClusterError::NotFound(format!("shard {}", shard)))?;
        if !assignment.replicas.contains(node) {
            return Err(ClusterError::NotFound(format!(
                "node {} is not a replica of {}",
                node, shard
            )));
        }
        if assignment.replicas.len() == 1 {
            return Err(ClusterError::WrongState(format!(
                "shard {} would be left with no replicas",
                shard
            )));
        }
        assignment.replicas.retain(|n| n != node);
        self.swap(ShardMapSnapshot {
            strategy: current.strategy,
            shards,
        });
        Ok(())
    }

    /// Update the byte-size estimate for a shard.
    pub fn update_shard_size(&self, shard: &str, size_bytes: u64) -> Result<()> {
        let current = self.snapshot();
        let mut shards = current.shards.clone();
        let assignment = shards
            .iter_mut()
            .find(|s| s.id == shard)
            .ok_or_else(|| ClusterError::NotFound(format!("shard {}", shard)))?;
        assignment.size_bytes = size_bytes;
        self.swap(ShardMapSnapshot {
            strategy: current.strategy,
            shards,
        });
        Ok(())
    }

    fn swap(&self, next: ShardMapSnapshot) {
        *self.snapshot.write() = Arc::new(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::new(*n)).collect()
    }

    #[test]
    fn test_create_shards_requires_nodes() {
        let map = ShardMap::new(PlacementStrategy::Hash);
        let err = map.create_shards(&[], 4, 2).unwrap_err();
        assert_eq!(err.code(), "unavailable");
    }

    #[test]
    fn test_key_maps_to_exactly_one_shard() {
        let map = ShardMap::new(PlacementStrategy::Hash);
        map.create_shards(&nodes(&["n1", "n2", "n3"]), 4, 2).unwrap();
        let snapshot = map.snapshot();
        for key in ["user:1", "user:2", "order:17", "", "zzz"] {
            let first = snapshot.shard_for_key(key).unwrap().id.clone();
            let second = snapshot.shard_for_key(key).unwrap().id.clone();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_no_shard_has_empty_replica_set() {
        let map = ShardMap::new(PlacementStrategy::Hash);
        map.create_shards(&nodes(&["n1", "n2"]), 8, 3).unwrap();
        for shard in map.snapshot().shards() {
            assert!(!shard.replicas.is_empty());
            // Replication factor is clamped to the node count.
            assert_eq!(shard.replicas.len(), 2);
        }
    }

    #[test]
    fn test_range_strategy_orders_keys() {
        let map = ShardMap::new(PlacementStrategy::Range);
        map.create_shards(&nodes(&["n1", "n2"]), 8, 1).unwrap();
        let snapshot = map.snapshot();
        // A low first byte routes to an earlier shard than a high one.
        let low = snapshot.shard_for_key("Alpha").unwrap().id.clone();
        let high = snapshot.shard_for_key("zulu").unwrap().id.clone();
        assert!(low < high);
    }

    #[test]
    fn test_explicit_ranges_take_precedence() {
        let map = ShardMap::new(PlacementStrategy::Range);
        map.install_ranges(vec![
            ("users-a-m".into(), nodes(&["n1"]), "a".into(), "n".into()),
            ("users-n-z".into(), nodes(&["n2"]), "n".into(), "{".into()),
        ])
        .unwrap();
        let snapshot = map.snapshot();
        assert_eq!(snapshot.shard_for_key("alice").unwrap().id, "users-a-m");
        assert_eq!(snapshot.shard_for_key("nadia").unwrap().id, "users-n-z");
        assert_eq!(snapshot.shard_for_key("zed").unwrap().id, "users-n-z");
    }

    #[test]
    fn test_reassign_replica() {
        let map = ShardMap::new(PlacementStrategy::Hash);
        map.create_shards(&nodes(&["n1", "n2", "n3"]), 1, 1).unwrap();
        let shard = map.snapshot().shards()[0].clone();
        let from = shard.replicas[0].clone();

        map.reassign_replica(&shard.id, &from, &NodeId::new("n9"))
            .unwrap();
        let replicas = map.snapshot().nodes_for_shard(&shard.id);
        assert!(replicas.contains(&NodeId::new("n9")));
        assert!(!replicas.contains(&from));
    }

    #[test]
    fn test_cannot_remove_last_replica() {
        let map = ShardMap::new(PlacementStrategy::Hash);
        map.create_shards(&nodes(&["n1"]), 1, 1).unwrap();
        let shard = map.snapshot().shards()[0].clone();
        let err = map
            .remove_replica(&shard.id, &shard.replicas[0])
            .unwrap_err();
        assert_eq!(err.code(), "wrong_state");
    }

    #[test]
    fn test_snapshot_isolated_from_mutation() {
        let map = ShardMap::new(PlacementStrategy::Hash);
        map.create_shards(&nodes(&["n1", "n2"]), 2, 1).unwrap();
        let before = map.snapshot();
        map.update_shard_size("shard-0", 4096).unwrap();
        // The old snapshot still reads the old size.
        assert_eq!(before.shard("shard-0").unwrap().size_bytes, 0);
        assert_eq!(map.snapshot().shard("shard-0").unwrap().size_bytes, 4096);
    }
}
