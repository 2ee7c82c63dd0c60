// Data Rebalancing
//
// Generates and executes move plans that even out shard byte-sizes across
// nodes. The rebalancer only orchestrates: the actual copy is delegated to
// a `DataMover` callback, and the shard map is updated atomically after
// each acknowledged move. Moves for the same shard run sequentially;
// independent shards move in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::events::{ClusterEvent, EventBus};
use crate::node::NodeId;
use crate::sharding::{ShardId, ShardMap};

/// Rebalancer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalanceConfig {
    /// Trigger when max |size - mean| / mean exceeds this.
    pub threshold: f64,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self { threshold: 0.20 }
    }
}

/// One data move: relocate a replica of `shard` from `from` to `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMove {
    pub shard: ShardId,
    pub from: NodeId,
    pub to: NodeId,
}

/// Ordered move plan.
#[derive(Debug, Clone, Default)]
pub struct RebalancePlan {
    pub moves: Vec<ShardMove>,
}

impl RebalancePlan {
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }
}

/// Callback that performs the actual data copy and acknowledgment.
#[async_trait]
pub trait DataMover: Send + Sync {
    async fn move_shard(&self, mv: &ShardMove) -> Result<()>;
}

/// Outcome of a plan execution. On failure, `first_failure` is the index of
/// the first move (in plan order) that did not complete; earlier moves are
/// not rolled back.
#[derive(Debug, Clone)]
pub struct RebalanceReport {
    pub total: usize,
    pub completed: usize,
    pub first_failure: Option<usize>,
    pub error: Option<String>,
}

impl RebalanceReport {
    pub fn success(&self) -> bool {
        self.first_failure.is_none()
    }
}

/// Imbalance ratio over a size distribution: max |size - mean| / mean.
pub fn imbalance_ratio(sizes: &[u64]) -> f64 {
    if sizes.is_empty() {
        return 0.0;
    }
    let mean = sizes.iter().sum::<u64>() as f64 / sizes.len() as f64;
    if mean == 0.0 {
        return 0.0;
    }
    sizes
        .iter()
        .map(|s| (*s as f64 - mean).abs())
        .fold(0.0, f64::max)
        / mean
}

/// Plan generator and executor.
pub struct Rebalancer {
    config: RebalanceConfig,
    shard_map: Arc<ShardMap>,
    events: EventBus,
}

impl Rebalancer {
    pub fn new(config: RebalanceConfig, shard_map: Arc<ShardMap>, events: EventBus) -> Self {
        Self {
            config,
            shard_map,
            events,
        }
    }

    /// Whether the current shard size distribution crosses the threshold.
    pub fn needs_rebalance(&self) -> bool {
        let snapshot = self.shard_map.snapshot();
        let sizes: Vec<u64> = snapshot.shards().iter().map(|s| s.size_bytes).collect();
        imbalance_ratio(&sizes) > self.config.threshold
    }

    /// Build a move plan targeting the given candidate nodes. Shards on
    /// overloaded nodes move their primary replica toward the least-loaded
    /// candidate that does not already hold the shard. Deterministic for a
    /// given snapshot and node list.
    pub fn plan(&self, nodes: &[NodeId]) -> RebalancePlan {
        let snapshot = self.shard_map.snapshot();
        if nodes.len() < 2 {
            return RebalancePlan::default();
        }

        let mut load: HashMap<NodeId, u64> =
            nodes.iter().map(|n| (n.clone(), 0u64)).collect();
        for shard in snapshot.shards() {
            if let Some(primary) = shard.replicas.first() {
                *load.entry(primary.clone()).or_insert(0) += shard.size_bytes;
            }
        }
        let mean =
            load.values().sum::<u64>() as f64 / load.len().max(1) as f64;

        let mut shards: Vec<_> = snapshot.shards().to_vec();
        shards.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes).then(a.id.cmp(&b.id)));

        let mut moves = Vec::new();
        for shard in shards {
            let Some(primary) = shard.replicas.first().cloned() else {
                continue;
            };
            let from_load = load.get(&primary).copied().unwrap_or(0);
            let Some((target, target_load)) = load
                .iter()
                .filter(|(n, _)| !shard.replicas.contains(n))
                .min_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(b.0)))
                .map(|(n, l)| (n.clone(), *l))
            else {
                continue;
            };

            // Move only when it actually narrows the spread past the
            // configured tolerance.
            if from_load as f64 - target_load as f64 > mean * self.config.threshold
                && from_load > target_load + shard.size_bytes / 2
            {
                *load.get_mut(&primary).unwrap() -= shard.size_bytes;
                *load.get_mut(&target).unwrap() += shard.size_bytes;
                moves.push(ShardMove {
                    shard: shard.id.clone(),
                    from: primary,
                    to: target,
                });
            }
        }
        RebalancePlan { moves }
    }

    /// Execute a plan. Moves are grouped per shard; a failed move halts the
    /// remaining moves for that shard, and the report carries the index of
    /// the first failure in plan order. Completed moves stay applied.
    pub async fn execute(
        &self,
        plan: RebalancePlan,
        mover: Arc<dyn DataMover>,
    ) -> RebalanceReport {
        let total = plan.moves.len();
        self.events
            .publish(ClusterEvent::RebalanceStarted { moves: total });
        info!(moves = total, "rebalance started");

        // Per-shard sequences, tagged with their plan-order index.
        let mut groups: HashMap<ShardId, Vec<(usize, ShardMove)>> = HashMap::new();
        for (index, mv) in plan.moves.into_iter().enumerate() {
            groups.entry(mv.shard.clone()).or_default().push((index, mv));
        }

        let group_runs = groups.into_values().map(|group| {
            let mover = Arc::clone(&mover);
            let shard_map = Arc::clone(&self.shard_map);
            async move {
                let mut completed = 0usize;
                for (index, mv) in group {
                    match mover.move_shard(&mv).await {
                        Ok(()) => {
                            if let Err(e) = shard_map.reassign_replica(&mv.shard, &mv.from, &mv.to)
                            {
                                warn!(shard = %mv.shard, error = %e, "map update failed after move");
                                return (completed, Some((index, e.to_string())));
                            }
                            completed += 1;
                        }
                        Err(e) => {
                            warn!(shard = %mv.shard, from = %mv.from, to = %mv.to, error = %e,
                                "data move failed, halting shard sequence");
                            return (completed, Some((index, e.to_string())));
                        }
                    }
                }
                (completed, None)
            }
        });

        let outcomes = join_all(group_runs).await;
        let completed = outcomes.iter().map(|(c, _)| c).sum();
        let first_failure = outcomes
            .iter()
            .filter_map(|(_, f)| f.as_ref())
            .min_by_key(|(index, _)| *index)
            .cloned();

        let report = RebalanceReport {
            total,
            completed,
            first_failure: first_failure.as_ref().map(|(index, _)| *index),
            error: first_failure.map(|(_, e)| e),
        };
        self.events.publish(ClusterEvent::RebalanceCompleted {
            success: report.success(),
            completed: report.completed,
        });
        info!(
            completed = report.completed,
            success = report.success(),
            "rebalance finished"
        );
        report
    }
}
