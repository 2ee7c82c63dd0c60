/// Load Balancing
///
/// Policy-driven node selection over a candidate set. The balancer tracks
/// per-node health and load statistics but is deliberately stateless across
/// cluster restarts: it can be rebuilt from the registry at any time.
///
/// Policies:
/// - Round-robin (the only total-order-fair policy)
/// - Uniform random
/// - Least connections
/// - Weighted least score (alpha * cpu% + beta * mem% + gamma * avg response ms)
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

use crate::node::NodeId;

/// Selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BalancePolicy {
    #[default]
    RoundRobin,
    Random,
    LeastConnections,
    WeightedLeastScore,
}

/// Weights for the `WeightedLeastScore` policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub cpu: f64,
    pub mem: f64,
    pub response: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            cpu: 0.5,
            mem: 0.3,
            response: 0.2,
        }
    }
}

/// Per-node statistics fed by the operator / metrics pipeline.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NodeStats {
    pub connections: u32,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub avg_response_ms: f64,
}

impl NodeStats {
    fn score(&self, weights: &ScoreWeights) -> f64 {
        weights.cpu * self.cpu_pct + weights.mem * self.mem_pct
            + weights.response * self.avg_response_ms
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    stats: NodeStats,
    healthy: bool,
}

/// Policy-driven load balancer.
pub struct LoadBalancer {
    policy: RwLock<BalancePolicy>,
    weights: ScoreWeights,
    candidates: RwLock<HashMap<NodeId, Candidate>>,
    rr_cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(policy: BalancePolicy, weights: ScoreWeights) -> Self {
        Self {
            policy: RwLock::new(policy),
            weights,
            candidates: RwLock::new(HashMap::new()),
            rr_cursor: AtomicUsize::new(0),
        }
    }

    pub fn add_candidate(&self, id: NodeId) {
        self.candidates.write().entry(id).or_insert(Candidate {
            stats: NodeStats::default(),
            healthy: true,
        });
    }

    pub fn remove_candidate(&self, id: &NodeId) {
        self.candidates.write().remove(id);
    }

    pub fn update_stats(&self, id: &NodeId, stats: NodeStats) {
        if let Some(candidate) = self.candidates.write().get_mut(id) {
            candidate.stats = stats;
        }
    }

    pub fn mark_health(&self, id: &NodeId, healthy: bool) {
        if let Some(candidate) = self.candidates.write().get_mut(id) {
            candidate.healthy = healthy;
        }
    }

    pub fn is_healthy(&self, id: &NodeId) -> bool {
        self.candidates
            .read()
            .get(id)
            .map(|c| c.healthy)
            .unwrap_or(false)
    }

    pub fn set_policy(&self, policy: BalancePolicy) {
        *self.policy.write() = policy;
    }

    pub fn policy(&self) -> BalancePolicy {
        *self.policy.read()
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.read().len()
    }

    /// Pick one node from `candidates`. Unknown and unhealthy nodes are
    /// filtered out first; the policy is applied to what remains.
    pub fn pick(&self, candidates: &[NodeId]) -> Option<NodeId> {
        let policy = *self.policy.read();
        let known = self.candidates.read();

        let mut eligible: Vec<(&NodeId, &Candidate)> = candidates
            .iter()
            .filter_map(|id| known.get(id).map(|c| (id, c)))
            .filter(|(_, c)| c.healthy)
            .collect();
        if eligible.is_empty() {
            return None;
        }
        // A stable order makes round-robin fair and the score policies
        // deterministic under ties.
        eligible.sort_by(|a, b| a.0.cmp(b.0));

        let chosen = match policy {
            BalancePolicy::RoundRobin => {
                let cursor = self.rr_cursor.fetch_add(1, Ordering::Relaxed);
                eligible[cursor % eligible.len()].0
            }
            BalancePolicy::Random => {
                let ids: Vec<&NodeId> = eligible.iter().map(|(id, _)| *id).collect();
                *ids.choose(&mut rand::rng())?
            }
            BalancePolicy::LeastConnections => {
                eligible
                    .iter()
                    .min_by_key(|(_, c)| c.stats.connections)?
                    .0
            }
            BalancePolicy::WeightedLeastScore => {
                eligible
                    .iter()
                    .min_by(|a, b| {
                        let sa = a.1.stats.score(&self.weights);
                        let sb = b.1.stats.score(&self.weights);
                        sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
                    })?
                    .0
            }
        };
        Some(chosen.clone())
    }
}
