// Cluster configuration surface.
//
// One aggregate `ClusterConfig` gathers the per-component configs; each
// component keeps its own config struct next to its implementation and this
// module only composes them. All durations are plain `std::time::Duration`
// so the whole tree is serde-loadable from JSON without custom adapters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::conflict::ResolutionStrategy;
use crate::consensus::ConsensusConfig;
use crate::discovery::DiscoveryConfig;
use crate::load_balancer::{BalancePolicy, ScoreWeights};
use crate::query::QueryConfig;
use crate::rebalancer::RebalanceConfig;
use crate::registry::RegistryConfig;
use crate::replication::{ReplicationConfig, ReplicationStrategy};
use crate::scaler::ScalerConfig;
use crate::sharding::PlacementStrategy;
use crate::transactions::saga::SagaConfig;
use crate::transactions::two_phase::TwoPhaseConfig;

/// Aggregate configuration for the whole coordination core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub registry: RegistryConfig,
    pub discovery: DiscoveryConfig,
    pub consensus: ConsensusConfig,
    pub replication: ReplicationConfig,
    pub two_phase: TwoPhaseConfig,
    pub saga: SagaConfig,
    pub query: QueryConfig,
    pub scaler: ScalerConfig,
    pub rebalance: RebalanceConfig,
    pub placement_strategy: PlacementStrategy,
    pub conflict_resolution_strategy: ResolutionStrategy,
    pub replication_strategy: ReplicationStrategy,
    pub balance_policy: BalancePolicy,
    pub score_weights: ScoreWeights,
    /// Bound on how long shutdown may spend draining all workers.
    pub shutdown_drain_budget: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            discovery: DiscoveryConfig::default(),
            consensus: ConsensusConfig::default(),
            replication: ReplicationConfig::default(),
            two_phase: TwoPhaseConfig::default(),
            saga: SagaConfig::default(),
            query: QueryConfig::default(),
            scaler: ScalerConfig::default(),
            rebalance: RebalanceConfig::default(),
            placement_strategy: PlacementStrategy::default(),
            conflict_resolution_strategy: ResolutionStrategy::default(),
            replication_strategy: ReplicationStrategy::default(),
            balance_policy: BalancePolicy::default(),
            score_weights: ScoreWeights::default(),
            shutdown_drain_budget: Duration::from_secs(30),
        }
    }
}

impl ClusterConfig {
    /// Load from a JSON document using the documented key names; missing
    /// keys fall back to defaults.
    pub fn from_json(doc: &str) -> crate::error::Result<Self> {
        serde_json::from_str(doc)
            .map_err(|e| crate::error::ClusterError::InvalidArgument(format!("bad config: {}", e)))
    }
}
