// Elastic Scaling
//
// Watches per-node resource samples and emits scale-up / scale-down
// decisions at a fixed evaluation cadence. A node shows scale-up pressure
// when any watched metric crosses its threshold; the cluster shows
// scale-down slack only when every node sits at or below 30% of every
// threshold. Decisions are clamped by the policy's min/max node bounds and
// handed to registered callbacks, which manipulate the registry and kick a
// rebalance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ClusterError, Result};
use crate::events::{ClusterEvent, EventBus};
use crate::node::NodeId;
use crate::worker::{spawn_periodic, WorkerHandle};

/// One resource report from a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub node: NodeId,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub disk_pct: f64,
    pub network_pct: f64,
    pub query_rate: u64,
    pub txn_rate: u64,
}

impl ResourceSample {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            cpu_pct: 0.0,
            mem_pct: 0.0,
            disk_pct: 0.0,
            network_pct: 0.0,
            query_rate: 0,
            txn_rate: 0,
        }
    }

    /// Composite load used to pick the highest / lowest loaded node.
    fn load_score(&self) -> f64 {
        (self.cpu_pct + self.mem_pct + self.disk_pct + self.network_pct) / 4.0
    }
}

/// Thresholds that define scale-up pressure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingTrigger {
    pub cpu_threshold: f64,
    pub mem_threshold: f64,
    pub disk_threshold: f64,
    pub query_rate_threshold: u64,
    pub txn_rate_threshold: u64,
}

impl Default for ScalingTrigger {
    fn default() -> Self {
        Self {
            cpu_threshold: 80.0,
            mem_threshold: 80.0,
            disk_threshold: 80.0,
            query_rate_threshold: 1000,
            txn_rate_threshold: 100,
        }
    }
}

impl ScalingTrigger {
    /// Any metric at or above its threshold.
    fn pressure(&self, sample: &ResourceSample) -> bool {
        sample.cpu_pct >= self.cpu_threshold
            || sample.mem_pct >= self.mem_threshold
            || sample.disk_pct >= self.disk_threshold
            || sample.query_rate >= self.query_rate_threshold
            || sample.txn_rate >= self.txn_rate_threshold
    }

    /// Every metric at or below 30% of its threshold.
    fn slack(&self, sample: &ResourceSample) -> bool {
        let fraction = 0.30;
        sample.cpu_pct <= self.cpu_threshold * fraction
            && sample.mem_pct <= self.mem_threshold * fraction
            && sample.disk_pct <= self.disk_threshold * fraction
            && (sample.query_rate as f64) <= self.query_rate_threshold as f64 * fraction
            && (sample.txn_rate as f64) <= self.txn_rate_threshold as f64 * fraction
    }
}

/// Scaling mode; Manual suppresses callback execution but still evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScalingMode {
    #[default]
    Automatic,
    Manual,
}

/// Cluster size bounds that clamp scaling decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingPolicy {
    pub min_nodes: usize,
    pub max_nodes: usize,
    pub mode: ScalingMode,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            min_nodes: 1,
            max_nodes: 64,
            mode: ScalingMode::Automatic,
        }
    }
}

/// Emitted decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    NoAction,
}

#[derive(Debug, Clone)]
pub struct ScalingDecision {
    pub action: ScalingAction,
    pub target: Option<NodeId>,
    pub reason: String,
}

/// Callbacks that carry a decision out: provisioning a node, draining one.
#[async_trait]
pub trait ScalingExecutor: Send + Sync {
    async fn scale_up(&self, target: &NodeId) -> Result<()>;
    async fn scale_down(&self, target: &NodeId) -> Result<()>;
}

/// Provides the current registered node count for policy clamping.
pub type ClusterSizeFn = Arc<dyn Fn() -> usize + Send + Sync>;

/// Scaler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    pub evaluation_interval: Duration,
    pub trigger: ScalingTrigger,
    pub policy: ScalingPolicy,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            evaluation_interval: Duration::from_secs(5),
            trigger: ScalingTrigger::default(),
            policy: ScalingPolicy::default(),
        }
    }
}

/// Watches samples, decides, and delegates execution.
pub struct ElasticScaler {
    config: ScalerConfig,
    samples: RwLock<HashMap<NodeId, ResourceSample>>,
    executor: RwLock<Option<Arc<dyn ScalingExecutor>>>,
    cluster_size: RwLock<Option<ClusterSizeFn>>,
    events: EventBus,
}

impl ElasticScaler {
    pub fn new(config: ScalerConfig, events: EventBus) -> Self {
        Self {
            config,
            samples: RwLock::new(HashMap::new()),
            executor: RwLock::new(None),
            cluster_size: RwLock::new(None),
            events,
        }
    }

    pub fn set_executor(&self, executor: Arc<dyn ScalingExecutor>) {
        *self.executor.write() = Some(executor);
    }

    pub fn set_cluster_size_fn(&self, f: ClusterSizeFn) {
        *self.cluster_size.write() = Some(f);
    }

    /// Ingest a resource sample; the newest sample per node wins.
    pub fn update_sample(&self, sample: ResourceSample) -> Result<()> {
        if !sample.node.is_valid() {
            return Err(ClusterError::InvalidArgument(
                "sample must name a node".into(),
            ));
        }
        self.samples.write().insert(sample.node.clone(), sample);
        Ok(())
    }

    pub fn remove_sample(&self, node: &NodeId) {
        self.samples.write().remove(node);
    }

    pub fn sample(&self, node: &NodeId) -> Option<ResourceSample> {
        self.samples.read().get(node).cloned()
    }

    pub fn samples(&self) -> Vec<ResourceSample> {
        self.samples.read().values().cloned().collect()
    }

    /// Pure decision rule over the current samples.
    pub fn evaluate(&self) -> ScalingDecision {
        let samples = self.samples.read();
        if samples.is_empty() {
            return ScalingDecision {
                action: ScalingAction::NoAction,
                target: None,
                reason: "no samples".into(),
            };
        }

        let trigger = &self.config.trigger;
        let pressured: Vec<&ResourceSample> =
            samples.values().filter(|s| trigger.pressure(s)).collect();

        let cluster_size = self
            .cluster_size
            .read()
            .as_ref()
            .map(|f| f())
            .unwrap_or(samples.len());

        if !pressured.is_empty() {
            // Highest composite load among the pressured nodes; id order
            // breaks exact ties deterministically.
            let target = pressured
                .iter()
                .max_by(|a, b| {
                    a.load_score()
                        .partial_cmp(&b.load_score())
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| b.node.cmp(&a.node))
                })
                .map(|s| s.node.clone());
            if cluster_size >= self.config.policy.max_nodes {
                return ScalingDecision {
                    action: ScalingAction::NoAction,
                    target: None,
                    reason: format!(
                        "pressure on {} node(s) but cluster at max_nodes {}",
                        pressured.len(),
                        self.config.policy.max_nodes
                    ),
                };
            }
            return ScalingDecision {
                action: ScalingAction::ScaleUp,
                target,
                reason: format!("{} node(s) over threshold", pressured.len()),
            };
        }

        if samples.values().all(|s| trigger.slack(s)) {
            if cluster_size <= self.config.policy.min_nodes {
                return ScalingDecision {
                    action: ScalingAction::NoAction,
                    target: None,
                    reason: format!(
                        "cluster-wide slack but already at min_nodes {}",
                        self.config.policy.min_nodes
                    ),
                };
            }
            let target = samples
                .values()
                .min_by(|a, b| {
                    a.load_score()
                        .partial_cmp(&b.load_score())
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.node.cmp(&b.node))
                })
                .map(|s| s.node.clone());
            return ScalingDecision {
                action: ScalingAction::ScaleDown,
                target,
                reason: "every node under 30% of thresholds".into(),
            };
        }

        ScalingDecision {
            action: ScalingAction::NoAction,
            target: None,
            reason: "load within bounds".into(),
        }
    }

    /// One evaluation round: decide, publish, and (in Automatic mode) hand
    /// the decision to the registered executor.
    pub async fn run_once(&self) -> ScalingDecision {
        let decision = self.evaluate();
        if decision.action != ScalingAction::NoAction {
            info!(action = ?decision.action, target = ?decision.target, reason = %decision.reason,
                "scaling decision");
            self.events.publish(ClusterEvent::ScalingDecided {
                action: format!("{:?}", decision.action).to_lowercase(),
                target: decision.target.clone(),
            });
        }

        if self.config.policy.mode != ScalingMode::Automatic {
            return decision;
        }
        let executor = self.executor.read().clone();
        if let (Some(executor), Some(target)) = (executor, decision.target.as_ref()) {
            let outcome = match decision.action {
                ScalingAction::ScaleUp => executor.scale_up(target).await,
                ScalingAction::ScaleDown => executor.scale_down(target).await,
                ScalingAction::NoAction => Ok(()),
            };
            if let Err(e) = outcome {
                warn!(target = %target, error = %e, "scaling execution failed");
            }
        }
        decision
    }

    /// Spawn the evaluation worker.
    pub fn start(self: Arc<Self>) -> WorkerHandle {
        let interval = self.config.evaluation_interval;
        spawn_periodic("elastic-scaler", interval, move || {
            let scaler = Arc::clone(&self);
            async move {
                scaler.run_once().await;
            }
        })
    }
}
