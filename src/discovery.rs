// Node Discovery
//
// Finds peers by probing configured seed endpoints at a fixed cadence and
// diffing the returned node sets against what was seen before. Newly seen
// nodes fire found-callbacks (the supervisor registers them); nodes that
// vanish from every successful probe fire lost-callbacks. The probe itself
// is a seam: real deployments answer from a gossip or admin endpoint, tests
// answer from a table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ClusterError, Result};
use crate::node::NodeId;
use crate::worker::{spawn_periodic, WorkerHandle};

/// A well-known endpoint that can enumerate cluster nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedEndpoint {
    pub address: String,
    pub port: u16,
}

/// A node reported by a seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredNode {
    pub id: NodeId,
    pub address: String,
    pub port: u16,
}

/// Discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub discovery_interval: Duration,
    pub probe_timeout: Duration,
    pub seeds: Vec<SeedEndpoint>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(1),
            seeds: Vec::new(),
        }
    }
}

/// Seam toward the actual discovery mechanism.
#[async_trait]
pub trait DiscoveryProbe: Send + Sync {
    async fn probe(&self, seed: &SeedEndpoint) -> Result<Vec<DiscoveredNode>>;
}

/// Invoked for nodes appearing or disappearing from the discovered view.
pub type DiscoveryCallback = Arc<dyn Fn(&DiscoveredNode) + Send + Sync>;

/// Seed-probing node discovery.
pub struct NodeDiscovery {
    config: DiscoveryConfig,
    probe: Arc<dyn DiscoveryProbe>,
    known: RwLock<HashMap<NodeId, DiscoveredNode>>,
    found_callbacks: RwLock<Vec<DiscoveryCallback>>,
    lost_callbacks: RwLock<Vec<DiscoveryCallback>>,
}

impl NodeDiscovery {
    pub fn new(config: DiscoveryConfig, probe: Arc<dyn DiscoveryProbe>) -> Self {
        Self {
            config,
            probe,
            known: RwLock::new(HashMap::new()),
            found_callbacks: RwLock::new(Vec::new()),
            lost_callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn on_node_found(&self, callback: DiscoveryCallback) {
        self.found_callbacks.write().push(callback);
    }

    pub fn on_node_lost(&self, callback: DiscoveryCallback) {
        self.lost_callbacks.write().push(callback);
    }

    /// Nodes currently visible through the seeds.
    pub fn known_nodes(&self) -> Vec<DiscoveredNode> {
        self.known.read().values().cloned().collect()
    }

    /// Manually announce a node, as if a seed had reported it.
    pub fn announce(&self, node: DiscoveredNode) -> Result<()> {
        if !node.id.is_valid() {
            return Err(ClusterError::InvalidArgument(
                "discovered node id must be non-empty".into(),
            ));
        }
        let inserted = self
            .known
            .write()
            .insert(node.id.clone(), node.clone())
            .is_none();
        if inserted {
            self.notify_found(&node);
        }
        Ok(())
    }

    /// Manually retract a node.
    pub fn retract(&self, id: &NodeId) -> Result<()> {
        match self.known.write().remove(id) {
            Some(node) => {
                self.notify_lost(&node);
                Ok(())
            }
            None => Err(ClusterError::NotFound(format!("node {}", id))),
        }
    }

    /// One probe round over every seed. Returns how many nodes appeared.
    pub async fn discovery_round(&self) -> usize {
        let mut reported: HashMap<NodeId, DiscoveredNode> = HashMap::new();
        let mut any_success = false;
        for seed in &self.config.seeds {
            let probe = self.probe.probe(seed);
            match tokio::time::timeout(self.config.probe_timeout, probe).await {
                Ok(Ok(nodes)) => {
                    any_success = true;
                    for node in nodes {
                        if node.id.is_valid() {
                            reported.insert(node.id.clone(), node);
                        }
                    }
                }
                Ok(Err(e)) => {
                    debug!(seed = %seed.address, error = %e, "seed probe failed")
                }
                Err(_) => warn!(seed = %seed.address, "seed probe timed out"),
            }
        }
        if !any_success {
            // Every seed failed; keep the previous view rather than
            // declaring the whole cluster lost.
            return 0;
        }

        let (appeared, vanished) = {
            let mut known = self.known.write();
            let appeared: Vec<DiscoveredNode> = reported
                .values()
                .filter(|n| !known.contains_key(&n.id))
                .cloned()
                .collect();
            let vanished: Vec<DiscoveredNode> = known
                .values()
                .filter(|n| !reported.contains_key(&n.id))
                .cloned()
                .collect();
            *known = reported;
            (appeared, vanished)
        };

        for node in &appeared {
            info!(node = %node.id, "node discovered");
            self.notify_found(node);
        }
        for node in &vanished {
            info!(node = %node.id, "node vanished from discovery");
            self.notify_lost(node);
        }
        appeared.len()
    }

    /// Spawn the discovery worker.
    pub fn start(self: Arc<Self>) -> WorkerHandle {
        let interval = self.config.discovery_interval;
        spawn_periodic("node-discovery", interval, move || {
            let discovery = Arc::clone(&self);
            async move {
                discovery.discovery_round().await;
            }
        })
    }

    fn notify_found(&self, node: &DiscoveredNode) {
        let callbacks = self.found_callbacks.read().clone();
        for callback in callbacks {
            callback(node);
        }
    }

    fn notify_lost(&self, node: &DiscoveredNode) {
        let callbacks = self.lost_callbacks.read().clone();
        for callback in callbacks {
            callback(node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Probe answering from a shared table; seeds can be failed.
    struct TableProbe {
        table: RwLock<Vec<DiscoveredNode>>,
        failing: RwLock<bool>,
    }

    #[async_trait]
    impl DiscoveryProbe for TableProbe {
        async fn probe(&self, _seed: &SeedEndpoint) -> Result<Vec<DiscoveredNode>> {
            if *self.failing.read() {
                return Err(ClusterError::Unavailable("seed down".into()));
            }
            Ok(self.table.read().clone())
        }
    }

    fn node(id: &str) -> DiscoveredNode {
        DiscoveredNode {
            id: NodeId::new(id),
            address: "10.0.0.9".into(),
            port: 7000,
        }
    }

    fn discovery_with(probe: Arc<TableProbe>) -> NodeDiscovery {
        NodeDiscovery::new(
            DiscoveryConfig {
                seeds: vec![SeedEndpoint {
                    address: "seed-0".into(),
                    port: 7000,
                }],
                ..DiscoveryConfig::default()
            },
            probe,
        )
    }

    #[tokio::test]
    async fn test_round_reports_new_and_lost_nodes() {
        let probe = Arc::new(TableProbe {
            table: RwLock::new(vec![node("n1"), node("n2")]),
            failing: RwLock::new(false),
        });
        let discovery = discovery_with(probe.clone());

        let found: Arc<Mutex<Vec<NodeId>>> = Arc::new(Mutex::new(Vec::new()));
        let lost: Arc<Mutex<Vec<NodeId>>> = Arc::new(Mutex::new(Vec::new()));
        let found_sink = found.clone();
        let lost_sink = lost.clone();
        discovery.on_node_found(Arc::new(move |n: &DiscoveredNode| {
            found_sink.lock().push(n.id.clone());
        }));
        discovery.on_node_lost(Arc::new(move |n: &DiscoveredNode| {
            lost_sink.lock().push(n.id.clone());
        }));

        assert_eq!(discovery.discovery_round().await, 2);
        assert_eq!(discovery.known_nodes().len(), 2);

        // n2 disappears, n3 appears.
        *probe.table.write() = vec![node("n1"), node("n3")];
        assert_eq!(discovery.discovery_round().await, 1);

        let mut found = found.lock().clone();
        found.sort();
        assert_eq!(found, vec![NodeId::new("n1"), NodeId::new("n2"), NodeId::new("n3")]);
        assert_eq!(lost.lock().as_slice(), &[NodeId::new("n2")]);
    }

    #[tokio::test]
    async fn test_failed_seeds_keep_previous_view() {
        let probe = Arc::new(TableProbe {
            table: RwLock::new(vec![node("n1")]),
            failing: RwLock::new(false),
        });
        let discovery = discovery_with(probe.clone());
        discovery.discovery_round().await;
        assert_eq!(discovery.known_nodes().len(), 1);

        *probe.failing.write() = true;
        discovery.discovery_round().await;
        // No successful probe: nothing is declared lost.
        assert_eq!(discovery.known_nodes().len(), 1);
    }

    #[tokio::test]
    async fn test_manual_announce_and_retract() {
        let probe = Arc::new(TableProbe {
            table: RwLock::new(Vec::new()),
            failing: RwLock::new(false),
        });
        let discovery = discovery_with(probe);

        discovery.announce(node("manual")).unwrap();
        // Announcing again is a no-op.
        discovery.announce(node("manual")).unwrap();
        assert_eq!(discovery.known_nodes().len(), 1);

        discovery.retract(&NodeId::new("manual")).unwrap();
        assert_eq!(
            discovery.retract(&NodeId::new("manual")).unwrap_err().code(),
            "not_found"
        );
    }

    #[tokio::test]
    async fn test_invalid_announce_rejected() {
        let probe = Arc::new(TableProbe {
            table: RwLock::new(Vec::new()),
            failing: RwLock::new(false),
        });
        let discovery = discovery_with(probe);
        let err = discovery
            .announce(DiscoveredNode {
                id: NodeId::new(""),
                address: "x".into(),
                port: 1,
            })
            .unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
    }
}
