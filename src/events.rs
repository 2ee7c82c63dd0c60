// Cluster event bus.
//
// Components publish events instead of calling back into their owners; the
// supervisor (and tests) subscribe. This keeps the component graph acyclic:
// peers are referenced by id, never owned.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::node::{NodeId, NodeLiveness};

/// Events emitted by the coordination components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterEvent {
    NodeRegistered { node: NodeId },
    NodeDeregistered { node: NodeId },
    NodeLivenessChanged { node: NodeId, liveness: NodeLiveness },
    LeaderElected { node: NodeId, term: u64 },
    EntryCommitted { index: u64, term: u64 },
    EntryApplied { index: u64 },
    RegionConnected { region: String },
    RegionDisconnected { region: String },
    ReplicationLagged { region: String, behind: u64 },
    TransactionFinished { txn: String, state: String },
    TransactionStuckPrepared { txn: String },
    RebalanceStarted { moves: usize },
    RebalanceCompleted { success: bool, completed: usize },
    ScalingDecided { action: String, target: Option<NodeId> },
}

/// Broadcast-backed bus; lagging subscribers drop the oldest events rather
/// than stalling publishers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClusterEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Publishing never blocks and never fails; events
    /// published with no live subscriber are discarded.
    pub fn publish(&self, event: ClusterEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
