// Cluster Membership Registry and Failure Detection
//
// The registry is the single owner of node descriptors. Storage is an arena
// of slots; external holders carry `NodeHandle` (index + generation) and a
// bumped generation invalidates handles to a reused slot. Mutations go
// through one writer path under the lock; readers clone consistent
// snapshots and never block writers for long.
//
// Failure detection is heartbeat-driven: a node whose last heartbeat is
// older than the configured timeout is classified Suspect, and a second
// consecutive Suspect observation promotes it to Failed and removes it.
// A monitor worker reclassifies at ~1s cadence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ClusterError, Result};
use crate::events::{ClusterEvent, EventBus};
use crate::node::{NodeDescriptor, NodeHandle, NodeId, NodeLiveness};
use crate::worker::{spawn_periodic, WorkerHandle};

/// Registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// A node is Suspect once `now - last_heartbeat` exceeds this.
    pub heartbeat_timeout: Duration,
    /// Cadence of the liveness monitor.
    pub monitor_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(1),
        }
    }
}

/// Observer callbacks, invoked after a state change and never under the
/// registry lock.
pub trait RegistryObserver: Send + Sync {
    fn on_node_added(&self, node: &NodeDescriptor) {
        let _ = node;
    }
    fn on_node_removed(&self, node: &NodeId) {
        let _ = node;
    }
    fn on_liveness_changed(&self, node: &NodeId, liveness: NodeLiveness) {
        let _ = (node, liveness);
    }
}

enum Slot {
    Occupied {
        descriptor: NodeDescriptor,
        generation: u32,
        /// Consecutive Suspect observations by the monitor.
        suspect_streak: u8,
    },
    Vacant {
        next_generation: u32,
    },
}

struct RegistryInner {
    slots: Vec<Slot>,
    by_id: HashMap<NodeId, u32>,
}

/// Owner of the cluster membership set.
pub struct NodeRegistry {
    config: RegistryConfig,
    inner: RwLock<RegistryInner>,
    observers: RwLock<Vec<Arc<dyn RegistryObserver>>>,
    events: EventBus,
}

impl NodeRegistry {
    pub fn new(config: RegistryConfig, events: EventBus) -> Self {
        Self {
            config,
            inner: RwLock::new(RegistryInner {
                slots: Vec::new(),
                by_id: HashMap::new(),
            }),
            observers: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn RegistryObserver>) {
        self.observers.write().push(observer);
    }

    /// Register a node. Returns a handle whose generation pins the current
    /// occupancy of the slot.
    pub fn register(&self, id: NodeId, address: impl Into<String>, port: u16) -> Result<NodeHandle> {
        if !id.is_valid() {
            return Err(ClusterError::InvalidArgument(
                "node id must be non-empty".into(),
            ));
        }

        let descriptor = NodeDescriptor::new(id.clone(), address.into(), port);
        let handle = {
            let mut inner = self.inner.write();
            if inner.by_id.contains_key(&id) {
                return Err(ClusterError::Duplicate(format!("node {}", id)));
            }

            // Reuse the first vacant slot, else grow the arena.
            let index = inner
                .slots
                .iter()
                .position(|s| matches!(s, Slot::Vacant { .. }))
                .unwrap_or(inner.slots.len());
            let generation = match inner.slots.get(index) {
                Some(Slot::Vacant { next_generation }) => *next_generation,
                _ => 0,
            };

            let slot = Slot::Occupied {
                descriptor: descriptor.clone(),
                generation,
                suspect_streak: 0,
            };
            if index == inner.slots.len() {
                inner.slots.push(slot);
            } else {
                inner.slots[index] = slot;
            }
            inner.by_id.insert(id.clone(), index as u32);
            NodeHandle {
                index: index as u32,
                generation,
            }
        };

        info!(node = %id, "node registered");
        self.events.publish(ClusterEvent::NodeRegistered { node: id });
        let observers = self.observers.read().clone();
        for obs in observers {
            obs.on_node_added(&descriptor);
        }
        Ok(handle)
    }

    /// Deregister a node. Unknown ids leave the registry untouched and
    /// report `not_found`.
    pub fn deregister(&self, id: &NodeId) -> Result<()> {
        let removed = {
            let mut inner = self.inner.write();
            match inner.by_id.remove(id) {
                Some(index) => {
                    Self::vacate(&mut inner.slots, index as usize);
                    true
                }
                None => false,
            }
        };

        if !removed {
            return Err(ClusterError::NotFound(format!("node {}", id)));
        }

        info!(node = %id, "node deregistered");
        self.events
            .publish(ClusterEvent::NodeDeregistered { node: id.clone() });
        let observers = self.observers.read().clone();
        for obs in observers {
            obs.on_node_removed(id);
        }
        Ok(())
    }

    /// Record a heartbeat. Idempotent: repeated heartbeats only refresh the
    /// timestamp and clear any Suspect classification.
    pub fn heartbeat(&self, id: &NodeId) -> Result<()> {
        let recovered = {
            let mut inner = self.inner.write();
            let index = *inner
                .by_id
                .get(id)
                .ok_or_else(|| ClusterError::NotFound(format!("node {}", id)))?
                as usize;
            match &mut inner.slots[index] {
                Slot::Occupied {
                    descriptor,
                    suspect_streak,
                    ..
                } => {
                    let was_suspect = descriptor.liveness == NodeLiveness::Suspect;
                    descriptor.touch();
                    *suspect_streak = 0;
                    was_suspect
                }
                Slot::Vacant { .. } => unreachable!("by_id points at vacant slot"),
            }
        };

        if recovered {
            self.notify_liveness(id, NodeLiveness::Live);
        }
        Ok(())
    }

    /// Resolve a handle; stale generations return None.
    pub fn get(&self, handle: NodeHandle) -> Option<NodeDescriptor> {
        let inner = self.inner.read();
        match inner.slots.get(handle.index as usize) {
            Some(Slot::Occupied {
                descriptor,
                generation,
                ..
            }) if *generation == handle.generation => Some(descriptor.clone()),
            _ => None,
        }
    }

    pub fn get_by_id(&self, id: &NodeId) -> Option<NodeDescriptor> {
        let inner = self.inner.read();
        let index = *inner.by_id.get(id)? as usize;
        match &inner.slots[index] {
            Slot::Occupied { descriptor, .. } => Some(descriptor.clone()),
            Slot::Vacant { .. } => None,
        }
    }

    /// Consistent snapshot of every registered descriptor.
    pub fn snapshot(&self) -> Vec<NodeDescriptor> {
        let inner = self.inner.read();
        inner
            .slots
            .iter()
            .filter_map(|s| match s {
                Slot::Occupied { descriptor, .. } => Some(descriptor.clone()),
                Slot::Vacant { .. } => None,
            })
            .collect()
    }

    pub fn live_nodes(&self) -> Vec<NodeDescriptor> {
        self.snapshot()
            .into_iter()
            .filter(|d| d.is_live())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn live_len(&self) -> usize {
        let inner = self.inner.read();
        inner
            .slots
            .iter()
            .filter(|s| {
                matches!(
                    s,
                    Slot::Occupied { descriptor, .. } if descriptor.is_live()
                )
            })
            .count()
    }

    /// Cluster health: a strict majority of the registered nodes is live.
    pub fn is_healthy(&self) -> bool {
        let inner = self.inner.read();
        let total = inner.by_id.len();
        let live = inner
            .slots
            .iter()
            .filter(|s| {
                matches!(
                    s,
                    Slot::Occupied { descriptor, .. } if descriptor.is_live()
                )
            })
            .count();
        total > 0 && live * 2 > total
    }

    /// One failure-detector pass. Returns the ids removed as Failed.
    /// Called by the monitor worker; exposed for deterministic tests.
    pub fn run_detection_pass(&self) -> Vec<NodeId> {
        let mut suspects = Vec::new();
        let mut failed = Vec::new();
        {
            let mut inner = self.inner.write();
            let timeout = self.config.heartbeat_timeout;
            for slot in inner.slots.iter_mut() {
                if let Slot::Occupied {
                    descriptor,
                    suspect_streak,
                    ..
                } = slot
                {
                    if !descriptor.heartbeat_expired(timeout) {
                        continue;
                    }
                    *suspect_streak = suspect_streak.saturating_add(1);
                    if *suspect_streak >= 2 {
                        descriptor.liveness = NodeLiveness::Failed;
                        failed.push(descriptor.id.clone());
                    } else if descriptor.liveness == NodeLiveness::Live {
                        descriptor.liveness = NodeLiveness::Suspect;
                        suspects.push(descriptor.id.clone());
                    }
                }
            }
            for id in &failed {
                if let Some(index) = inner.by_id.remove(id) {
                    Self::vacate(&mut inner.slots, index as usize);
                }
            }
        }

        for id in &suspects {
            warn!(node = %id, "node suspected, heartbeat overdue");
            self.notify_liveness(id, NodeLiveness::Suspect);
        }
        for id in &failed {
            warn!(node = %id, "node failed, removing from membership");
            self.notify_liveness(id, NodeLiveness::Failed);
            self.events
                .publish(ClusterEvent::NodeDeregistered { node: id.clone() });
            let observers = self.observers.read().clone();
            for obs in observers {
                obs.on_node_removed(id);
            }
        }
        failed
    }

    /// Spawn the liveness monitor worker.
    pub fn start_monitor(self: Arc<Self>) -> WorkerHandle {
        let interval = self.config.monitor_interval;
        spawn_periodic("registry-monitor", interval, move || {
            let registry = Arc::clone(&self);
            async move {
                registry.run_detection_pass();
            }
        })
    }

    fn vacate(slots: &mut [Slot], index: usize) {
        let next = match &slots[index] {
            Slot::Occupied { generation, .. } => Some(generation.wrapping_add(1)),
            Slot::Vacant { .. } => None,
        };
        if let Some(next_generation) = next {
            slots[index] = Slot::Vacant { next_generation };
        }
    }

    fn notify_liveness(&self, id: &NodeId, liveness: NodeLiveness) {
        self.events.publish(ClusterEvent::NodeLivenessChanged {
            node: id.clone(),
            liveness,
        });
        let observers = self.observers.read().clone();
        for obs in observers {
            obs.on_liveness_changed(id, liveness);
        }
    }
}
