// Node identity and descriptor types shared across the coordination core.
//
// The registry owns descriptor storage; everything else refers to nodes by
// `NodeId` (value) or `NodeHandle` (arena index + generation), never by a
// shared pointer into the registry.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Node identifier - a unique, non-empty string within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

/// Liveness classification produced by the failure detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeLiveness {
    /// Heartbeats arriving within the timeout.
    Live,
    /// One missed heartbeat window; a second observation promotes to Failed.
    Suspect,
    /// Final classification; the descriptor is removed from the registry.
    Failed,
}

/// Handle into the registry arena.
///
/// Handles stay cheap to copy and detect staleness: when a slot is reused
/// after deregistration its generation is bumped, so a handle issued for the
/// old occupant no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl NodeHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Everything the cluster tracks about a registered node.
#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub address: String,
    pub port: u16,
    pub liveness: NodeLiveness,
    pub last_heartbeat: Instant,
    pub registered_at: Instant,
}

impl NodeDescriptor {
    pub fn new(id: NodeId, address: String, port: u16) -> Self {
        let now = Instant::now();
        Self {
            id,
            address,
            port,
            liveness: NodeLiveness::Live,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    pub fn is_live(&self) -> bool {
        self.liveness == NodeLiveness::Live
    }

    /// Heartbeat age check used by the failure detector.
    pub fn heartbeat_expired(&self, timeout: Duration) -> bool {
        self.last_heartbeat.elapsed() > timeout
    }

    pub fn touch(&mut self) {
        self.last_heartbeat = Instant::now();
        self.liveness = NodeLiveness::Live;
    }
}
