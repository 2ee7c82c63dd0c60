// Cross-Region Replication
//
// Pushes committed writes out to peer regions on top of the replicated log.
// Three acknowledgment strategies:
// - Synchronous: every connected region must ack before the caller does
// - Asynchronous: ack immediately, deliver with bounded background retries
// - Semi-synchronous: the primary peer region acks, the rest fan out async
//
// A heartbeat worker probes every region at a fixed cadence; a region is
// "connected" only while its last successful heartbeat is younger than the
// connection-loss threshold.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ClusterError, Result};
use crate::events::{ClusterEvent, EventBus};
use crate::worker::{spawn_periodic, WorkerHandle};

/// Region identifier.
pub type RegionId = String;

/// Acknowledgment strategy for outbound replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReplicationStrategy {
    Synchronous,
    #[default]
    Asynchronous,
    SemiSynchronous,
}

/// A peer region. At most one region is primary at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDescriptor {
    pub id: RegionId,
    pub address: String,
    pub port: u16,
    pub is_primary: bool,
}

/// Live per-region replication state.
#[derive(Debug, Clone)]
pub struct ReplicationStatus {
    pub region: RegionId,
    pub connected: bool,
    pub last_replicated_index: u64,
    pub last_heartbeat: Option<Instant>,
    pub error: Option<String>,
}

impl ReplicationStatus {
    fn new(region: RegionId) -> Self {
        Self {
            region,
            connected: false,
            last_replicated_index: 0,
            last_heartbeat: None,
            error: None,
        }
    }
}

/// Replicator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub heartbeat_interval: Duration,
    /// A region whose last successful heartbeat is older than this is
    /// considered disconnected.
    pub connection_loss_threshold: Duration,
    pub rpc_timeout: Duration,
    /// Attempts per write for the asynchronous paths.
    pub retry_limit: u32,
    pub retry_backoff: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            connection_loss_threshold: Duration::from_secs(3),
            rpc_timeout: Duration::from_secs(2),
            retry_limit: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

/// Transport seam toward peer regions.
#[async_trait]
pub trait RegionTransport: Send + Sync {
    async fn replicate(
        &self,
        region: &RegionDescriptor,
        key: &str,
        value: &[u8],
        index: u64,
    ) -> Result<()>;
    async fn heartbeat(&self, region: &RegionDescriptor) -> Result<()>;
}

/// Pushes committed writes to peer regions.
pub struct RegionReplicator {
    config: ReplicationConfig,
    strategy: RwLock<ReplicationStrategy>,
    regions: RwLock<HashMap<RegionId, RegionDescriptor>>,
    status: RwLock<HashMap<RegionId, ReplicationStatus>>,
    transport: Arc<dyn RegionTransport>,
    events: EventBus,
    weak_self: Weak<RegionReplicator>,
}

impl RegionReplicator {
    pub fn new(
        config: ReplicationConfig,
        strategy: ReplicationStrategy,
        transport: Arc<dyn RegionTransport>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            strategy: RwLock::new(strategy),
            regions: RwLock::new(HashMap::new()),
            status: RwLock::new(HashMap::new()),
            transport,
            events,
            weak_self: weak.clone(),
        })
    }

    pub fn add_region(&self, region: RegionDescriptor) -> Result<()> {
        let mut regions = self.regions.write();
        if regions.contains_key(&region.id) {
            return Err(ClusterError::Duplicate(format!("region {}", region.id)));
        }
        if region.is_primary {
            for existing in regions.values_mut() {
                existing.is_primary = false;
            }
        }
        self.status
            .write()
            .insert(region.id.clone(), ReplicationStatus::new(region.id.clone()));
        info!(region = %region.id, primary = region.is_primary, "region added");
        regions.insert(region.id.clone(), region);
        Ok(())
    }

    pub fn remove_region(&self, id: &str) -> Result<()> {
        let removed = self.regions.write().remove(id);
        self.status.write().remove(id);
        match removed {
            Some(_) => Ok(()),
            None => Err(ClusterError::NotFound(format!("region {}", id))),
        }
    }

    pub fn set_primary(&self, id: &str) -> Result<()> {
        let mut regions = self.regions.write();
        if !regions.contains_key(id) {
            return Err(ClusterError::NotFound(format!("region {}", id)));
        }
        for (region_id, region) in regions.iter_mut() {
            region.is_primary = region_id == id;
        }
        Ok(())
    }

    pub fn primary(&self) -> Option<RegionDescriptor> {
        self.regions.read().values().find(|r| r.is_primary).cloned()
    }

    pub fn regions(&self) -> Vec<RegionDescriptor> {
        self.regions.read().values().cloned().collect()
    }

    pub fn region_status(&self) -> Vec<ReplicationStatus> {
        self.status.read().values().cloned().collect()
    }

    pub fn all_regions_connected(&self) -> bool {
        let status = self.status.read();
        !status.is_empty() && status.values().all(|s| s.connected)
    }

    pub fn set_strategy(&self, strategy: ReplicationStrategy) {
        *self.strategy.write() = strategy;
    }

    pub fn strategy(&self) -> ReplicationStrategy {
        *self.strategy.read()
    }

    /// Forward a committed write to peer regions under the active strategy.
    pub async fn replicate_write(&self, key: &str, value: &[u8], index: u64) -> Result<()> {
        let strategy = self.strategy();
        let targets: Vec<RegionDescriptor> = self.regions.read().values().cloned().collect();
        if targets.is_empty() {
            return Ok(());
        }

        match strategy {
            ReplicationStrategy::Synchronous => {
                // Every registered region must ack; the first failure fails
                // the write and is recorded against that region.
                for region in &targets {
                    self.send_once(region, key, value, index).await?;
                }
                Ok(())
            }
            ReplicationStrategy::Asynchronous => {
                for region in targets {
                    self.spawn_retrying_send(region, key.to_string(), value.to_vec(), index);
                }
                Ok(())
            }
            ReplicationStrategy::SemiSynchronous => {
                let primary = targets.iter().find(|r| r.is_primary).cloned();
                for region in targets {
                    if !region.is_primary {
                        self.spawn_retrying_send(region, key.to_string(), value.to_vec(), index);
                    }
                }
                match primary {
                    Some(region) => self.send_once(&region, key, value, index).await,
                    None => Err(ClusterError::Unavailable(
                        "no primary region configured for semi-synchronous ack".into(),
                    )),
                }
            }
        }
    }

    async fn send_once(
        &self,
        region: &RegionDescriptor,
        key: &str,
        value: &[u8],
        index: u64,
    ) -> Result<()> {
        let send = self.transport.replicate(region, key, value, index);
        let outcome = match tokio::time::timeout(self.config.rpc_timeout, send).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClusterError::Timeout(format!(
                "replication to {} exceeded {:?}",
                region.id, self.config.rpc_timeout
            ))),
        };
        match &outcome {
            Ok(()) => self.record_replicated(&region.id, index),
            Err(e) => self.record_error(&region.id, e),
        }
        outcome
    }

    fn spawn_retrying_send(&self, region: RegionDescriptor, key: String, value: Vec<u8>, index: u64) {
        let Some(replicator) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let mut attempt = 0;
            loop {
                attempt += 1;
                if replicator.send_once(&region, &key, &value, index).await.is_ok() {
                    return;
                }
                if attempt >= replicator.config.retry_limit {
                    warn!(region = %region.id, key = %key, attempts = attempt,
                        "background replication gave up");
                    return;
                }
                tokio::time::sleep(replicator.config.retry_backoff).await;
            }
        });
    }

    /// One heartbeat round across every region.
    pub async fn heartbeat_round(&self) {
        let targets: Vec<RegionDescriptor> = self.regions.read().values().cloned().collect();
        for region in targets {
            let probe = self.transport.heartbeat(&region);
            let ok = matches!(
                tokio::time::timeout(self.config.rpc_timeout, probe).await,
                Ok(Ok(()))
            );
            self.record_heartbeat(&region.id, ok);
        }
    }

    /// Spawn the heartbeat worker.
    pub fn start_heartbeats(self: Arc<Self>) -> WorkerHandle {
        let interval = self.config.heartbeat_interval;
        spawn_periodic("region-heartbeat", interval, move || {
            let replicator = Arc::clone(&self);
            async move {
                replicator.heartbeat_round().await;
            }
        })
    }

    fn record_replicated(&self, region: &str, index: u64) {
        let mut status = self.status.write();
        if let Some(s) = status.get_mut(region) {
            if index > s.last_replicated_index {
                s.last_replicated_index = index;
            }
            s.error = None;
        }
    }

    fn record_error(&self, region: &str, error: &ClusterError) {
        let mut status = self.status.write();
        if let Some(s) = status.get_mut(region) {
            s.error = Some(error.to_string());
        }
    }

    fn record_heartbeat(&self, region: &str, ok: bool) {
        let transition = {
            let mut status = self.status.write();
            let Some(s) = status.get_mut(region) else {
                return;
            };
            let was_connected = s.connected;
            if ok {
                s.last_heartbeat = Some(Instant::now());
                s.connected = true;
                s.error = None;
            } else {
                let lost = match s.last_heartbeat {
                    Some(at) => at.elapsed() > self.config.connection_loss_threshold,
                    None => true,
                };
                if lost {
                    s.connected = false;
                }
            }
            match (was_connected, s.connected) {
                (false, true) => Some(true),
                (true, false) => Some(false),
                _ => None,
            }
        };

        match transition {
            Some(true) => {
                debug!(region, "region connected");
                self.events.publish(ClusterEvent::RegionConnected {
                    region: region.to_string(),
                });
            }
            Some(false) => {
                warn!(region, "region disconnected");
                self.events.publish(ClusterEvent::RegionDisconnected {
                    region: region.to_string(),
                });
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// Transport that records deliveries and fails configured regions.
    struct FakeTransport {
        delivered: Mutex<Vec<(RegionId, String, u64)>>,
        failing: RwLock<HashSet<RegionId>>,
    }

    impl FakeTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: Mutex::new(Vec::new()),
                failing: RwLock::new(HashSet::new()),
            })
        }

        fn fail_region(&self, id: &str) {
            self.failing.write().insert(id.to_string());
        }
    }

    #[async_trait]
    impl RegionTransport for FakeTransport {
        async fn replicate(
            &self,
            region: &RegionDescriptor,
            key: &str,
            _value: &[u8],
            index: u64,
        ) -> Result<()> {
            if self.failing.read().contains(&region.id) {
                return Err(ClusterError::Unavailable(format!("region {}", region.id)));
            }
            self.delivered
                .lock()
                .push((region.id.clone(), key.to_string(), index));
            Ok(())
        }

        async fn heartbeat(&self, region: &RegionDescriptor) -> Result<()> {
            if self.failing.read().contains(&region.id) {
                return Err(ClusterError::Unavailable(format!("region {}", region.id)));
            }
            Ok(())
        }
    }

    fn region(id: &str, primary: bool) -> RegionDescriptor {
        RegionDescriptor {
            id: id.to_string(),
            address: "10.0.0.1".into(),
            port: 7400,
            is_primary: primary,
        }
    }

    fn replicator(
        strategy: ReplicationStrategy,
        transport: Arc<FakeTransport>,
    ) -> Arc<RegionReplicator> {
        RegionReplicator::new(
            ReplicationConfig {
                retry_backoff: Duration::from_millis(5),
                ..ReplicationConfig::default()
            },
            strategy,
            transport,
            EventBus::default(),
        )
    }

    #[test]
    fn test_single_primary_invariant() {
        let transport = FakeTransport::new();
        let repl = replicator(ReplicationStrategy::Asynchronous, transport);
        repl.add_region(region("eu", true)).unwrap();
        repl.add_region(region("us", true)).unwrap();

        let primaries: Vec<_> = repl.regions().into_iter().filter(|r| r.is_primary).collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].id, "us");

        repl.set_primary("eu").unwrap();
        assert_eq!(repl.primary().unwrap().id, "eu");
    }

    #[test]
    fn test_duplicate_and_unknown_regions() {
        let transport = FakeTransport::new();
        let repl = replicator(ReplicationStrategy::Asynchronous, transport);
        repl.add_region(region("eu", false)).unwrap();
        assert_eq!(
            repl.add_region(region("eu", false)).unwrap_err().code(),
            "duplicate"
        );
        assert_eq!(repl.remove_region("mars").unwrap_err().code(), "not_found");
        assert_eq!(repl.set_primary("mars").unwrap_err().code(), "not_found");
    }

    #[tokio::test]
    async fn test_synchronous_waits_for_all_regions() {
        let transport = FakeTransport::new();
        let repl = replicator(ReplicationStrategy::Synchronous, transport.clone());
        repl.add_region(region("eu", true)).unwrap();
        repl.add_region(region("ap", false)).unwrap();

        repl.replicate_write("k", b"v", 7).await.unwrap();
        let delivered = transport.delivered.lock();
        assert_eq!(delivered.len(), 2);
        assert!(delivered.iter().all(|(_, key, index)| key == "k" && *index == 7));
    }

    #[tokio::test]
    async fn test_synchronous_surfaces_region_failure() {
        let transport = FakeTransport::new();
        transport.fail_region("ap");
        let repl = replicator(ReplicationStrategy::Synchronous, transport.clone());
        repl.add_region(region("ap", false)).unwrap();

        let err = repl.replicate_write("k", b"v", 1).await.unwrap_err();
        assert!(err.is_retryable());
        let status = repl.region_status();
        assert!(status[0].error.is_some());
    }

    #[tokio::test]
    async fn test_asynchronous_acks_immediately_and_retries() {
        let transport = FakeTransport::new();
        transport.fail_region("eu");
        let repl = replicator(ReplicationStrategy::Asynchronous, transport.clone());
        repl.add_region(region("eu", false)).unwrap();

        // The failing region does not block the caller.
        repl.replicate_write("k", b"v", 3).await.unwrap();

        // Heal before the retries are exhausted.
        transport.failing.write().clear();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.delivered.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_semi_sync_requires_primary() {
        let transport = FakeTransport::new();
        let repl = replicator(ReplicationStrategy::SemiSynchronous, transport.clone());
        repl.add_region(region("eu", false)).unwrap();

        let err = repl.replicate_write("k", b"v", 1).await.unwrap_err();
        assert_eq!(err.code(), "unavailable");

        repl.set_primary("eu").unwrap();
        repl.replicate_write("k", b"v", 2).await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_connects_and_disconnects() {
        let transport = FakeTransport::new();
        let repl = replicator(ReplicationStrategy::Asynchronous, transport.clone());
        repl.add_region(region("eu", false)).unwrap();
        assert!(!repl.all_regions_connected());

        repl.heartbeat_round().await;
        assert!(repl.all_regions_connected());

        // Failures inside the loss threshold keep the region connected.
        transport.fail_region("eu");
        repl.heartbeat_round().await;
        assert!(repl.all_regions_connected());

        // Age the last success past the threshold.
        {
            let mut status = repl.status.write();
            status.get_mut("eu").unwrap().last_heartbeat =
                Some(Instant::now() - Duration::from_secs(10));
        }
        repl.heartbeat_round().await;
        assert!(!repl.all_regions_connected());
    }
}
