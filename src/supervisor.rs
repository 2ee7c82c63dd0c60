// Cluster Supervisor
//
// Top-level facade. Builds the components leaf-first, wires them through
// the event bus and seam traits, spawns the background workers, and exposes
// the coarse operator interface. Components never hold owning references to
// each other: the supervisor owns everything and relations flow through ids
// and callbacks.
//
// Startup fails if any component fails to construct. Shutdown walks the
// workers in reverse start order and bounds the whole drain with the
// configured budget.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::ClusterConfig;
use crate::conflict::ConflictResolver;
use crate::consensus::{ApplyFn, LogEntry, LogIndex, LogStore, RaftTransport, ReplicaStatus, ReplicatedLog};
use crate::discovery::{DiscoveredNode, DiscoveryProbe, NodeDiscovery};
use crate::error::{ClusterError, Result};
use crate::events::{ClusterEvent, EventBus};
use crate::health::{HealthChecker, HealthIssue};
use crate::load_balancer::{LoadBalancer, NodeStats};
use crate::node::{NodeHandle, NodeId, NodeLiveness};
use crate::query::{CrossShardExecutor, ShardEndpoint, ShardQueryDriver, ShardQueryResult};
use crate::rebalancer::{DataMover, RebalanceReport, Rebalancer};
use crate::registry::{NodeRegistry, RegistryObserver};
use crate::replication::{RegionDescriptor, RegionReplicator, RegionTransport};
use crate::scaler::{ElasticScaler, ResourceSample, ScalingExecutor};
use crate::sharding::{ShardId, ShardMap};
use crate::transactions::{
    SagaDriver, SagaOrchestrator, TransactionGateway, TwoPhaseCoordinator, TwoPhaseDriver, TxnId,
    TxnKind, TxnState,
};
use crate::worker::WorkerHandle;

/// External seams the supervisor wires into the components. The transports
/// are required; drivers are optional until the corresponding feature is
/// used.
pub struct ClusterSeams {
    pub log_store: Arc<dyn LogStore>,
    pub raft_transport: Arc<dyn RaftTransport>,
    pub region_transport: Arc<dyn RegionTransport>,
    pub two_phase_driver: Option<Arc<dyn TwoPhaseDriver>>,
    pub saga_driver: Option<Arc<dyn SagaDriver>>,
    pub shard_query_driver: Option<Arc<dyn ShardQueryDriver>>,
    pub data_mover: Option<Arc<dyn DataMover>>,
    pub scaling_executor: Option<Arc<dyn ScalingExecutor>>,
    /// When present, seed-based discovery feeds the registry automatically.
    pub discovery_probe: Option<Arc<dyn DiscoveryProbe>>,
    /// Invoked for every applied entry, after built-in handling.
    pub apply_hook: Option<ApplyFn>,
}

/// Coarse cluster health, aggregated from the components.
#[derive(Debug, Clone)]
pub struct ClusterHealthReport {
    pub total_nodes: usize,
    pub live_nodes: usize,
    pub has_quorum: bool,
    pub consensus: ReplicaStatus,
    pub all_regions_connected: bool,
}

/// Keeps the balancer's candidate set in lockstep with the registry.
struct BalancerSync {
    balancer: Arc<LoadBalancer>,
}

impl RegistryObserver for BalancerSync {
    fn on_node_added(&self, node: &crate::node::NodeDescriptor) {
        self.balancer.add_candidate(node.id.clone());
    }

    fn on_node_removed(&self, node: &NodeId) {
        self.balancer.remove_candidate(node);
    }

    fn on_liveness_changed(&self, node: &NodeId, liveness: NodeLiveness) {
        self.balancer
            .mark_health(node, liveness == NodeLiveness::Live);
    }
}

/// Top-level facade over the coordination core.
pub struct ClusterSupervisor {
    config: ClusterConfig,
    events: EventBus,
    registry: Arc<NodeRegistry>,
    balancer: Arc<LoadBalancer>,
    shard_map: Arc<ShardMap>,
    rebalancer: Arc<Rebalancer>,
    consensus: Arc<ReplicatedLog>,
    replicator: Arc<RegionReplicator>,
    resolver: Arc<ConflictResolver>,
    query_executor: Arc<CrossShardExecutor>,
    gateway: Arc<TransactionGateway>,
    scaler: Arc<ElasticScaler>,
    discovery: Option<Arc<NodeDiscovery>>,
    data_mover: Option<Arc<dyn DataMover>>,
    /// Workers in start order; shutdown drains them in reverse.
    workers: Mutex<Vec<WorkerHandle>>,
}

impl ClusterSupervisor {
    /// Build, wire and start the coordination core for `local` within the
    /// consensus voter set `voters`. Must run inside a tokio runtime.
    pub fn start(
        local: NodeId,
        voters: Vec<NodeId>,
        config: ClusterConfig,
        seams: ClusterSeams,
    ) -> Result<Self> {
        let events = EventBus::default();

        // Leaf components first.
        let registry = Arc::new(NodeRegistry::new(config.registry.clone(), events.clone()));
        let balancer = Arc::new(LoadBalancer::new(
            config.balance_policy,
            config.score_weights,
        ));
        let shard_map = Arc::new(ShardMap::new(config.placement_strategy));
        let rebalancer = Arc::new(Rebalancer::new(
            config.rebalance.clone(),
            Arc::clone(&shard_map),
            events.clone(),
        ));
        let resolver = Arc::new(ConflictResolver::new(config.conflict_resolution_strategy));

        let consensus = ReplicatedLog::new(
            local.clone(),
            voters,
            config.consensus.clone(),
            seams.log_store,
            seams.raft_transport,
            events.clone(),
        )?;

        let replicator = RegionReplicator::new(
            config.replication.clone(),
            config.replication_strategy,
            seams.region_transport,
            events.clone(),
        );

        let two_phase = Arc::new(TwoPhaseCoordinator::new(
            config.two_phase.clone(),
            events.clone(),
        ));
        if let Some(driver) = seams.two_phase_driver {
            two_phase.set_driver(driver);
        }
        let saga = Arc::new(SagaOrchestrator::new(config.saga.clone(), events.clone()));
        if let Some(driver) = seams.saga_driver {
            saga.set_driver(driver);
        }
        let query_executor = Arc::new(CrossShardExecutor::new(config.query.clone()));
        if let Some(driver) = seams.shard_query_driver {
            query_executor.set_driver(driver);
        }
        let gateway = Arc::new(TransactionGateway::new(
            Arc::clone(&two_phase),
            Arc::clone(&saga),
            Arc::clone(&query_executor),
        ));

        let scaler = Arc::new(ElasticScaler::new(config.scaler.clone(), events.clone()));
        if let Some(executor) = seams.scaling_executor {
            scaler.set_executor(executor);
        }
        {
            let registry = Arc::clone(&registry);
            scaler.set_cluster_size_fn(Arc::new(move || registry.len()));
        }

        // Registry membership drives the balancer candidate set.
        registry.add_observer(Arc::new(BalancerSync {
            balancer: Arc::clone(&balancer),
        }));

        // Committed writes flow onward to peer regions, then to the caller's
        // apply hook.
        {
            let replicator = Arc::clone(&replicator);
            let apply_hook = seams.apply_hook;
            consensus.set_apply_callback(Arc::new(move |entry: &LogEntry| {
                if let Some((key, value)) = parse_write(entry) {
                    let replicator = Arc::clone(&replicator);
                    let index = entry.index;
                    tokio::spawn(async move {
                        if let Err(e) =
                            replicator.replicate_write(&key, value.as_bytes(), index).await
                        {
                            warn!(key = %key, index, error = %e, "region replication failed");
                        }
                    });
                }
                if let Some(hook) = &apply_hook {
                    hook(entry);
                }
            }));
        }

        // Seed discovery, when a probe is supplied, keeps the registry in
        // sync with what the seeds report.
        let discovery = seams.discovery_probe.map(|probe| {
            let discovery = Arc::new(NodeDiscovery::new(config.discovery.clone(), probe));
            {
                let registry = Arc::clone(&registry);
                discovery.on_node_found(Arc::new(move |node: &DiscoveredNode| {
                    if let Err(e) =
                        registry.register(node.id.clone(), node.address.clone(), node.port)
                    {
                        if e.code() != "duplicate" {
                            warn!(node = %node.id, error = %e, "discovered node rejected");
                        }
                    }
                }));
            }
            {
                let registry = Arc::clone(&registry);
                discovery.on_node_lost(Arc::new(move |node: &DiscoveredNode| {
                    let _ = registry.deregister(&node.id);
                }));
            }
            discovery
        });

        // Background workers, in dependency order.
        let mut workers = vec![
            Arc::clone(&registry).start_monitor(),
            consensus.start(),
            Arc::clone(&replicator).start_heartbeats(),
            Arc::clone(&two_phase).start_sweeper(),
            Arc::clone(&scaler).start(),
        ];
        if let Some(discovery) = &discovery {
            workers.push(Arc::clone(discovery).start());
        }

        info!(node = %local, "cluster supervisor started");
        Ok(Self {
            config,
            events,
            registry,
            balancer,
            shard_map,
            rebalancer,
            consensus,
            replicator,
            resolver,
            query_executor,
            gateway,
            scaler,
            discovery,
            data_mover: seams.data_mover,
            workers: Mutex::new(workers),
        })
    }

    // Membership -----------------------------------------------------------

    pub fn add_node(&self, id: NodeId, address: impl Into<String>, port: u16) -> Result<NodeHandle> {
        self.registry.register(id, address, port)
    }

    pub fn remove_node(&self, id: &NodeId) -> Result<()> {
        self.registry.deregister(id)?;
        self.scaler.remove_sample(id);
        Ok(())
    }

    pub fn heartbeat(&self, id: &NodeId) -> Result<()> {
        self.registry.heartbeat(id)
    }

    /// Route a request: pick one live node under the balancing policy.
    pub fn pick_node(&self) -> Option<NodeId> {
        let live: Vec<NodeId> = self
            .registry
            .live_nodes()
            .into_iter()
            .map(|d| d.id)
            .collect();
        self.balancer.pick(&live)
    }

    // Consensus ------------------------------------------------------------

    /// Submit a command for replicated ordering. Returns the committed
    /// index, or a redirect hint when this node is not the leader.
    pub async fn submit_command(
        &self,
        command: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<LogIndex> {
        self.consensus.submit(command, payload).await
    }

    // Transactions ---------------------------------------------------------

    pub fn begin_transaction(&self, id: Option<TxnId>, kind: TxnKind) -> Result<TxnId> {
        self.gateway.begin_transaction(id, kind)
    }

    pub async fn execute_transaction(&self, txn: &TxnId) -> Result<TxnState> {
        self.gateway.execute_transaction(txn).await
    }

    pub fn gateway(&self) -> &Arc<TransactionGateway> {
        &self.gateway
    }

    // Queries --------------------------------------------------------------

    pub fn add_shard_endpoint(&self, shard: ShardEndpoint) -> Result<()> {
        self.query_executor.add_shard(shard)
    }

    pub async fn execute_cross_shard_query(
        &self,
        query: &str,
        shard_ids: Option<&[ShardId]>,
    ) -> Result<Vec<ShardQueryResult>> {
        match shard_ids {
            Some(ids) => self.query_executor.execute_on_subset(query, ids).await,
            None => self.query_executor.execute_on_all(query).await,
        }
    }

    // Metrics and scaling --------------------------------------------------

    /// Ingest a node resource sample; feeds both the scaler and the
    /// balancer's score policy.
    pub fn update_metrics(&self, sample: ResourceSample) -> Result<()> {
        self.balancer.update_stats(
            &sample.node,
            NodeStats {
                connections: 0,
                cpu_pct: sample.cpu_pct,
                mem_pct: sample.mem_pct,
                avg_response_ms: 0.0,
            },
        );
        self.scaler.update_sample(sample)
    }

    // Sharding -------------------------------------------------------------

    pub fn create_shards(&self, shard_count: usize, replication_factor: usize) -> Result<()> {
        let live: Vec<NodeId> = self
            .registry
            .live_nodes()
            .into_iter()
            .map(|d| d.id)
            .collect();
        self.shard_map
            .create_shards(&live, shard_count, replication_factor)
    }

    /// Plan and execute a rebalance over the current live nodes.
    pub async fn trigger_rebalance(&self) -> Result<RebalanceReport> {
        let mover = self
            .data_mover
            .clone()
            .ok_or_else(|| ClusterError::Unavailable("no data mover registered".into()))?;
        let live: Vec<NodeId> = self
            .registry
            .live_nodes()
            .into_iter()
            .map(|d| d.id)
            .collect();
        let plan = self.rebalancer.plan(&live);
        Ok(self.rebalancer.execute(plan, mover).await)
    }

    // Introspection --------------------------------------------------------

    pub fn health(&self) -> ClusterHealthReport {
        ClusterHealthReport {
            total_nodes: self.registry.len(),
            live_nodes: self.registry.live_len(),
            has_quorum: self.registry.is_healthy(),
            consensus: self.consensus.status(),
            all_regions_connected: self.replicator.all_regions_connected(),
        }
    }

    /// Detailed health evaluation: coarse status plus actionable issues,
    /// most severe first.
    pub fn health_issues(&self) -> (crate::health::ClusterHealth, Vec<HealthIssue>) {
        HealthChecker::evaluate(
            &self.registry.snapshot(),
            &self.consensus.status(),
            &self.replicator.region_status(),
            &self.scaler.samples(),
            &self.config.scaler.trigger,
        )
    }

    pub fn discovery(&self) -> Option<&Arc<NodeDiscovery>> {
        self.discovery.as_ref()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn shard_map(&self) -> &Arc<ShardMap> {
        &self.shard_map
    }

    pub fn rebalancer(&self) -> &Arc<Rebalancer> {
        &self.rebalancer
    }

    pub fn replicator(&self) -> &Arc<RegionReplicator> {
        &self.replicator
    }

    pub fn conflict_resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    pub fn consensus(&self) -> &Arc<ReplicatedLog> {
        &self.consensus
    }

    pub fn add_region(&self, region: RegionDescriptor) -> Result<()> {
        self.replicator.add_region(region)
    }

    /// Drain every worker in reverse start order within the configured
    /// budget. The first drain failure is reported after all workers have
    /// been asked to stop.
    pub async fn shutdown(self) -> Result<()> {
        let mut workers = {
            let mut guard = self.workers.lock();
            std::mem::take(&mut *guard)
        };
        let count = workers.len().max(1);
        let per_worker = self.config.shutdown_drain_budget / count as u32;

        let mut first_error = None;
        while let Some(worker) = workers.pop() {
            let name = worker.name();
            if let Err(e) = worker.shutdown(per_worker).await {
                warn!(worker = name, error = %e, "worker failed to drain");
                first_error.get_or_insert(e);
            }
        }
        info!("cluster supervisor stopped");
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

/// Writes travel through the log as command "WRITE" with a `key=value`
/// payload; everything else is opaque to the supervisor.
fn parse_write(entry: &LogEntry) -> Option<(String, String)> {
    if !entry.command.eq_ignore_ascii_case("write") {
        return None;
    }
    let payload = String::from_utf8(entry.payload.clone()).ok()?;
    let (key, value) = payload.split_once('=')?;
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}
