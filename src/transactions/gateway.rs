// Transaction Gateway
//
// Thin facade binding the 2PC coordinator, the saga orchestrator and the
// cross-shard executor under a single transaction-id space. The gateway
// owns only the id -> kind mapping; protocol state lives in the owning
// coordinator.

use std::sync::Arc;

use dashmap::DashMap;

use super::saga::{SagaOrchestrator, SagaStep};
use super::two_phase::{ParticipantInfo, TwoPhaseCoordinator};
use super::{TxnId, TxnKind, TxnState};
use crate::error::{ClusterError, Result};
use crate::query::{CrossShardExecutor, ShardQueryResult};
use crate::sharding::ShardId;

/// Facade over both commitment protocols plus cross-shard queries.
pub struct TransactionGateway {
    two_phase: Arc<TwoPhaseCoordinator>,
    saga: Arc<SagaOrchestrator>,
    executor: Arc<CrossShardExecutor>,
    kinds: DashMap<TxnId, TxnKind>,
}

impl TransactionGateway {
    pub fn new(
        two_phase: Arc<TwoPhaseCoordinator>,
        saga: Arc<SagaOrchestrator>,
        executor: Arc<CrossShardExecutor>,
    ) -> Self {
        Self {
            two_phase,
            saga,
            executor,
            kinds: DashMap::new(),
        }
    }

    /// Begin a transaction of the given kind. A `None` id gets a generated
    /// one; an explicit id that already exists is a duplicate.
    pub fn begin_transaction(&self, id: Option<TxnId>, kind: TxnKind) -> Result<TxnId> {
        let txn = id.unwrap_or_else(TxnId::generate);
        if self.kinds.contains_key(&txn) {
            return Err(ClusterError::Duplicate(format!("transaction {}", txn)));
        }
        match kind {
            TxnKind::TwoPhase => self.two_phase.begin(txn.clone(), Vec::new())?,
            TxnKind::Saga => self.saga.begin(txn.clone())?,
        }
        self.kinds.insert(txn.clone(), kind);
        Ok(txn)
    }

    /// Add a 2PC participant. Rejected for sagas.
    pub fn add_participant(&self, txn: &TxnId, participant: ParticipantInfo) -> Result<()> {
        match self.kind(txn)? {
            TxnKind::TwoPhase => self.two_phase.add_participant(txn, participant),
            TxnKind::Saga => Err(ClusterError::WrongState(format!(
                "transaction {} is a saga, participants belong to two-phase transactions",
                txn
            ))),
        }
    }

    /// Add a saga step. Rejected for 2PC transactions.
    pub fn add_saga_step(&self, txn: &TxnId, step: SagaStep) -> Result<()> {
        match self.kind(txn)? {
            TxnKind::Saga => self.saga.add_step(txn, step),
            TxnKind::TwoPhase => Err(ClusterError::WrongState(format!(
                "transaction {} is two-phase, steps belong to sagas",
                txn
            ))),
        }
    }

    /// Drive the transaction to a terminal state.
    pub async fn execute_transaction(&self, txn: &TxnId) -> Result<TxnState> {
        match self.kind(txn)? {
            TxnKind::TwoPhase => self.two_phase.execute(txn).await.map(TxnState::from),
            TxnKind::Saga => self.saga.execute(txn).await.map(TxnState::from),
        }
    }

    /// Current unified state.
    pub fn transaction_state(&self, txn: &TxnId) -> Result<TxnState> {
        match self.kind(txn)? {
            TxnKind::TwoPhase => self.two_phase.state(txn).map(TxnState::from),
            TxnKind::Saga => self.saga.state(txn).map(TxnState::from),
        }
    }

    pub fn transaction_kind(&self, txn: &TxnId) -> Result<TxnKind> {
        self.kind(txn)
    }

    /// Run a cross-shard query in the context of a known transaction.
    pub async fn execute_cross_shard(
        &self,
        txn: &TxnId,
        query: &str,
        shard_ids: Option<&[ShardId]>,
    ) -> Result<Vec<ShardQueryResult>> {
        self.kind(txn)?;
        match shard_ids {
            Some(ids) => self.executor.execute_on_subset(query, ids).await,
            None => self.executor.execute_on_all(query).await,
        }
    }

    fn kind(&self, txn: &TxnId) -> Result<TxnKind> {
        self.kinds
            .get(txn)
            .map(|k| *k)
            .ok_or_else(|| ClusterError::NotFound(format!("transaction {}", txn)))
    }
}
