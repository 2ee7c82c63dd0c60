/// Two-Phase Commit Coordination
///
/// The coordinator drives prepare/commit/abort across named participants.
/// Lifecycle: Active -> Prepared -> Committed | Aborted; a transaction never
/// returns to Active and terminal states are permanent.
///
/// Phase deadlines: prepare runs under `prepare_timeout` (default 5s),
/// commit and abort under `commit_abort_timeout` (default 3s). A deadline
/// expiry counts as a NO vote / participant failure. A commit-phase failure
/// leaves partial effects on the participants that already committed; the
/// coordinator records exactly which ones and surfaces them to the caller.
///
/// Operations on distinct transaction ids proceed in parallel; operations
/// on the same id are serialized through a per-transaction async lock.
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use super::TxnId;
use crate::error::{ClusterError, Result};
use crate::events::{ClusterEvent, EventBus};
use crate::worker::{spawn_periodic, WorkerHandle};

/// A named transaction participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: String,
    pub address: String,
    pub port: u16,
}

impl ParticipantInfo {
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
        }
    }
}

/// 2PC transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TwoPhaseState {
    Active,
    Prepared,
    Committed,
    Aborted,
}

/// Participant-side callbacks. Implementations must be idempotent: the
/// coordinator may deliver prepare, commit or abort more than once.
#[async_trait]
pub trait TwoPhaseDriver: Send + Sync {
    /// Phase 1 vote. `Ok(true)` is a YES.
    async fn prepare(&self, txn: &TxnId, participant: &ParticipantInfo) -> Result<bool>;
    /// Phase 2 commit.
    async fn commit(&self, txn: &TxnId, participant: &ParticipantInfo) -> Result<bool>;
    /// Abort; must succeed repeatedly for the same transaction.
    async fn abort(&self, txn: &TxnId, participant: &ParticipantInfo) -> Result<bool>;
}

/// Coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TwoPhaseConfig {
    pub prepare_timeout: Duration,
    pub commit_abort_timeout: Duration,
    /// A transaction still Active after this long is forcibly aborted by
    /// the sweeper. Prepared transactions are never unilaterally resolved.
    pub active_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for TwoPhaseConfig {
    fn default() -> Self {
        Self {
            prepare_timeout: Duration::from_secs(5),
            commit_abort_timeout: Duration::from_secs(3),
            active_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
struct TwoPhaseTxn {
    participants: Vec<ParticipantInfo>,
    state: TwoPhaseState,
    started_at: Instant,
    /// Commit-phase partial failure record: (committed, failed) ids.
    partial: Option<(Vec<String>, Vec<String>)>,
}

/// The 2PC coordinator.
pub struct TwoPhaseCoordinator {
    config: TwoPhaseConfig,
    transactions: DashMap<TxnId, TwoPhaseTxn>,
    /// Serializes operations per transaction id.
    txn_locks: DashMap<TxnId, Arc<AsyncMutex<()>>>,
    driver: RwLock<Option<Arc<dyn TwoPhaseDriver>>>,
    events: EventBus,
}

impl TwoPhaseCoordinator {
    pub fn new(config: TwoPhaseConfig, events: EventBus) -> Self {
        Self {
            config,
            transactions: DashMap::new(),
            txn_locks: DashMap::new(),
            driver: RwLock::new(None),
            events,
        }
    }

    pub fn set_driver(&self, driver: Arc<dyn TwoPhaseDriver>) {
        *self.driver.write() = Some(driver);
    }

    pub fn begin(&self, txn: TxnId, participants: Vec<ParticipantInfo>) -> Result<()> {
        if self.transactions.contains_key(&txn) {
            return Err(ClusterError::Duplicate(format!("transaction {}", txn)));
        }
        self.transactions.insert(
            txn.clone(),
            TwoPhaseTxn {
                participants,
                state: TwoPhaseState::Active,
                started_at: Instant::now(),
                partial: None,
            },
        );
        info!(txn = %txn, "transaction started");
        Ok(())
    }

    pub fn add_participant(&self, txn: &TxnId, participant: ParticipantInfo) -> Result<()> {
        let mut entry = self
            .transactions
            .get_mut(txn)
            .ok_or_else(|| ClusterError::NotFound(format!("transaction {}", txn)))?;
        if entry.state != TwoPhaseState::Active {
            return Err(ClusterError::WrongState(format!(
                "transaction {} is {:?}",
                txn, entry.state
            )));
        }
        if entry.participants.iter().any(|p| p.id == participant.id) {
            return Err(ClusterError::Duplicate(format!(
                "participant {} in {}",
                participant.id, txn
            )));
        }
        entry.participants.push(participant);
        Ok(())
    }

    pub fn state(&self, txn: &TxnId) -> Result<TwoPhaseState> {
        self.transactions
            .get(txn)
            .map(|t| t.state)
            .ok_or_else(|| ClusterError::NotFound(format!("transaction {}", txn)))
    }

    /// Commit-phase partial failure record, if any: which participants
    /// committed and which failed.
    pub fn partial_failure(&self, txn: &TxnId) -> Option<(Vec<String>, Vec<String>)> {
        self.transactions.get(txn).and_then(|t| t.partial.clone())
    }

    /// Run the full protocol for a transaction and return its terminal
    /// state. A clean NO vote aborts and returns `Aborted`; a commit-phase
    /// failure returns `participant_failed` with the partial record.
    pub async fn execute(&self, txn: &TxnId) -> Result<TwoPhaseState> {
        let lock = self.txn_lock(txn);
        let _guard = lock.lock().await;

        let participants = {
            let entry = self
                .transactions
                .get(txn)
                .ok_or_else(|| ClusterError::NotFound(format!("transaction {}", txn)))?;
            if entry.state != TwoPhaseState::Active {
                return Err(ClusterError::WrongState(format!(
                    "transaction {} is {:?}",
                    txn, entry.state
                )));
            }
            entry.participants.clone()
        };
        let driver = self.driver.read().clone().ok_or_else(|| {
            ClusterError::Unavailable("no participant driver registered".into())
        })?;

        // Phase 1: collect votes from every participant in parallel. Errors
        // and deadline expiries count as NO.
        let votes = join_all(participants.iter().map(|p| {
            let driver = Arc::clone(&driver);
            let txn = txn.clone();
            let participant = p.clone();
            async move {
                let vote = tokio::time::timeout(
                    self.config.prepare_timeout,
                    driver.prepare(&txn, &participant),
                )
                .await;
                let yes = matches!(vote, Ok(Ok(true)));
                (participant.id.clone(), yes)
            }
        }))
        .await;

        if votes.iter().any(|(_, yes)| !yes) {
            let no_voters: Vec<&str> = votes
                .iter()
                .filter(|(_, yes)| !yes)
                .map(|(id, _)| id.as_str())
                .collect();
            warn!(txn = %txn, no_voters = ?no_voters, "prepare rejected, aborting");
            self.abort_all(&driver, txn, &participants).await;
            self.finish(txn, TwoPhaseState::Aborted);
            return Ok(TwoPhaseState::Aborted);
        }

        self.set_state(txn, TwoPhaseState::Prepared);

        // Phase 2: commit everywhere. Failures here leave partial effects;
        // record precisely which participants committed.
        let outcomes = join_all(participants.iter().map(|p| {
            let driver = Arc::clone(&driver);
            let txn = txn.clone();
            let participant = p.clone();
            async move {
                let committed = tokio::time::timeout(
                    self.config.commit_abort_timeout,
                    driver.commit(&txn, &participant),
                )
                .await;
                (participant.id.clone(), matches!(committed, Ok(Ok(true))))
            }
        }))
        .await;

        let committed: Vec<String> = outcomes
            .iter()
            .filter(|(_, ok)| *ok)
            .map(|(id, _)| id.clone())
            .collect();
        let failed: Vec<String> = outcomes
            .iter()
            .filter(|(_, ok)| !*ok)
            .map(|(id, _)| id.clone())
            .collect();

        if failed.is_empty() {
            self.finish(txn, TwoPhaseState::Committed);
            return Ok(TwoPhaseState::Committed);
        }

        warn!(txn = %txn, committed = ?committed, failed = ?failed,
            "commit phase failed on a subset of participants");
        if let Some(mut entry) = self.transactions.get_mut(txn) {
            entry.partial = Some((committed.clone(), failed.clone()));
        }
        self.finish(txn, TwoPhaseState::Aborted);
        Err(ClusterError::ParticipantFailed(format!(
            "transaction {}: committed on [{}], failed on [{}]",
            txn,
            committed.join(", "),
            failed.join(", ")
        )))
    }

    /// Abort a transaction explicitly. Idempotent toward participants.
    pub async fn abort(&self, txn: &TxnId) -> Result<TwoPhaseState> {
        let lock = self.txn_lock(txn);
        let _guard = lock.lock().await;

        let (participants, state) = {
            let entry = self
                .transactions
                .get(txn)
                .ok_or_else(|| ClusterError::NotFound(format!("transaction {}", txn)))?;
            (entry.participants.clone(), entry.state)
        };
        match state {
            TwoPhaseState::Committed => {
                return Err(ClusterError::WrongState(format!(
                    "transaction {} already committed",
                    txn
                )))
            }
            TwoPhaseState::Aborted => return Ok(TwoPhaseState::Aborted),
            TwoPhaseState::Active | TwoPhaseState::Prepared => {}
        }

        let driver = self.driver.read().clone();
        if let Some(driver) = driver {
            self.abort_all(&driver, txn, &participants).await;
        }
        self.finish(txn, TwoPhaseState::Aborted);
        Ok(TwoPhaseState::Aborted)
    }

    /// One sweep over the transaction table: force-abort overdue Active
    /// transactions and flag stuck Prepared ones for recovery.
    pub async fn sweep(&self) {
        let mut to_abort = Vec::new();
        let mut stuck = Vec::new();
        for entry in self.transactions.iter() {
            let age = entry.started_at.elapsed();
            match entry.state {
                TwoPhaseState::Active if age > self.config.active_timeout => {
                    to_abort.push(entry.key().clone());
                }
                TwoPhaseState::Prepared if age > self.config.active_timeout => {
                    stuck.push(entry.key().clone());
                }
                _ => {}
            }
        }

        for txn in to_abort {
            warn!(txn = %txn, "active transaction overdue, forcing abort");
            let _ = self.abort(&txn).await;
        }
        for txn in stuck {
            // No unilateral commit or abort after prepare; surface for
            // operator-driven recovery instead.
            warn!(txn = %txn, "transaction stuck in prepared state");
            self.events.publish(ClusterEvent::TransactionStuckPrepared {
                txn: txn.to_string(),
            });
        }
    }

    /// Spawn the timeout sweeper worker.
    pub fn start_sweeper(self: Arc<Self>) -> WorkerHandle {
        let interval = self.config.sweep_interval;
        spawn_periodic("two-phase-sweeper", interval, move || {
            let coordinator = Arc::clone(&self);
            async move {
                coordinator.sweep().await;
            }
        })
    }

    /// Drop terminal transactions older than `retention`.
    pub fn evict_finished(&self, retention: Duration) -> usize {
        let before = self.transactions.len();
        self.transactions.retain(|_, t| {
            !(matches!(t.state, TwoPhaseState::Committed | TwoPhaseState::Aborted)
                && t.started_at.elapsed() > retention)
        });
        let evicted = before - self.transactions.len();
        self.txn_locks
            .retain(|txn, _| self.transactions.contains_key(txn));
        evicted
    }

    async fn abort_all(
        &self,
        driver: &Arc<dyn TwoPhaseDriver>,
        txn: &TxnId,
        participants: &[ParticipantInfo],
    ) {
        join_all(participants.iter().map(|p| {
            let driver = Arc::clone(driver);
            let txn = txn.clone();
            let participant = p.clone();
            async move {
                let result = tokio::time::timeout(
                    self.config.commit_abort_timeout,
                    driver.abort(&txn, &participant),
                )
                .await;
                if !matches!(result, Ok(Ok(_))) {
                    warn!(txn = %txn, participant = %participant.id, "abort delivery failed");
                }
            }
        }))
        .await;
    }

    fn txn_lock(&self, txn: &TxnId) -> Arc<AsyncMutex<()>> {
        self.txn_locks
            .entry(txn.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn set_state(&self, txn: &TxnId, state: TwoPhaseState) {
        if let Some(mut entry) = self.transactions.get_mut(txn) {
            entry.state = state;
        }
    }

    fn finish(&self, txn: &TxnId, state: TwoPhaseState) {
        self.set_state(txn, state);
        self.events.publish(ClusterEvent::TransactionFinished {
            txn: txn.to_string(),
            state: format!("{:?}", state).to_lowercase(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// Scripted participant driver recording every delivery.
    struct ScriptedDriver {
        no_voters: HashSet<String>,
        commit_failures: HashSet<String>,
        prepared: Mutex<Vec<String>>,
        committed: Mutex<Vec<String>>,
        aborted: Mutex<Vec<String>>,
    }

    impl ScriptedDriver {
        fn new() -> Self {
            Self {
                no_voters: HashSet::new(),
                commit_failures: HashSet::new(),
                prepared: Mutex::new(Vec::new()),
                committed: Mutex::new(Vec::new()),
                aborted: Mutex::new(Vec::new()),
            }
        }

        fn vote_no(mut self, id: &str) -> Self {
            self.no_voters.insert(id.to_string());
            self
        }

        fn fail_commit(mut self, id: &str) -> Self {
            self.commit_failures.insert(id.to_string());
            self
        }
    }

    #[async_trait]
    impl TwoPhaseDriver for ScriptedDriver {
        async fn prepare(&self, _txn: &TxnId, p: &ParticipantInfo) -> Result<bool> {
            self.prepared.lock().push(p.id.clone());
            Ok(!self.no_voters.contains(&p.id))
        }

        async fn commit(&self, _txn: &TxnId, p: &ParticipantInfo) -> Result<bool> {
            if self.commit_failures.contains(&p.id) {
                return Err(ClusterError::ParticipantFailed(p.id.clone()));
            }
            self.committed.lock().push(p.id.clone());
            Ok(true)
        }

        async fn abort(&self, _txn: &TxnId, p: &ParticipantInfo) -> Result<bool> {
            self.aborted.lock().push(p.id.clone());
            Ok(true)
        }
    }

    fn participants() -> Vec<ParticipantInfo> {
        vec![
            ParticipantInfo::new("p1", "10.0.0.1", 7100),
            ParticipantInfo::new("p2", "10.0.0.2", 7100),
            ParticipantInfo::new("p3", "10.0.0.3", 7100),
        ]
    }

    fn coordinator(driver: ScriptedDriver) -> (TwoPhaseCoordinator, Arc<ScriptedDriver>) {
        let coordinator = TwoPhaseCoordinator::new(TwoPhaseConfig::default(), EventBus::default());
        let driver = Arc::new(driver);
        coordinator.set_driver(driver.clone());
        (coordinator, driver)
    }

    #[tokio::test]
    async fn test_all_yes_commits() {
        let (coordinator, driver) = coordinator(ScriptedDriver::new());
        let txn = TxnId::new("t1");
        coordinator.begin(txn.clone(), participants()).unwrap();

        let state = coordinator.execute(&txn).await.unwrap();
        assert_eq!(state, TwoPhaseState::Committed);
        assert_eq!(driver.prepared.lock().len(), 3);
        assert_eq!(driver.committed.lock().len(), 3);
        assert!(driver.aborted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_no_vote_aborts_without_commit() {
        let (coordinator, driver) = coordinator(ScriptedDriver::new().vote_no("p2"));
        let txn = TxnId::new("t1");
        coordinator.begin(txn.clone(), participants()).unwrap();

        let state = coordinator.execute(&txn).await.unwrap();
        assert_eq!(state, TwoPhaseState::Aborted);
        // Commit is never invoked on any participant.
        assert!(driver.committed.lock().is_empty());
        // Abort reaches all three.
        let mut aborted = driver.aborted.lock().clone();
        aborted.sort();
        assert_eq!(aborted, vec!["p1", "p2", "p3"]);
        assert_eq!(coordinator.state(&txn).unwrap(), TwoPhaseState::Aborted);
    }

    #[tokio::test]
    async fn test_commit_failure_reports_partial() {
        let (coordinator, _driver) = coordinator(ScriptedDriver::new().fail_commit("p3"));
        let txn = TxnId::new("t1");
        coordinator.begin(txn.clone(), participants()).unwrap();

        let err = coordinator.execute(&txn).await.unwrap_err();
        assert_eq!(err.code(), "participant_failed");
        assert!(err.to_string().contains("p3"));

        let (committed, failed) = coordinator.partial_failure(&txn).unwrap();
        assert_eq!(failed, vec!["p3"]);
        assert_eq!(committed.len(), 2);
        assert_eq!(coordinator.state(&txn).unwrap(), TwoPhaseState::Aborted);
    }

    #[tokio::test]
    async fn test_begin_duplicate() {
        let (coordinator, _) = coordinator(ScriptedDriver::new());
        let txn = TxnId::new("t1");
        coordinator.begin(txn.clone(), Vec::new()).unwrap();
        assert_eq!(
            coordinator.begin(txn, Vec::new()).unwrap_err().code(),
            "duplicate"
        );
    }

    #[tokio::test]
    async fn test_add_participant_guards() {
        let (coordinator, _) = coordinator(ScriptedDriver::new());
        let txn = TxnId::new("t1");
        assert_eq!(
            coordinator
                .add_participant(&txn, ParticipantInfo::new("p1", "a", 1))
                .unwrap_err()
                .code(),
            "not_found"
        );

        coordinator.begin(txn.clone(), Vec::new()).unwrap();
        coordinator
            .add_participant(&txn, ParticipantInfo::new("p1", "a", 1))
            .unwrap();
        assert_eq!(
            coordinator
                .add_participant(&txn, ParticipantInfo::new("p1", "a", 1))
                .unwrap_err()
                .code(),
            "duplicate"
        );

        coordinator.execute(&txn).await.unwrap();
        assert_eq!(
            coordinator
                .add_participant(&txn, ParticipantInfo::new("p2", "a", 1))
                .unwrap_err()
                .code(),
            "wrong_state"
        );
    }

    #[tokio::test]
    async fn test_execute_twice_is_wrong_state() {
        let (coordinator, _) = coordinator(ScriptedDriver::new());
        let txn = TxnId::new("t1");
        coordinator.begin(txn.clone(), participants()).unwrap();
        coordinator.execute(&txn).await.unwrap();
        assert_eq!(
            coordinator.execute(&txn).await.unwrap_err().code(),
            "wrong_state"
        );
    }

    #[tokio::test]
    async fn test_abort_is_idempotent() {
        let (coordinator, driver) = coordinator(ScriptedDriver::new());
        let txn = TxnId::new("t1");
        coordinator.begin(txn.clone(), participants()).unwrap();

        assert_eq!(coordinator.abort(&txn).await.unwrap(), TwoPhaseState::Aborted);
        assert_eq!(coordinator.abort(&txn).await.unwrap(), TwoPhaseState::Aborted);
        // Second abort short-circuits; participants saw one round.
        assert_eq!(driver.aborted.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_prepare_timeout_counts_as_no() {
        struct SlowDriver;
        #[async_trait]
        impl TwoPhaseDriver for SlowDriver {
            async fn prepare(&self, _t: &TxnId, _p: &ParticipantInfo) -> Result<bool> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(true)
            }
            async fn commit(&self, _t: &TxnId, _p: &ParticipantInfo) -> Result<bool> {
                Ok(true)
            }
            async fn abort(&self, _t: &TxnId, _p: &ParticipantInfo) -> Result<bool> {
                Ok(true)
            }
        }

        let coordinator = TwoPhaseCoordinator::new(
            TwoPhaseConfig {
                prepare_timeout: Duration::from_millis(20),
                commit_abort_timeout: Duration::from_millis(20),
                ..TwoPhaseConfig::default()
            },
            EventBus::default(),
        );
        coordinator.set_driver(Arc::new(SlowDriver));
        let txn = TxnId::new("t1");
        coordinator
            .begin(txn.clone(), vec![ParticipantInfo::new("p1", "a", 1)])
            .unwrap();
        let state = coordinator.execute(&txn).await.unwrap();
        assert_eq!(state, TwoPhaseState::Aborted);
    }

    #[tokio::test]
    async fn test_sweeper_aborts_overdue_active() {
        let (coordinator, driver) = {
            let coordinator = TwoPhaseCoordinator::new(
                TwoPhaseConfig {
                    active_timeout: Duration::from_millis(1),
                    ..TwoPhaseConfig::default()
                },
                EventBus::default(),
            );
            let driver = Arc::new(ScriptedDriver::new());
            coordinator.set_driver(driver.clone());
            (coordinator, driver)
        };
        let txn = TxnId::new("t1");
        coordinator.begin(txn.clone(), participants()).unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        coordinator.sweep().await;
        assert_eq!(coordinator.state(&txn).unwrap(), TwoPhaseState::Aborted);
        assert_eq!(driver.aborted.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_evict_finished() {
        let (coordinator, _) = coordinator(ScriptedDriver::new());
        let txn = TxnId::new("t1");
        coordinator.begin(txn.clone(), participants()).unwrap();
        coordinator.execute(&txn).await.unwrap();

        assert_eq!(coordinator.evict_finished(Duration::ZERO), 1);
        assert_eq!(coordinator.state(&txn).unwrap_err().code(), "not_found");
    }
}
