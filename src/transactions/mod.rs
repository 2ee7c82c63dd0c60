// Distributed Transactions
//
// Two commitment protocols share one transaction-id space:
// - `two_phase`: short-running transactions where every participant is
//   online; prepare/commit/abort with per-phase deadlines.
// - `saga`: long-running transactions as ordered steps with compensations
//   that unwind completed work in reverse on failure.
//
// `gateway` binds both (plus cross-shard queries) behind a single facade.

pub mod gateway;
pub mod saga;
pub mod two_phase;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use gateway::TransactionGateway;
pub use saga::{SagaConfig, SagaDriver, SagaOrchestrator, SagaState, SagaStep, SagaStepStatus};
pub use two_phase::{
    ParticipantInfo, TwoPhaseConfig, TwoPhaseCoordinator, TwoPhaseDriver, TwoPhaseState,
};

/// Transaction identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnId(pub String);

impl TxnId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which protocol a transaction runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnKind {
    TwoPhase,
    Saga,
}

/// Unified transaction state across both protocols. Transitions are
/// monotonic and terminal states are permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    Active,
    Prepared,
    Committed,
    Aborted,
    Completed,
    Compensated,
    Failed,
}

impl TxnState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxnState::Active | TxnState::Prepared)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxnState::Active => "active",
            TxnState::Prepared => "prepared",
            TxnState::Committed => "committed",
            TxnState::Aborted => "aborted",
            TxnState::Completed => "completed",
            TxnState::Compensated => "compensated",
            TxnState::Failed => "failed",
        }
    }
}

impl From<TwoPhaseState> for TxnState {
    fn from(state: TwoPhaseState) -> Self {
        match state {
            TwoPhaseState::Active => TxnState::Active,
            TwoPhaseState::Prepared => TxnState::Prepared,
            TwoPhaseState::Committed => TxnState::Committed,
            TwoPhaseState::Aborted => TxnState::Aborted,
        }
    }
}

impl From<SagaState> for TxnState {
    fn from(state: SagaState) -> Self {
        match state {
            SagaState::Active => TxnState::Active,
            SagaState::Completed => TxnState::Completed,
            SagaState::Compensated => TxnState::Compensated,
            SagaState::Failed => TxnState::Failed,
        }
    }
}
