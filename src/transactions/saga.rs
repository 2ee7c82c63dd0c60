/// Saga Orchestration
///
/// A saga is an ordered list of steps, each pairing a forward action with a
/// compensation that semantically undoes it. Forward execution is strictly
/// sequential: step N+1 starts only after step N reported success. On any
/// failure (including the saga deadline expiring mid-flight) the
/// compensations of every Completed step run in reverse order.
///
/// Terminal states:
/// - Completed: every forward action succeeded
/// - Compensated: a step failed and every completed step was compensated
/// - Failed: at least one compensation did not succeed; this is an operator
///   alert condition, the saga left partial effects behind
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use super::TxnId;
use crate::error::{ClusterError, Result};
use crate::events::{ClusterEvent, EventBus};

/// Step status. A Completed step becomes Compensated when its compensation
/// succeeds; a step whose forward action never completed is never
/// compensated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaStepStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Compensated,
}

/// Saga terminal/lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaState {
    Active,
    Completed,
    Compensated,
    Failed,
}

/// One saga step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStep {
    pub id: String,
    pub participant: String,
    /// Forward action verb delivered to the driver.
    pub action: String,
    /// Compensation verb that undoes the forward action.
    pub compensation: String,
    pub data: String,
    pub status: SagaStepStatus,
}

impl SagaStep {
    pub fn new(
        id: impl Into<String>,
        participant: impl Into<String>,
        action: impl Into<String>,
        compensation: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            participant: participant.into(),
            action: action.into(),
            compensation: compensation.into(),
            data: data.into(),
            status: SagaStepStatus::Pending,
        }
    }
}

/// Callbacks executing forward actions and compensations on participants.
/// Compensations must tolerate double delivery.
#[async_trait]
pub trait SagaDriver: Send + Sync {
    async fn forward(&self, participant: &str, action: &str, data: &str) -> Result<bool>;
    async fn compensate(&self, participant: &str, compensation: &str, data: &str) -> Result<bool>;
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    /// Bound on the whole forward execution.
    pub saga_timeout: Duration,
    /// Per-compensation deadline; compensation is not bounded by the saga
    /// deadline, otherwise a timed-out saga could never clean up.
    pub compensation_timeout: Duration,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            saga_timeout: Duration::from_secs(30),
            compensation_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
struct Saga {
    steps: Vec<SagaStep>,
    state: SagaState,
    started_at: Instant,
}

/// Runs sagas to a terminal state.
pub struct SagaOrchestrator {
    config: SagaConfig,
    sagas: DashMap<TxnId, Saga>,
    saga_locks: DashMap<TxnId, Arc<AsyncMutex<()>>>,
    driver: RwLock<Option<Arc<dyn SagaDriver>>>,
    events: EventBus,
}

impl SagaOrchestrator {
    pub fn new(config: SagaConfig, events: EventBus) -> Self {
        Self {
            config,
            sagas: DashMap::new(),
            saga_locks: DashMap::new(),
            driver: RwLock::new(None),
            events,
        }
    }

    pub fn set_driver(&self, driver: Arc<dyn SagaDriver>) {
        *self.driver.write() = Some(driver);
    }

    pub fn begin(&self, saga: TxnId) -> Result<()> {
        if self.sagas.contains_key(&saga) {
            return Err(ClusterError::Duplicate(format!("saga {}", saga)));
        }
        self.sagas.insert(
            saga.clone(),
            Saga {
                steps: Vec::new(),
                state: SagaState::Active,
                started_at: Instant::now(),
            },
        );
        info!(saga = %saga, "saga started");
        Ok(())
    }

    pub fn add_step(&self, saga: &TxnId, step: SagaStep) -> Result<()> {
        let mut entry = self
            .sagas
            .get_mut(saga)
            .ok_or_else(|| ClusterError::NotFound(format!("saga {}", saga)))?;
        if entry.state != SagaState::Active {
            return Err(ClusterError::WrongState(format!(
                "saga {} is {:?}",
                saga, entry.state
            )));
        }
        if entry.steps.iter().any(|s| s.id == step.id) {
            return Err(ClusterError::Duplicate(format!(
                "step {} in saga {}",
                step.id, saga
            )));
        }
        entry.steps.push(step);
        Ok(())
    }

    pub fn state(&self, saga: &TxnId) -> Result<SagaState> {
        self.sagas
            .get(saga)
            .map(|s| s.state)
            .ok_or_else(|| ClusterError::NotFound(format!("saga {}", saga)))
    }

    pub fn steps(&self, saga: &TxnId) -> Result<Vec<SagaStep>> {
        self.sagas
            .get(saga)
            .map(|s| s.steps.clone())
            .ok_or_else(|| ClusterError::NotFound(format!("saga {}", saga)))
    }

    /// Run the saga to a terminal state. Returns `Completed` or
    /// `Compensated`; a compensation failure surfaces as
    /// `compensation_failed` and leaves the saga `Failed`.
    pub async fn execute(&self, saga: &TxnId) -> Result<SagaState> {
        let lock = self.saga_lock(saga);
        let _guard = lock.lock().await;

        let (steps, started_at) = {
            let entry = self
                .sagas
                .get(saga)
                .ok_or_else(|| ClusterError::NotFound(format!("saga {}", saga)))?;
            if entry.state != SagaState::Active {
                return Err(ClusterError::WrongState(format!(
                    "saga {} is {:?}",
                    saga, entry.state
                )));
            }
            (entry.steps.clone(), entry.started_at)
        };
        let driver = self
            .driver
            .read()
            .clone()
            .ok_or_else(|| ClusterError::Unavailable("no saga driver registered".into()))?;

        let deadline = started_at + self.config.saga_timeout;
        for (index, step) in steps.iter().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(saga = %saga, step = %step.id, "saga deadline expired mid-flight");
                return self.compensate_completed(&driver, saga, index).await;
            }

            self.set_step_status(saga, index, SagaStepStatus::Executing);
            let forward = tokio::time::timeout(
                remaining,
                driver.forward(&step.participant, &step.action, &step.data),
            )
            .await;

            if matches!(forward, Ok(Ok(true))) {
                self.set_step_status(saga, index, SagaStepStatus::Completed);
            } else {
                warn!(saga = %saga, step = %step.id, "forward action failed");
                self.set_step_status(saga, index, SagaStepStatus::Failed);
                return self.compensate_completed(&driver, saga, index).await;
            }
        }

        self.finish(saga, SagaState::Completed);
        Ok(SagaState::Completed)
    }

    /// Compensate every Completed step before `failed_index`, newest first.
    async fn compensate_completed(
        &self,
        driver: &Arc<dyn SagaDriver>,
        saga: &TxnId,
        failed_index: usize,
    ) -> Result<SagaState> {
        let steps = self
            .sagas
            .get(saga)
            .map(|s| s.steps.clone())
            .unwrap_or_default();

        let mut all_compensated = true;
        for index in (0..failed_index).rev() {
            let step = &steps[index];
            // Only completed work is undone; double delivery is a no-op.
            if step.status != SagaStepStatus::Completed {
                continue;
            }
            let result = tokio::time::timeout(
                self.config.compensation_timeout,
                driver.compensate(&step.participant, &step.compensation, &step.data),
            )
            .await;
            if matches!(result, Ok(Ok(true))) {
                self.set_step_status(saga, index, SagaStepStatus::Compensated);
            } else {
                warn!(saga = %saga, step = %step.id, "compensation failed");
                all_compensated = false;
            }
        }

        if all_compensated {
            self.finish(saga, SagaState::Compensated);
            Ok(SagaState::Compensated)
        } else {
            self.finish(saga, SagaState::Failed);
            Err(ClusterError::CompensationFailed(format!(
                "saga {} left uncompensated steps",
                saga
            )))
        }
    }

    /// Drop terminal sagas older than `retention`.
    pub fn evict_finished(&self, retention: Duration) -> usize {
        let before = self.sagas.len();
        self.sagas.retain(|_, s| {
            !(s.state != SagaState::Active && s.started_at.elapsed() > retention)
        });
        let evicted = before - self.sagas.len();
        self.saga_locks.retain(|saga, _| self.sagas.contains_key(saga));
        evicted
    }

    fn saga_lock(&self, saga: &TxnId) -> Arc<AsyncMutex<()>> {
        self.saga_locks
            .entry(saga.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn set_step_status(&self, saga: &TxnId, index: usize, status: SagaStepStatus) {
        if let Some(mut entry) = self.sagas.get_mut(saga) {
            if let Some(step) = entry.steps.get_mut(index) {
                step.status = status;
            }
        }
    }

    fn finish(&self, saga: &TxnId, state: SagaState) {
        if let Some(mut entry) = self.sagas.get_mut(saga) {
            entry.state = state;
        }
        self.events.publish(ClusterEvent::TransactionFinished {
            txn: saga.to_string(),
            state: format!("{:?}", state).to_lowercase(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// Driver that records call order and fails scripted steps.
    struct ScriptedDriver {
        fail_forward: HashSet<String>,
        fail_compensation: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedDriver {
        fn new() -> Self {
            Self {
                fail_forward: HashSet::new(),
                fail_compensation: HashSet::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn fail_forward(mut self, action: &str) -> Self {
            self.fail_forward.insert(action.to_string());
            self
        }

        fn fail_compensation(mut self, compensation: &str) -> Self {
            self.fail_compensation.insert(compensation.to_string());
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl SagaDriver for ScriptedDriver {
        async fn forward(&self, _participant: &str, action: &str, _data: &str) -> Result<bool> {
            self.calls.lock().push(action.to_string());
            Ok(!self.fail_forward.contains(action))
        }

        async fn compensate(
            &self,
            _participant: &str,
            compensation: &str,
            _data: &str,
        ) -> Result<bool> {
            self.calls.lock().push(compensation.to_string());
            Ok(!self.fail_compensation.contains(compensation))
        }
    }

    fn orchestrator(driver: ScriptedDriver) -> (SagaOrchestrator, Arc<ScriptedDriver>) {
        let orchestrator = SagaOrchestrator::new(SagaConfig::default(), EventBus::default());
        let driver = Arc::new(driver);
        orchestrator.set_driver(driver.clone());
        (orchestrator, driver)
    }

    fn three_step_saga(orchestrator: &SagaOrchestrator) -> TxnId {
        let saga = TxnId::new("s1");
        orchestrator.begin(saga.clone()).unwrap();
        for n in 1..=3 {
            orchestrator
                .add_step(
                    &saga,
                    SagaStep::new(
                        format!("s{}", n),
                        format!("p{}", n),
                        format!("act{}", n),
                        format!("comp{}", n),
                        "",
                    ),
                )
                .unwrap();
        }
        saga
    }

    #[tokio::test]
    async fn test_all_steps_complete() {
        let (orchestrator, driver) = orchestrator(ScriptedDriver::new());
        let saga = three_step_saga(&orchestrator);

        let state = orchestrator.execute(&saga).await.unwrap();
        assert_eq!(state, SagaState::Completed);
        assert_eq!(driver.calls(), vec!["act1", "act2", "act3"]);
        for step in orchestrator.steps(&saga).unwrap() {
            assert_eq!(step.status, SagaStepStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_failure_compensates_in_reverse_order() {
        let (orchestrator, driver) = orchestrator(ScriptedDriver::new().fail_forward("act3"));
        let saga = three_step_saga(&orchestrator);

        let state = orchestrator.execute(&saga).await.unwrap();
        assert_eq!(state, SagaState::Compensated);
        // comp(s2) then comp(s1); comp3 never runs.
        assert_eq!(
            driver.calls(),
            vec!["act1", "act2", "act3", "comp2", "comp1"]
        );

        let steps = orchestrator.steps(&saga).unwrap();
        assert_eq!(steps[0].status, SagaStepStatus::Compensated);
        assert_eq!(steps[1].status, SagaStepStatus::Compensated);
        assert_eq!(steps[2].status, SagaStepStatus::Failed);
    }

    #[tokio::test]
    async fn test_first_step_failure_compensates_nothing() {
        let (orchestrator, driver) = orchestrator(ScriptedDriver::new().fail_forward("act1"));
        let saga = three_step_saga(&orchestrator);

        let state = orchestrator.execute(&saga).await.unwrap();
        assert_eq!(state, SagaState::Compensated);
        assert_eq!(driver.calls(), vec!["act1"]);
    }

    #[tokio::test]
    async fn test_compensation_failure_marks_saga_failed() {
        let (orchestrator, _driver) = orchestrator(
            ScriptedDriver::new()
                .fail_forward("act3")
                .fail_compensation("comp1"),
        );
        let saga = three_step_saga(&orchestrator);

        let err = orchestrator.execute(&saga).await.unwrap_err();
        assert_eq!(err.code(), "compensation_failed");
        assert_eq!(orchestrator.state(&saga).unwrap(), SagaState::Failed);

        let steps = orchestrator.steps(&saga).unwrap();
        // comp2 succeeded, comp1 did not.
        assert_eq!(steps[1].status, SagaStepStatus::Compensated);
        assert_eq!(steps[0].status, SagaStepStatus::Completed);
    }

    #[tokio::test]
    async fn test_saga_timeout_triggers_compensation() {
        struct SlowDriver {
            calls: Mutex<Vec<String>>,
        }
        #[async_trait]
        impl SagaDriver for SlowDriver {
            async fn forward(&self, _p: &str, action: &str, _d: &str) -> Result<bool> {
                self.calls.lock().push(action.to_string());
                tokio::time::sleep(Duration::from_millis(40)).await;
                Ok(true)
            }
            async fn compensate(&self, _p: &str, compensation: &str, _d: &str) -> Result<bool> {
                self.calls.lock().push(compensation.to_string());
                Ok(true)
            }
        }

        let orchestrator = SagaOrchestrator::new(
            SagaConfig {
                saga_timeout: Duration::from_millis(60),
                ..SagaConfig::default()
            },
            EventBus::default(),
        );
        let driver = Arc::new(SlowDriver {
            calls: Mutex::new(Vec::new()),
        });
        orchestrator.set_driver(driver.clone());

        let saga = TxnId::new("slow");
        orchestrator.begin(saga.clone()).unwrap();
        for n in 1..=3 {
            orchestrator
                .add_step(
                    &saga,
                    SagaStep::new(
                        format!("s{}", n),
                        "p",
                        format!("act{}", n),
                        format!("comp{}", n),
                        "",
                    ),
                )
                .unwrap();
        }

        let state = orchestrator.execute(&saga).await.unwrap();
        assert_eq!(state, SagaState::Compensated);
        // The deadline cut execution short, and completed work unwound.
        let calls = driver.calls.lock().clone();
        assert!(calls.len() < 6);
        assert!(calls.contains(&"comp1".to_string()));
    }

    #[tokio::test]
    async fn test_double_compensation_is_noop() {
        let (orchestrator, driver) = orchestrator(ScriptedDriver::new().fail_forward("act3"));
        let saga = three_step_saga(&orchestrator);
        orchestrator.execute(&saga).await.unwrap();

        let calls_before = driver.calls().len();
        // Re-running compensation over already-compensated steps does nothing.
        let driver_arc: Arc<dyn SagaDriver> = driver.clone();
        let state = orchestrator
            .compensate_completed(&driver_arc, &saga, 2)
            .await
            .unwrap();
        assert_eq!(state, SagaState::Compensated);
        assert_eq!(driver.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn test_guards() {
        let (orchestrator, _) = orchestrator(ScriptedDriver::new());
        let saga = TxnId::new("s1");
        assert_eq!(
            orchestrator
                .add_step(&saga, SagaStep::new("a", "p", "x", "y", ""))
                .unwrap_err()
                .code(),
            "not_found"
        );
        orchestrator.begin(saga.clone()).unwrap();
        assert_eq!(orchestrator.begin(saga.clone()).unwrap_err().code(), "duplicate");

        orchestrator.execute(&saga).await.unwrap();
        assert_eq!(
            orchestrator
                .add_step(&saga, SagaStep::new("a", "p", "x", "y", ""))
                .unwrap_err()
                .code(),
            "wrong_state"
        );
    }
}
