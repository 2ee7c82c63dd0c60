// Cooperative background worker handles.
//
// Every background loop in the core (liveness monitor, consensus tick,
// region heartbeats, 2PC sweeper, scaler evaluator) runs under a
// `WorkerHandle`: the loop receives a shutdown signal it must check at every
// iteration, and `shutdown(deadline)` bounds how long a drain may take.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ClusterError, Result};

/// Receiver side of the cancellation signal, passed into worker loops.
pub type ShutdownSignal = watch::Receiver<bool>;

/// Returns true once shutdown has been requested.
pub fn is_shutdown(signal: &ShutdownSignal) -> bool {
    *signal.borrow()
}

/// Handle to a spawned background worker.
pub struct WorkerHandle {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn a worker. The factory receives the shutdown signal; its future
    /// must observe the signal at every loop iteration.
    pub fn spawn<F, Fut>(name: &'static str, factory: F) -> Self
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(factory(shutdown_rx));
        debug!(worker = name, "worker started");
        Self {
            name,
            shutdown_tx,
            join,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request shutdown and wait for the worker to drain, up to `deadline`.
    /// A worker that does not stop in time is aborted and a timeout error is
    /// returned so callers can report the missed drain budget.
    pub async fn shutdown(mut self, deadline: Duration) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(deadline, &mut self.join).await {
            Ok(_) => {
                debug!(worker = self.name, "worker drained");
                Ok(())
            }
            Err(_) => {
                warn!(worker = self.name, "worker missed drain deadline, aborting");
                self.join.abort();
                Err(ClusterError::Timeout(format!(
                    "worker {} did not drain within {:?}",
                    self.name, deadline
                )))
            }
        }
    }
}

/// Convenience: a loop that fires `body` every `period` until shutdown.
pub fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, mut body: F) -> WorkerHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    WorkerHandle::spawn(name, move |mut signal| async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    body().await;
                }
                changed = signal.changed() => {
                    if changed.is_err() || *signal.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
