use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info};

use super::notifier::NewOrderReceiver;
use super::task::{ReconcileSettings, ReconcileTask};
use crate::accrual::AccrualOracle;
use crate::ledger::LedgerStore;

/// Makes sure every non-terminal order gets a reconciliation task: the ones
/// left over from a previous run (start-up sweep) and the ones announced
/// while running (notifier drain).
pub struct ReconcileDispatcher {
    store: Arc<dyn LedgerStore>,
    oracle: Arc<dyn AccrualOracle>,
    settings: ReconcileSettings,
    tracker: TaskTracker,
}

impl ReconcileDispatcher {
    pub fn new(store: Arc<dyn LedgerStore>, oracle: Arc<dyn AccrualOracle>, settings: ReconcileSettings) -> Self {
        Self {
            store,
            oracle,
            settings,
            tracker: TaskTracker::new(),
        }
    }

    /// Start the dispatcher (runs in background)
    pub fn start(self, receiver: NewOrderReceiver, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(receiver, cancel))
    }

    pub async fn run(self, mut receiver: NewOrderReceiver, cancel: CancellationToken) {
        let swept = self.startup_sweep(&cancel).await;
        info!("🧹 Start-up sweep queued {} pending orders", swept);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Stopping new-order drain due to cancellation");
                    break;
                }
                announced = receiver.recv() => match announced {
                    Some(order_id) => self.spawn_task(order_id, &cancel),
                    None => {
                        info!("New-order notifier closed");
                        break;
                    }
                },
            }
        }

        self.tracker.close();
        info!("⏳ Waiting for {} reconciliation tasks to stop", self.tracker.len());
        self.tracker.wait().await;
        info!("✓ Reconciliation dispatcher stopped");
    }

    /// Spawn one task per non-terminal order. Not retried on failure; the
    /// next process start sweeps again.
    pub async fn startup_sweep(&self, cancel: &CancellationToken) -> usize {
        match self.store.list_pending_debits().await {
            Ok(pending) => {
                let count = pending.len();
                for tx in pending {
                    self.spawn_task(tx.id, cancel);
                }
                count
            }
            Err(e) => {
                error!("Start-up sweep failed, pending orders wait for the next restart: {}", e);
                0
            }
        }
    }

    /// Duplicate ids are harmless: a task whose order is already terminal
    /// exits on its first read.
    pub fn spawn_task(&self, order_id: String, cancel: &CancellationToken) {
        let task = ReconcileTask::new(
            order_id.clone(),
            self.store.clone(),
            self.oracle.clone(),
            self.settings,
            cancel.child_token(),
        );

        self.tracker.spawn(async move {
            let exit = task.run().await;
            debug!("Reconciliation of order {} finished: {:?}", order_id, exit);
        });
    }
}
