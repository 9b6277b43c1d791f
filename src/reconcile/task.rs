use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accrual::{AccrualOracle, AccrualResponse, AccrualStatus, OracleReply};
use crate::error::OracleError;
use crate::ledger::models::{CreditOutcome, TransactionAction, TransactionStatus};
use crate::ledger::LedgerStore;

/// Timing of the per-order polling loop
#[derive(Debug, Clone, Copy)]
pub struct ReconcileSettings {
    /// Pause between two polls of a non-terminal order
    pub poll_interval: Duration,
    /// Pause after a transient oracle or store failure
    pub retry_backoff: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            retry_backoff: Duration::from_secs(5),
        }
    }
}

/// Local write implied by one oracle answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    MarkProcessing,
    MarkInvalid,
    Credit(Decimal),
    Wait,
}

/// Map the oracle's verdict onto the local status.
pub fn plan_transition(local: TransactionStatus, reply: &AccrualResponse) -> Transition {
    match reply.status {
        AccrualStatus::Registered => Transition::MarkProcessing,
        AccrualStatus::Processing if local == TransactionStatus::New => Transition::MarkProcessing,
        AccrualStatus::Processing => Transition::Wait,
        AccrualStatus::Invalid => Transition::MarkInvalid,
        AccrualStatus::Processed => match reply.accrual.unwrap_or(Decimal::ZERO) {
            // Never credited; keep polling until the oracle corrects itself
            accrual if accrual < Decimal::ZERO => Transition::Wait,
            accrual => Transition::Credit(accrual),
        },
        AccrualStatus::Unknown => Transition::Wait,
    }
}

/// Why a reconciliation task stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskExit {
    /// This task wrote the terminal status
    Finalized(TransactionStatus),
    /// The order was already terminal when this task looked at it
    AlreadyFinal(TransactionStatus),
    /// Unknown id or not a Debit order
    Skipped,
    Cancelled,
}

/// Per-order state machine that polls the accrual system until the order is
/// PROCESSED or INVALID.
pub struct ReconcileTask {
    transaction_id: String,
    store: Arc<dyn LedgerStore>,
    oracle: Arc<dyn AccrualOracle>,
    settings: ReconcileSettings,
    cancel: CancellationToken,
}

impl ReconcileTask {
    pub fn new(
        transaction_id: String,
        store: Arc<dyn LedgerStore>,
        oracle: Arc<dyn AccrualOracle>,
        settings: ReconcileSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transaction_id,
            store,
            oracle,
            settings,
            cancel,
        }
    }

    pub async fn run(self) -> TaskExit {
        let id = self.transaction_id.as_str();

        let mut local = match self.load_status().await {
            Ok(status) => status,
            Err(exit) => return exit,
        };

        debug!("🔄 Reconciling order {} from {}", id, local);

        loop {
            let reply = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.cancelled(),
                reply = self.oracle.order_status(id) => reply,
            };

            let response = match reply {
                Ok(OracleReply::Status(response)) => response,
                Ok(OracleReply::NotRegistered) => {
                    debug!("Order {} not registered by the accrual system yet", id);
                    if !self.pause(self.settings.retry_backoff).await {
                        return self.cancelled();
                    }
                    continue;
                }
                Err(OracleError::RateLimited { retry_after }) => {
                    let wait = retry_after
                        .map(Duration::from_secs)
                        .unwrap_or(self.settings.retry_backoff);
                    warn!("Accrual system throttled order {}, waiting {:?}", id, wait);
                    if !self.pause(wait).await {
                        return self.cancelled();
                    }
                    continue;
                }
                Err(e) => {
                    warn!("Accrual query failed for order {}: {}", id, e);
                    if !self.pause(self.settings.retry_backoff).await {
                        return self.cancelled();
                    }
                    continue;
                }
            };

            if self.cancel.is_cancelled() {
                return self.cancelled();
            }

            match plan_transition(local, &response) {
                Transition::MarkProcessing => {
                    match self.store.update_status(id, TransactionStatus::Processing).await {
                        Ok(true) => {
                            if local != TransactionStatus::Processing {
                                info!("Order {} is now PROCESSING", id);
                            }
                            local = TransactionStatus::Processing;
                        }
                        Ok(false) => return self.superseded().await,
                        Err(e) => error!("Failed to mark order {} PROCESSING: {}", id, e),
                    }
                }
                Transition::MarkInvalid => {
                    match self.store.update_status(id, TransactionStatus::Invalid).await {
                        Ok(true) => {
                            info!("❌ Order {} rejected by the accrual system", id);
                            return TaskExit::Finalized(TransactionStatus::Invalid);
                        }
                        Ok(false) => return self.superseded().await,
                        Err(e) => error!("Failed to mark order {} INVALID: {}", id, e),
                    }
                }
                Transition::Credit(accrual) => {
                    match self.store.update_status_and_credit(id, accrual).await {
                        Ok(CreditOutcome::Credited) => {
                            info!("✅ Order {} PROCESSED with accrual {}", id, accrual);
                            return TaskExit::Finalized(TransactionStatus::Processed);
                        }
                        Ok(CreditOutcome::AlreadyFinal(status)) => {
                            debug!("Order {} was already {}", id, status);
                            return TaskExit::AlreadyFinal(status);
                        }
                        Err(e) => error!("Failed to credit order {}: {}", id, e),
                    }
                }
                Transition::Wait => match response.status {
                    AccrualStatus::Unknown => {
                        warn!("Unrecognised accrual status for order {}, still polling", id);
                    }
                    AccrualStatus::Processed => {
                        warn!(
                            "Negative accrual {:?} reported for order {}, still polling",
                            response.accrual, id
                        );
                    }
                    _ => {}
                },
            }

            if !self.pause(self.settings.poll_interval).await {
                return self.cancelled();
            }
        }
    }

    /// First read of the order; retried until it succeeds or we are cancelled.
    async fn load_status(&self) -> Result<TransactionStatus, TaskExit> {
        let id = self.transaction_id.as_str();

        loop {
            match self.store.get_transaction(id).await {
                Ok(Some(tx)) if tx.is_pending_debit() => return Ok(tx.status),
                Ok(Some(tx)) if tx.action != TransactionAction::Debit => {
                    warn!("Transaction {} is not an order, nothing to reconcile", id);
                    return Err(TaskExit::Skipped);
                }
                Ok(Some(tx)) => {
                    debug!("Order {} already {}", id, tx.status);
                    return Err(TaskExit::AlreadyFinal(tx.status));
                }
                Ok(None) => {
                    warn!("Order {} not found in the ledger", id);
                    return Err(TaskExit::Skipped);
                }
                Err(e) => {
                    error!("Failed to load order {}: {}", id, e);
                    if !self.pause(self.settings.retry_backoff).await {
                        return Err(self.cancelled());
                    }
                }
            }
        }
    }

    /// A status write touched no row: another task already finished the order.
    async fn superseded(&self) -> TaskExit {
        match self.store.get_transaction(&self.transaction_id).await {
            Ok(Some(tx)) if tx.status.is_terminal() => TaskExit::AlreadyFinal(tx.status),
            _ => TaskExit::Skipped,
        }
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn cancelled(&self) -> TaskExit {
        debug!("Reconciliation of order {} interrupted by shutdown", self.transaction_id);
        TaskExit::Cancelled
    }
}
