use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Receiving half, drained by the dispatcher
pub type NewOrderReceiver = mpsc::UnboundedReceiver<String>;

/// Announces freshly inserted Debit orders to the reconciliation pipeline.
///
/// Publishing never blocks and never fails the caller: the queue is
/// unbounded, and a missing consumer only costs a log line because the next
/// start-up sweep rediscovers the order anyway.
#[derive(Clone)]
pub struct NewOrderNotifier {
    sender: mpsc::UnboundedSender<String>,
}

impl NewOrderNotifier {
    pub fn channel() -> (Self, NewOrderReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn publish(&self, order_id: &str) {
        match self.sender.send(order_id.to_string()) {
            Ok(()) => debug!("📨 Order {} queued for reconciliation", order_id),
            Err(_) => warn!(
                "Reconciliation pipeline is gone, order {} waits for the next start-up sweep",
                order_id
            ),
        }
    }
}
