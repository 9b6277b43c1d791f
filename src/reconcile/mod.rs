// Order reconciliation pipeline: new orders are announced through the
// notifier, the dispatcher spawns one task per order, each task polls the
// accrual system until the order is PROCESSED or INVALID.
pub mod dispatcher;
pub mod notifier;
pub mod task;

pub use dispatcher::ReconcileDispatcher;
pub use notifier::{NewOrderNotifier, NewOrderReceiver};
pub use task::ReconcileSettings;
