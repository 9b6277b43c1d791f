// In-memory ledger used by the pipeline and handler tests.
//
// One mutex guards users and transactions together, so every operation is
// atomic the same way a single database transaction is.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use super::models::*;
use super::repository::{
    check_resubmission, ensure_interim_status, ensure_non_negative_accrual, ensure_positive_amount,
    LedgerStore,
};
use crate::error::{AppError, AppResult, LedgerError};

#[derive(Default)]
struct LedgerState {
    next_user_id: i64,
    users: HashMap<i64, User>,
    transactions: HashMap<String, Transaction>,
}

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    failing_writes: AtomicUsize,
    credit_calls: AtomicUsize,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, login: &str, balance: Decimal) -> i64 {
        let mut state = self.state.lock();
        state.next_user_id += 1;
        let id = state.next_user_id;
        state.users.insert(
            id,
            User {
                id,
                login: login.to_string(),
                password: String::new(),
                balance,
            },
        );
        id
    }

    pub fn insert_transaction(&self, tx: Transaction) {
        self.state.lock().transactions.insert(tx.id.clone(), tx);
    }

    pub fn user_balance(&self, user_id: i64) -> Option<Decimal> {
        self.state.lock().users.get(&user_id).map(|u| u.balance)
    }

    pub fn transaction(&self, id: &str) -> Option<Transaction> {
        self.state.lock().transactions.get(id).cloned()
    }

    pub fn transaction_count(&self) -> usize {
        self.state.lock().transactions.len()
    }

    /// Make the next `n` status writes fail with a store error
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Number of credit commits attempted, successful or not
    pub fn credit_calls(&self) -> usize {
        self.credit_calls.load(Ordering::SeqCst)
    }

    fn injected_failure(&self) -> AppResult<()> {
        let result = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match result {
            Ok(_) => Err(AppError::Database(sqlx::Error::PoolTimedOut)),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn add_order(&self, user_id: i64, order_id: &str) -> AppResult<OrderSubmission> {
        let mut state = self.state.lock();

        if let Some(existing) = state.transactions.get(order_id) {
            check_resubmission(existing, user_id)?;
            return Ok(OrderSubmission::AlreadySubmitted(existing.clone()));
        }

        if !state.users.contains_key(&user_id) {
            return Err(LedgerError::UserNotFound(user_id).into());
        }

        let tx = Transaction::new_debit(order_id, user_id);
        state.transactions.insert(tx.id.clone(), tx.clone());
        Ok(OrderSubmission::Accepted(tx))
    }

    async fn withdraw(&self, user_id: i64, order_id: &str, amount: Decimal) -> AppResult<Transaction> {
        let amount = ensure_positive_amount(amount)?;
        let mut state = self.state.lock();

        let balance = state
            .users
            .get(&user_id)
            .map(|u| u.balance)
            .ok_or(LedgerError::UserNotFound(user_id))?;

        if amount > balance {
            return Err(LedgerError::InsufficientFunds {
                required: amount.to_string(),
                available: balance.to_string(),
            }
            .into());
        }

        if state.transactions.contains_key(order_id) {
            return Err(LedgerError::DuplicateTransaction(order_id.to_string()).into());
        }

        let withdrawal = Transaction {
            id: order_id.to_string(),
            user_id,
            summ: amount,
            date: Utc::now(),
            status: TransactionStatus::New,
            action: TransactionAction::Withdraw,
        };
        state.transactions.insert(withdrawal.id.clone(), withdrawal.clone());
        if let Some(user) = state.users.get_mut(&user_id) {
            user.balance -= amount;
        }

        Ok(withdrawal)
    }

    async fn update_status(&self, transaction_id: &str, status: TransactionStatus) -> AppResult<bool> {
        ensure_interim_status(status)?;
        self.injected_failure()?;

        let mut state = self.state.lock();
        match state.transactions.get_mut(transaction_id) {
            Some(tx) if tx.action == TransactionAction::Debit && !tx.status.is_terminal() => {
                tx.status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_status_and_credit(&self, transaction_id: &str, accrual: Decimal) -> AppResult<CreditOutcome> {
        self.credit_calls.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;

        let accrual = ensure_non_negative_accrual(accrual)?;
        let mut state = self.state.lock();

        let (user_id, status) = state
            .transactions
            .get(transaction_id)
            .filter(|tx| tx.action == TransactionAction::Debit)
            .map(|tx| (tx.user_id, tx.status))
            .ok_or_else(|| AppError::NotFound(format!("Order not found: {}", transaction_id)))?;

        if status.is_terminal() {
            return Ok(CreditOutcome::AlreadyFinal(status));
        }

        let user = state
            .users
            .get_mut(&user_id)
            .ok_or(LedgerError::UserNotFound(user_id))?;
        user.balance += accrual;

        if let Some(tx) = state.transactions.get_mut(transaction_id) {
            tx.status = TransactionStatus::Processed;
            tx.summ = accrual;
        }

        Ok(CreditOutcome::Credited)
    }

    async fn list_pending_debits(&self) -> AppResult<Vec<Transaction>> {
        let state = self.state.lock();
        let mut pending: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|tx| tx.is_pending_debit())
            .cloned()
            .collect();
        pending.sort_by_key(|tx| tx.date);
        Ok(pending)
    }

    async fn get_transaction(&self, transaction_id: &str) -> AppResult<Option<Transaction>> {
        Ok(self.transaction(transaction_id))
    }

    async fn list_transactions(&self, user_id: i64, action: TransactionAction) -> AppResult<Vec<Transaction>> {
        let state = self.state.lock();
        let mut list: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|tx| tx.user_id == user_id && tx.action == action)
            .cloned()
            .collect();
        list.sort_by_key(|tx| tx.date);
        Ok(list)
    }

    async fn get_balance(&self, user_id: i64) -> AppResult<BalanceSummary> {
        let state = self.state.lock();
        let current = state
            .users
            .get(&user_id)
            .map(|u| u.balance)
            .ok_or(LedgerError::UserNotFound(user_id))?;
        let withdrawn = state
            .transactions
            .values()
            .filter(|tx| tx.user_id == user_id && tx.action == TransactionAction::Withdraw)
            .map(|tx| tx.summ)
            .sum();

        Ok(BalanceSummary { current, withdrawn })
    }

    async fn create_user(&self, login: &str, password_hash: &str) -> AppResult<User> {
        let mut state = self.state.lock();
        if state.users.values().any(|u| u.login == login) {
            return Err(LedgerError::LoginTaken(login.to_string()).into());
        }

        state.next_user_id += 1;
        let user = User {
            id: state.next_user_id,
            login: login.to_string(),
            password: password_hash.to_string(),
            balance: Decimal::ZERO,
        };
        state.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_user_by_login(&self, login: &str) -> AppResult<Option<User>> {
        let state = self.state.lock();
        Ok(state.users.values().find(|u| u.login == login).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_add_order_twice_by_same_user_is_idempotent() {
        let ledger = MemoryLedger::new();
        let user = ledger.insert_user("alice", Decimal::ZERO);

        let first = ledger.add_order(user, "12345678903").await.unwrap();
        assert!(matches!(first, OrderSubmission::Accepted(_)));

        let second = ledger.add_order(user, "12345678903").await.unwrap();
        assert!(matches!(second, OrderSubmission::AlreadySubmitted(_)));
        assert_eq!(second.transaction(), first.transaction());
        assert_eq!(ledger.transaction_count(), 1);
    }

    #[tokio::test]
    async fn test_add_order_owned_by_another_user_is_rejected() {
        let ledger = MemoryLedger::new();
        let alice = ledger.insert_user("alice", Decimal::ZERO);
        let bob = ledger.insert_user("bob", Decimal::ZERO);

        ledger.add_order(alice, "12345678903").await.unwrap();
        let err = ledger.add_order(bob, "12345678903").await.unwrap_err();

        assert!(matches!(err, AppError::Ledger(LedgerError::OrderOwnedByAnotherUser(_))));
        assert_eq!(ledger.transaction("12345678903").unwrap().user_id, alice);
    }

    #[tokio::test]
    async fn test_add_order_for_unknown_user_is_rejected() {
        let ledger = MemoryLedger::new();

        let err = ledger.add_order(999, "12345678903").await.unwrap_err();

        assert!(matches!(err, AppError::Ledger(LedgerError::UserNotFound(999))));
        assert_eq!(ledger.transaction_count(), 0);
    }

    #[tokio::test]
    async fn test_own_withdrawal_number_is_a_duplicate_not_a_conflict() {
        let ledger = MemoryLedger::new();
        let user = ledger.insert_user("alice", dec!(10));
        ledger.withdraw(user, "2377225624", dec!(1)).await.unwrap();

        let err = ledger.add_order(user, "2377225624").await.unwrap_err();

        assert!(matches!(err, AppError::Ledger(LedgerError::DuplicateTransaction(_))));
        assert_eq!(
            ledger.transaction("2377225624").unwrap().action,
            TransactionAction::Withdraw
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_withdrawals_never_overdraw() {
        let ledger = Arc::new(MemoryLedger::new());
        let user = ledger.insert_user("alice", dec!(100));

        let attempts = (0..5).map(|i| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.withdraw(user, &format!("w-{}", i), dec!(30)).await })
        });
        let results: Vec<AppResult<Transaction>> = join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        let insufficient = results
            .iter()
            .filter(|r| matches!(r, Err(AppError::Ledger(LedgerError::InsufficientFunds { .. }))))
            .count();

        assert_eq!(succeeded, 3);
        assert_eq!(insufficient, 2);
        assert_eq!(ledger.user_balance(user), Some(dec!(10)));
    }

    #[tokio::test]
    async fn test_credit_is_applied_once() {
        let ledger = MemoryLedger::new();
        let user = ledger.insert_user("alice", dec!(5));
        ledger.add_order(user, "12345678903").await.unwrap();

        let first = ledger.update_status_and_credit("12345678903", dec!(12.5)).await.unwrap();
        let second = ledger.update_status_and_credit("12345678903", dec!(12.5)).await.unwrap();

        assert_eq!(first, CreditOutcome::Credited);
        assert_eq!(second, CreditOutcome::AlreadyFinal(TransactionStatus::Processed));
        assert_eq!(ledger.user_balance(user), Some(dec!(17.5)));
    }

    #[tokio::test]
    async fn test_negative_accrual_is_never_credited() {
        let ledger = MemoryLedger::new();
        let user = ledger.insert_user("alice", dec!(1));
        ledger.add_order(user, "12345678903").await.unwrap();

        let err = ledger.update_status_and_credit("12345678903", dec!(-5)).await.unwrap_err();

        assert!(matches!(err, AppError::InvalidInput(_)));
        assert_eq!(ledger.user_balance(user), Some(dec!(1)));
        assert_eq!(ledger.transaction("12345678903").unwrap().status, TransactionStatus::New);
    }

    #[tokio::test]
    async fn test_registered_login_is_unique() {
        let ledger = MemoryLedger::new();

        let user = ledger.create_user("carol", "stored-hash").await.unwrap();
        assert_eq!(user.balance, Decimal::ZERO);

        let err = ledger.create_user("carol", "other-hash").await.unwrap_err();
        assert!(matches!(err, AppError::Ledger(LedgerError::LoginTaken(_))));

        let found = ledger.find_user_by_login("carol").await.unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert_eq!(found.password, "stored-hash");
        assert!(ledger.find_user_by_login("dave").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_never_leaves_a_terminal_state() {
        let ledger = MemoryLedger::new();
        let user = ledger.insert_user("alice", Decimal::ZERO);
        ledger.add_order(user, "12345678903").await.unwrap();

        assert!(ledger.update_status("12345678903", TransactionStatus::Invalid).await.unwrap());
        assert!(!ledger.update_status("12345678903", TransactionStatus::Processing).await.unwrap());

        let outcome = ledger.update_status_and_credit("12345678903", dec!(3)).await.unwrap();
        assert_eq!(outcome, CreditOutcome::AlreadyFinal(TransactionStatus::Invalid));
        assert_eq!(ledger.user_balance(user), Some(Decimal::ZERO));
    }

    #[tokio::test]
    async fn test_balance_reports_total_withdrawn() {
        let ledger = MemoryLedger::new();
        let user = ledger.insert_user("alice", dec!(50));

        ledger.withdraw(user, "2377225624", dec!(20)).await.unwrap();
        ledger.withdraw(user, "79927398713", dec!(5.5)).await.unwrap();

        let balance = ledger.get_balance(user).await.unwrap();
        assert_eq!(balance.current, dec!(24.5));
        assert_eq!(balance.withdrawn, dec!(25.5));
    }

    #[tokio::test]
    async fn test_pending_debits_include_processing_orders() {
        let ledger = MemoryLedger::new();
        let user = ledger.insert_user("alice", dec!(50));
        ledger.add_order(user, "1").await.unwrap();
        ledger.add_order(user, "2").await.unwrap();
        ledger.add_order(user, "3").await.unwrap();
        ledger.update_status("2", TransactionStatus::Processing).await.unwrap();
        ledger.update_status("3", TransactionStatus::Invalid).await.unwrap();
        ledger.withdraw(user, "4", dec!(1)).await.unwrap();

        let mut ids: Vec<String> = ledger
            .list_pending_debits()
            .await
            .unwrap()
            .into_iter()
            .map(|tx| tx.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["1".to_string(), "2".to_string()]);
    }
}
