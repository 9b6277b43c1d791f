use super::models::*;
use crate::error::{AppError, AppResult, LedgerError};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Row, Transaction as DbTransaction};
use tracing::{debug, info, warn};

const TRANSACTION_COLUMNS: &str = "id, user_id, summ, date, status, action";

/// Atomic ledger operations shared by the ingestion handlers and the
/// reconciliation pipeline.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a Debit/NEW order, or return the existing one if `user_id` owns it.
    async fn add_order(&self, user_id: i64, order_id: &str) -> AppResult<OrderSubmission>;

    /// Debit the balance and record a terminal Withdraw entry in one transaction.
    async fn withdraw(&self, user_id: i64, order_id: &str, amount: Decimal) -> AppResult<Transaction>;

    /// Interim status write (PROCESSING or INVALID). Terminal rows are left
    /// untouched; returns whether a row changed.
    async fn update_status(&self, transaction_id: &str, status: TransactionStatus) -> AppResult<bool>;

    /// Mark PROCESSED, write the accrual and credit the owner atomically.
    async fn update_status_and_credit(&self, transaction_id: &str, accrual: Decimal) -> AppResult<CreditOutcome>;

    /// Every non-terminal Debit transaction, oldest first.
    async fn list_pending_debits(&self) -> AppResult<Vec<Transaction>>;

    async fn get_transaction(&self, transaction_id: &str) -> AppResult<Option<Transaction>>;

    async fn list_transactions(&self, user_id: i64, action: TransactionAction) -> AppResult<Vec<Transaction>>;

    async fn get_balance(&self, user_id: i64) -> AppResult<BalanceSummary>;

    /// Register a user with zero balance. `password_hash` is stored as given.
    async fn create_user(&self, login: &str, password_hash: &str) -> AppResult<User>;

    async fn find_user_by_login(&self, login: &str) -> AppResult<Option<User>>;
}

/// Only the interim transitions may go through the plain status write;
/// PROCESSED must always travel with its credit.
pub(crate) fn ensure_interim_status(status: TransactionStatus) -> AppResult<()> {
    match status {
        TransactionStatus::Processing | TransactionStatus::Invalid => Ok(()),
        other => Err(AppError::Internal(format!(
            "Status {} cannot be written without a credit",
            other
        ))),
    }
}

/// The oracle never owes a negative accrual; crediting one could drive a
/// balance below zero.
pub(crate) fn ensure_non_negative_accrual(accrual: Decimal) -> AppResult<Decimal> {
    let accrual = round_money(accrual);
    if accrual < Decimal::ZERO {
        return Err(AppError::InvalidInput(format!("Accrual must not be negative: {}", accrual)));
    }
    Ok(accrual)
}

/// A resubmitted number is only idempotent for the same user's own order.
pub(crate) fn check_resubmission(existing: &Transaction, user_id: i64) -> AppResult<()> {
    if existing.user_id != user_id {
        return Err(LedgerError::OrderOwnedByAnotherUser(existing.id.clone()).into());
    }
    if existing.action != TransactionAction::Debit {
        return Err(LedgerError::DuplicateTransaction(existing.id.clone()).into());
    }
    Ok(())
}

pub(crate) fn ensure_positive_amount(amount: Decimal) -> AppResult<Decimal> {
    let amount = round_money(amount);
    if amount <= Decimal::ZERO {
        return Err(AppError::InvalidInput(format!("Amount must be positive: {}", amount)));
    }
    Ok(amount)
}

/// Ledger repository - THE source of truth for all state
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_tx(&self) -> AppResult<DbTransaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    async fn find_transaction<'e, E>(executor: E, transaction_id: &str) -> AppResult<Option<Transaction>>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let sql = format!("SELECT {} FROM transactions WHERE id = $1", TRANSACTION_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(transaction_id)
            .fetch_optional(executor)
            .await?;

        row.as_ref().map(Transaction::from_row).transpose()
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_foreign_key_violation())
}

const USER_COLUMNS: &str = "id, login, password, balance";

#[async_trait]
impl LedgerStore for LedgerRepository {
    async fn add_order(&self, user_id: i64, order_id: &str) -> AppResult<OrderSubmission> {
        // The primary key arbitrates concurrent submissions of the same number
        let sql = format!(
            r#"
            INSERT INTO transactions (id, user_id, summ, date, status, action)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        );
        let draft = Transaction::new_debit(order_id, user_id);
        let inserted = sqlx::query(&sql)
            .bind(&draft.id)
            .bind(draft.user_id)
            .bind(draft.summ)
            .bind(draft.date)
            .bind(draft.status.as_str())
            .bind(draft.action.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                if is_foreign_key_violation(&e) {
                    AppError::from(LedgerError::UserNotFound(user_id))
                } else {
                    AppError::from(e)
                }
            })?;

        if let Some(row) = inserted {
            let tx = Transaction::from_row(&row)?;
            debug!("Order {} added for user {}", tx.id, user_id);
            return Ok(OrderSubmission::Accepted(tx));
        }

        let existing = Self::find_transaction(&self.pool, order_id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("Order {} vanished after conflict", order_id)))?;

        if let Err(e) = check_resubmission(&existing, user_id) {
            warn!("Order {} rejected for user {}: {}", order_id, user_id, e);
            return Err(e);
        }

        Ok(OrderSubmission::AlreadySubmitted(existing))
    }

    async fn withdraw(&self, user_id: i64, order_id: &str, amount: Decimal) -> AppResult<Transaction> {
        let amount = ensure_positive_amount(amount)?;
        let mut tx = self.begin_tx().await?;

        // Lock the user row so a concurrent credit or withdrawal waits for us
        let sql = format!(r#"SELECT {} FROM "user" WHERE id = $1 FOR UPDATE"#, USER_COLUMNS);
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(LedgerError::UserNotFound(user_id))?;

        if amount > user.balance {
            warn!("Insufficient funds for {}: {} > {}", user.login, amount, user.balance);
            return Err(LedgerError::InsufficientFunds {
                required: amount.to_string(),
                available: user.balance.to_string(),
            }
            .into());
        }

        sqlx::query(r#"UPDATE "user" SET balance = balance - $1 WHERE id = $2"#)
            .bind(amount)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        let sql = format!(
            r#"
            INSERT INTO transactions (id, user_id, summ, date, status, action)
            VALUES ($1, $2, $3, NOW(), $4, $5)
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(order_id)
            .bind(user_id)
            .bind(amount)
            .bind(TransactionStatus::New.as_str())
            .bind(TransactionAction::Withdraw.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AppError::from(LedgerError::DuplicateTransaction(order_id.to_string()))
                } else {
                    AppError::from(e)
                }
            })?;
        let withdrawal = Transaction::from_row(&row)?;

        tx.commit().await?;

        info!("💸 User {} withdrew {} against order {}", user_id, amount, order_id);
        Ok(withdrawal)
    }

    async fn update_status(&self, transaction_id: &str, status: TransactionStatus) -> AppResult<bool> {
        ensure_interim_status(status)?;

        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET status = $1
            WHERE id = $2 AND action = $3 AND status NOT IN ($4, $5)
            "#,
        )
        .bind(status.as_str())
        .bind(transaction_id)
        .bind(TransactionAction::Debit.as_str())
        .bind(TransactionStatus::Processed.as_str())
        .bind(TransactionStatus::Invalid.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_status_and_credit(&self, transaction_id: &str, accrual: Decimal) -> AppResult<CreditOutcome> {
        let accrual = ensure_non_negative_accrual(accrual)?;
        let mut tx = self.begin_tx().await?;

        // Row lock on the order serialises duplicate tasks for the same id
        let row = sqlx::query(
            r#"
            SELECT user_id, status
            FROM transactions
            WHERE id = $1 AND action = $2
            FOR UPDATE
            "#,
        )
        .bind(transaction_id)
        .bind(TransactionAction::Debit.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Order not found: {}", transaction_id)))?;

        let user_id: i64 = row.try_get("user_id")?;
        let status: TransactionStatus = row.try_get::<String, _>("status")?.parse()?;

        if status.is_terminal() {
            debug!("Order {} already {}, skipping credit", transaction_id, status);
            return Ok(CreditOutcome::AlreadyFinal(status));
        }

        sqlx::query("UPDATE transactions SET status = $1, summ = $2 WHERE id = $3")
            .bind(TransactionStatus::Processed.as_str())
            .bind(accrual)
            .bind(transaction_id)
            .execute(&mut *tx)
            .await?;

        let credited = sqlx::query(r#"UPDATE "user" SET balance = balance + $1 WHERE id = $2"#)
            .bind(accrual)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        if credited.rows_affected() == 0 {
            return Err(LedgerError::UserNotFound(user_id).into());
        }

        tx.commit().await?;

        info!("💰 Credited {} to user {} for order {}", accrual, user_id, transaction_id);
        Ok(CreditOutcome::Credited)
    }

    async fn list_pending_debits(&self) -> AppResult<Vec<Transaction>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM transactions
            WHERE action = $1 AND status IN ($2, $3)
            ORDER BY date
            "#,
            TRANSACTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(TransactionAction::Debit.as_str())
            .bind(TransactionStatus::New.as_str())
            .bind(TransactionStatus::Processing.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Transaction::from_row).collect()
    }

    async fn get_transaction(&self, transaction_id: &str) -> AppResult<Option<Transaction>> {
        Self::find_transaction(&self.pool, transaction_id).await
    }

    async fn list_transactions(&self, user_id: i64, action: TransactionAction) -> AppResult<Vec<Transaction>> {
        let sql = format!(
            "SELECT {} FROM transactions WHERE user_id = $1 AND action = $2 ORDER BY date",
            TRANSACTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(action.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Transaction::from_row).collect()
    }

    async fn get_balance(&self, user_id: i64) -> AppResult<BalanceSummary> {
        let row = sqlx::query(
            r#"
            SELECT
                u.balance AS current,
                COALESCE(SUM(t.summ) FILTER (WHERE t.action = $2), 0) AS withdrawn
            FROM "user" u
            LEFT JOIN transactions t ON t.user_id = u.id
            WHERE u.id = $1
            GROUP BY u.balance
            "#,
        )
        .bind(user_id)
        .bind(TransactionAction::Withdraw.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(LedgerError::UserNotFound(user_id))?;

        Ok(BalanceSummary {
            current: row.try_get("current")?,
            withdrawn: row.try_get("withdrawn")?,
        })
    }

    async fn create_user(&self, login: &str, password_hash: &str) -> AppResult<User> {
        let sql = format!(
            r#"INSERT INTO "user" (login, password, balance) VALUES ($1, $2, 0) RETURNING {}"#,
            USER_COLUMNS
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(login)
            .bind(password_hash)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AppError::from(LedgerError::LoginTaken(login.to_string()))
                } else {
                    AppError::from(e)
                }
            })?;

        info!("👤 Registered user {} ({})", user.login, user.id);
        Ok(user)
    }

    async fn find_user_by_login(&self, login: &str) -> AppResult<Option<User>> {
        let sql = format!(r#"SELECT {} FROM "user" WHERE login = $1"#, USER_COLUMNS);
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(login)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }
}
