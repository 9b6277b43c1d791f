use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, FromRow, Row};
use std::fmt;
use std::str::FromStr;

use crate::error::{AppError, AppResult};

/// Scale applied to every amount written to the ledger
pub const MONEY_SCALE: u32 = 5;

pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Transaction status.
///
/// Debit transactions move NEW -> PROCESSING -> {PROCESSED, INVALID}.
/// Withdraw transactions keep NEW forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    New,
    Processing,
    Processed,
    Invalid,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::New => "NEW",
            TransactionStatus::Processing => "PROCESSING",
            TransactionStatus::Processed => "PROCESSED",
            TransactionStatus::Invalid => "INVALID",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Processed | TransactionStatus::Invalid)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(TransactionStatus::New),
            "PROCESSING" => Ok(TransactionStatus::Processing),
            "PROCESSED" => Ok(TransactionStatus::Processed),
            "INVALID" => Ok(TransactionStatus::Invalid),
            other => Err(AppError::Internal(format!("Unknown transaction status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionAction {
    Debit,
    Withdraw,
}

impl TransactionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionAction::Debit => "Debit",
            TransactionAction::Withdraw => "Withdraw",
        }
    }
}

impl fmt::Display for TransactionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionAction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Debit" => Ok(TransactionAction::Debit),
            "Withdraw" => Ok(TransactionAction::Withdraw),
            other => Err(AppError::Internal(format!("Unknown transaction action: {}", other))),
        }
    }
}

/// User entity. The password hash is opaque to the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub login: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub balance: Decimal,
}

/// Ledger entry, either a submitted order (Debit) or a withdrawal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub user_id: i64,
    pub summ: Decimal,
    pub date: DateTime<Utc>,
    pub status: TransactionStatus,
    pub action: TransactionAction,
}

impl Transaction {
    pub fn new_debit(id: impl Into<String>, user_id: i64) -> Self {
        Self {
            id: id.into(),
            user_id,
            summ: Decimal::ZERO,
            date: Utc::now(),
            status: TransactionStatus::New,
            action: TransactionAction::Debit,
        }
    }

    pub fn is_pending_debit(&self) -> bool {
        self.action == TransactionAction::Debit && !self.status.is_terminal()
    }

    /// Status and action live in TEXT columns, so they are decoded by hand
    pub fn from_row(row: &PgRow) -> AppResult<Self> {
        let status: String = row.try_get("status")?;
        let action: String = row.try_get("action")?;

        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            summ: row.try_get("summ")?,
            date: row.try_get("date")?,
            status: status.parse()?,
            action: action.parse()?,
        })
    }
}

/// Current balance plus the total ever withdrawn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSummary {
    pub current: Decimal,
    pub withdrawn: Decimal,
}

/// Result of submitting an order number
#[derive(Debug, Clone, PartialEq)]
pub enum OrderSubmission {
    /// A new Debit row was inserted and must be announced to the pipeline
    Accepted(Transaction),
    /// The same user already submitted this order; nothing was written
    AlreadySubmitted(Transaction),
}

impl OrderSubmission {
    pub fn transaction(&self) -> &Transaction {
        match self {
            OrderSubmission::Accepted(tx) | OrderSubmission::AlreadySubmitted(tx) => tx,
        }
    }
}

/// Result of the PROCESSED commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    Credited,
    /// The transaction was already terminal; the balance was not touched
    AlreadyFinal(TransactionStatus),
}
