use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ledger::models::{Transaction, TransactionStatus};

/// Order as listed by `GET /api/user/orders`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub number: String,
    pub status: TransactionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accrual: Option<Decimal>,
    pub uploaded_at: DateTime<Utc>,
}

impl From<Transaction> for OrderResponse {
    fn from(tx: Transaction) -> Self {
        let accrual = (tx.status == TransactionStatus::Processed).then_some(tx.summ);
        Self {
            number: tx.id,
            status: tx.status,
            accrual,
            uploaded_at: tx.date,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub order: String,
    pub sum: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalResponse {
    pub order: String,
    pub sum: Decimal,
    pub processed_at: DateTime<Utc>,
}

impl From<Transaction> for WithdrawalResponse {
    fn from(tx: Transaction) -> Self {
        Self {
            order: tx.id,
            sum: tx.summ,
            processed_at: tx.date,
        }
    }
}

/// Body of `POST /api/user/register` and `POST /api/user/login`
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}
