use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AppResult, OracleError};

/// Order status as reported by the accrual system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccrualStatus {
    Registered,
    Invalid,
    Processing,
    Processed,
    #[serde(other)]
    Unknown,
}

/// Response body of `GET /api/orders/{number}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccrualResponse {
    pub order: String,
    pub status: AccrualStatus,
    /// Present only once the order is PROCESSED
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accrual: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OracleReply {
    /// 204: the accrual system has not registered the order yet
    NotRegistered,
    Status(AccrualResponse),
}

#[async_trait]
pub trait AccrualOracle: Send + Sync {
    async fn order_status(&self, order_id: &str) -> Result<OracleReply, OracleError>;
}

/// HTTP client for the accrual system
pub struct AccrualClient {
    client: Client,
    base_url: String,
}

impl AccrualClient {
    pub fn new(base_url: &str, timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(OracleError::from)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn order_url(&self, order_id: &str) -> String {
        format!("{}/api/orders/{}", self.base_url, order_id)
    }
}

#[async_trait]
impl AccrualOracle for AccrualClient {
    async fn order_status(&self, order_id: &str) -> Result<OracleReply, OracleError> {
        let url = self.order_url(order_id);
        let response = self.client.get(&url).send().await?;
        let status = response.status();

        debug!("Accrual system answered {} for order {}", status, order_id);

        match status {
            StatusCode::NO_CONTENT => Ok(OracleReply::NotRegistered),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok());
                Err(OracleError::RateLimited { retry_after })
            }
            s if s.is_success() => {
                let body: AccrualResponse = response.json().await?;
                Ok(OracleReply::Status(body))
            }
            s => Err(OracleError::UnexpectedStatus(s.as_u16())),
        }
    }
}
