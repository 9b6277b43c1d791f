use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Accrual oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid login or password")]
    InvalidCredentials,

    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Domain errors raised by ledger operations and returned to the caller as-is
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: String, available: String },

    #[error("Order {0} was already submitted by another user")]
    OrderOwnedByAnotherUser(String),

    #[error("Transaction {0} already exists")]
    DuplicateTransaction(String),

    #[error("User not found: {0}")]
    UserNotFound(i64),

    #[error("Login {0} is already taken")]
    LoginTaken(String),
}

/// Accrual oracle errors. Every variant is transient for the reconciliation loop.
#[derive(Error, Debug)]
pub enum OracleError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to decode oracle response: {0}")]
    Decode(String),

    #[error("Unexpected oracle status: {0}")]
    UnexpectedStatus(u16),

    #[error("Oracle rate limit hit, retry after {retry_after:?}s")]
    RateLimited { retry_after: Option<u64> },
}

impl From<reqwest::Error> for OracleError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            OracleError::Decode(error.to_string())
        } else {
            OracleError::Transport(error.to_string())
        }
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Ledger(LedgerError::InsufficientFunds { .. }) => {
                (StatusCode::PAYMENT_REQUIRED, "INSUFFICIENT_FUNDS")
            }
            AppError::Ledger(LedgerError::OrderOwnedByAnotherUser(_)) => {
                (StatusCode::CONFLICT, "ORDER_OWNED_BY_ANOTHER_USER")
            }
            AppError::Ledger(LedgerError::DuplicateTransaction(_)) => {
                (StatusCode::CONFLICT, "DUPLICATE_TRANSACTION")
            }
            AppError::Ledger(LedgerError::LoginTaken(_)) => (StatusCode::CONFLICT, "LOGIN_TAKEN"),
            AppError::Ledger(LedgerError::UserNotFound(_)) | AppError::NotFound(_) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND")
            }
            AppError::InvalidInput(_) => (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_INPUT"),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            AppError::InvalidCredentials => (StatusCode::UNAUTHORIZED, "INVALID_CREDENTIALS"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code) = self.status_and_code();

        // Never leak driver or oracle details to clients
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Request failed: {}", self);
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
        });

        (status, body).into_response()
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
