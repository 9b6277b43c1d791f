use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequestParts, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::auth::AuthKeys;
use super::models::*;
use super::validation::is_valid_order_number;
use crate::{
    error::{AppError, AppResult},
    ledger::{
        models::{BalanceSummary, OrderSubmission, TransactionAction},
        LedgerStore,
    },
    reconcile::NewOrderNotifier,
};

const BEARER_PREFIX: &str = "Bearer ";

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn LedgerStore>,
    pub notifier: NewOrderNotifier,
    pub auth: AuthKeys,
}

/// User id taken from a valid `Authorization: Bearer` session token
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub i64);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix(BEARER_PREFIX))
            .and_then(|token| state.auth.verify_token(token.trim()))
            .map(AuthUser)
            .ok_or(AppError::Unauthorized)
    }
}

type SessionResponse = (StatusCode, [(header::HeaderName, String); 1]);

fn session(auth: &AuthKeys, user_id: i64) -> SessionResponse {
    let token = auth.issue_token(user_id);
    (
        StatusCode::OK,
        [(header::AUTHORIZATION, format!("{}{}", BEARER_PREFIX, token))],
    )
}

fn read_credentials(body: Result<Json<Credentials>, JsonRejection>) -> AppResult<Credentials> {
    let Json(credentials) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;
    if credentials.login.trim().is_empty() || credentials.password.is_empty() {
        return Err(AppError::BadRequest("login and password are required".to_string()));
    }
    Ok(credentials)
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Create an account and open a session
/// POST /api/user/register
pub async fn register(
    State(state): State<AppState>,
    body: Result<Json<Credentials>, JsonRejection>,
) -> AppResult<SessionResponse> {
    let credentials = read_credentials(body)?;
    let login = credentials.login.trim();

    let password_hash = state.auth.hash_password(&credentials.password).await?;
    let user = state.ledger.create_user(login, &password_hash).await?;

    Ok(session(&state.auth, user.id))
}

/// POST /api/user/login
pub async fn login(
    State(state): State<AppState>,
    body: Result<Json<Credentials>, JsonRejection>,
) -> AppResult<SessionResponse> {
    let credentials = read_credentials(body)?;
    let login = credentials.login.trim();

    let Some(user) = state.ledger.find_user_by_login(login).await? else {
        warn!("Login attempt for unknown user {}", login);
        return Err(AppError::InvalidCredentials);
    };

    if !state.auth.verify_password(&credentials.password, &user.password).await? {
        warn!("Wrong password for user {}", login);
        return Err(AppError::InvalidCredentials);
    }

    info!("🔑 User {} logged in", user.id);
    Ok(session(&state.auth, user.id))
}

/// Submit an order number for accrual
/// POST /api/user/orders
///
/// 202 for a new order, 200 if this user already submitted it.
pub async fn submit_order(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    body: String,
) -> AppResult<(StatusCode, String)> {
    let number = body.trim().to_string();
    if !is_valid_order_number(&number) {
        return Err(AppError::InvalidInput(format!("Invalid order number: {}", number)));
    }

    let submission = state.ledger.add_order(user_id, &number).await?;
    let order = submission.transaction();

    match &submission {
        OrderSubmission::Accepted(_) => {
            info!("📥 Order {} accepted for user {}", order.id, user_id);
            state.notifier.publish(&order.id);
            Ok((StatusCode::ACCEPTED, number))
        }
        OrderSubmission::AlreadySubmitted(_) => {
            debug!("Order {} already submitted by user {} ({})", order.id, user_id, order.status);
            Ok((StatusCode::OK, number))
        }
    }
}

/// GET /api/user/orders
pub async fn list_orders(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> AppResult<Response> {
    let orders = state
        .ledger
        .list_transactions(user_id, TransactionAction::Debit)
        .await?;

    if orders.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let body: Vec<OrderResponse> = orders.into_iter().map(OrderResponse::from).collect();
    Ok(Json(body).into_response())
}

/// GET /api/user/balance
pub async fn get_balance(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> AppResult<Json<BalanceSummary>> {
    let balance = state.ledger.get_balance(user_id).await?;
    Ok(Json(balance))
}

/// Spend points against a new order
/// POST /api/user/balance/withdraw
pub async fn withdraw(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<WithdrawRequest>,
) -> AppResult<StatusCode> {
    if !is_valid_order_number(&request.order) {
        return Err(AppError::InvalidInput(format!("Invalid order number: {}", request.order)));
    }

    state.ledger.withdraw(user_id, &request.order, request.sum).await?;
    Ok(StatusCode::OK)
}

/// GET /api/user/withdrawals
pub async fn list_withdrawals(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> AppResult<Response> {
    let withdrawals = state
        .ledger
        .list_transactions(user_id, TransactionAction::Withdraw)
        .await?;

    if withdrawals.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let body: Vec<WithdrawalResponse> = withdrawals.into_iter().map(WithdrawalResponse::from).collect();
    Ok(Json(body).into_response())
}
