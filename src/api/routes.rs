//! API route handlers.
//!
//! All endpoints speak JSON. The engine is shared via `Arc<TradeEngine>`;
//! its operations are synchronous and never wait on IO, so handlers call
//! straight into it.

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::engine::events::TradeEvent;
use crate::engine::TradeEngine;
use crate::types::{Identity, ListingMetadata, Trade, TradeError, TradeId, TradeState};

pub type AppState = Arc<TradeEngine>;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CreateListingRequest {
    pub seller: Identity,
    pub price: Decimal,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub image_ref: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepositRequest {
    pub caller: Identity,
    pub value: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallerRequest {
    pub caller: Identity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradesQuery {
    pub participant: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub after: u64,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ListingCreatedResponse {
    pub trade_id: TradeId,
}

/// A trade record together with what the engine knows around it.
#[derive(Debug, Clone, Serialize)]
pub struct TradeView {
    #[serde(flatten)]
    pub trade: Trade,
    /// Numeric state code (0..=5).
    pub state_code: u8,
    pub metadata: ListingMetadata,
    pub custody_balance: Decimal,
    /// When `refundTimeout` becomes callable, for `Active` trades.
    pub refund_available_at: Option<DateTime<Utc>>,
    pub archived: bool,
    pub halted: bool,
}

impl TradeView {
    pub fn build(engine: &TradeEngine, trade: Trade) -> Self {
        let refund_available_at = match (trade.state, trade.activation_time) {
            (TradeState::Active, Some(at)) => {
                Some(at + Duration::seconds(engine.activation_window_secs()))
            }
            _ => None,
        };
        Self {
            state_code: trade.state.code(),
            metadata: engine.metadata(trade.id).unwrap_or_default(),
            custody_balance: engine.custody_balance(trade.id),
            refund_available_at,
            archived: engine.is_archived(trade.id),
            halted: engine.is_halted(trade.id),
            trade,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ApiError {
    Trade(TradeError),
    BadRequest(String),
}

impl From<TradeError> for ApiError {
    fn from(e: TradeError) -> Self {
        ApiError::Trade(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// HTTP status for a domain error.
pub fn status_for(error: &TradeError) -> StatusCode {
    match error {
        TradeError::NotFound(_) => StatusCode::NOT_FOUND,
        TradeError::Unauthorized { .. } => StatusCode::FORBIDDEN,
        TradeError::InvalidAmount { .. } | TradeError::InvalidPrice(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        TradeError::InvalidState { .. }
        | TradeError::TimeoutNotElapsed { .. }
        | TradeError::StaleCommit { .. } => StatusCode::CONFLICT,
        TradeError::InvariantViolation { .. } | TradeError::Halted(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Trade(e) => (
                status_for(&e),
                ErrorBody {
                    error: e.code(),
                    message: e.to_string(),
                },
            ),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: "BAD_REQUEST",
                    message,
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// POST /api/listings
pub async fn create_listing(
    State(engine): State<AppState>,
    body: Result<Json<CreateListingRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ListingCreatedResponse>), ApiError> {
    let Json(req) = body?;
    let metadata = ListingMetadata {
        title: req.title,
        description: req.description,
        category: req.category,
        image_ref: req.image_ref,
    };
    let trade_id = engine.create_listing(req.seller, req.price, metadata)?;
    Ok((StatusCode::CREATED, Json(ListingCreatedResponse { trade_id })))
}

/// GET /api/trades?participant=
pub async fn list_trades(
    State(engine): State<AppState>,
    query: Result<Query<TradesQuery>, QueryRejection>,
) -> ApiResult<Vec<TradeView>> {
    let Query(query) = query?;
    let trades = match query.participant {
        Some(who) => engine.trades_for(&Identity::new(who)),
        None => engine.all_trades(),
    };
    Ok(Json(
        trades
            .into_iter()
            .map(|t| TradeView::build(&engine, t))
            .collect(),
    ))
}

/// GET /api/trades/:id
pub async fn get_trade(
    State(engine): State<AppState>,
    path: Result<Path<u64>, PathRejection>,
) -> ApiResult<TradeView> {
    let Path(id) = path?;
    let trade = engine.trade(TradeId(id))?;
    Ok(Json(TradeView::build(&engine, trade)))
}

/// POST /api/trades/:id/buyer-deposit
pub async fn buyer_deposit(
    State(engine): State<AppState>,
    path: Result<Path<u64>, PathRejection>,
    body: Result<Json<DepositRequest>, JsonRejection>,
) -> ApiResult<TradeView> {
    let Path(id) = path?;
    let Json(req) = body?;
    let trade = engine.buyer_deposit(TradeId(id), req.caller, req.value)?;
    Ok(Json(TradeView::build(&engine, trade)))
}

/// POST /api/trades/:id/seller-deposit
pub async fn seller_deposit(
    State(engine): State<AppState>,
    path: Result<Path<u64>, PathRejection>,
    body: Result<Json<DepositRequest>, JsonRejection>,
) -> ApiResult<TradeView> {
    let Path(id) = path?;
    let Json(req) = body?;
    let trade = engine.seller_deposit(TradeId(id), req.caller, req.value)?;
    Ok(Json(TradeView::build(&engine, trade)))
}

/// POST /api/trades/:id/release
pub async fn mark_item_released(
    State(engine): State<AppState>,
    path: Result<Path<u64>, PathRejection>,
    body: Result<Json<CallerRequest>, JsonRejection>,
) -> ApiResult<TradeView> {
    let Path(id) = path?;
    let Json(req) = body?;
    let trade = engine.mark_item_released(TradeId(id), req.caller)?;
    Ok(Json(TradeView::build(&engine, trade)))
}

/// POST /api/trades/:id/confirm
pub async fn confirm_delivery(
    State(engine): State<AppState>,
    path: Result<Path<u64>, PathRejection>,
    body: Result<Json<CallerRequest>, JsonRejection>,
) -> ApiResult<TradeView> {
    let Path(id) = path?;
    let Json(req) = body?;
    let trade = engine.confirm_delivery(TradeId(id), req.caller)?;
    Ok(Json(TradeView::build(&engine, trade)))
}

/// POST /api/trades/:id/refund-timeout
pub async fn refund_timeout(
    State(engine): State<AppState>,
    path: Result<Path<u64>, PathRejection>,
    body: Result<Json<CallerRequest>, JsonRejection>,
) -> ApiResult<TradeView> {
    let Path(id) = path?;
    let Json(req) = body?;
    let trade = engine.refund_timeout(TradeId(id), req.caller)?;
    Ok(Json(TradeView::build(&engine, trade)))
}

/// POST /api/trades/:id/emergency-withdraw
pub async fn emergency_withdraw(
    State(engine): State<AppState>,
    path: Result<Path<u64>, PathRejection>,
    body: Result<Json<CallerRequest>, JsonRejection>,
) -> ApiResult<TradeView> {
    let Path(id) = path?;
    let Json(req) = body?;
    let trade = engine.emergency_withdraw_buyer(TradeId(id), req.caller)?;
    Ok(Json(TradeView::build(&engine, trade)))
}

/// POST /api/trades/:id/archive
pub async fn archive(
    State(engine): State<AppState>,
    path: Result<Path<u64>, PathRejection>,
) -> ApiResult<TradeView> {
    let Path(id) = path?;
    let trade = engine.archive(TradeId(id))?;
    Ok(Json(TradeView::build(&engine, trade)))
}

/// GET /api/events?after=
pub async fn get_events(
    State(engine): State<AppState>,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> ApiResult<Vec<TradeEvent>> {
    let Query(query) = query?;
    Ok(Json(engine.events_since(query.after)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
