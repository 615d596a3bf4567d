//! Ledger, hold and transaction endpoints.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::extract::{Json, Path, Query};
use super::{ApiState, Listing};
use crate::errors::Result;
use crate::holds::{self, Capture, Hold, HoldStatus, NewHold};
use crate::ledger::{self, LedgerEntry, PostEntry};
use crate::transactions::{
    self, NewTransaction, Transaction, TransactionFilter, TransactionStatus, TransactionUpdate,
};
use crate::types::normalize_currency;
use crate::users;

#[derive(Debug, Deserialize)]
pub struct BalanceQuery {
    /// Epoch millis; when set, the historical ledger balance is returned.
    pub as_of: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct HistoricalBalance {
    pub user_id: i64,
    pub currency: String,
    pub as_of: i64,
    pub balance: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct LedgerQuery {
    pub currency: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HoldQuery {
    pub status: Option<HoldStatus>,
}

#[derive(Debug, Deserialize)]
pub struct ReverseRequest {
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub status: TransactionStatus,
}

// ─────────────────────────────────────────────────────────
// Balances and ledger
// ─────────────────────────────────────────────────────────

/// `GET /users/:id/balances/:currency`
pub async fn user_balance(
    State(state): State<Arc<ApiState>>,
    Path((user_id, currency)): Path<(i64, String)>,
    Query(query): Query<BalanceQuery>,
) -> Result<Response> {
    users::get(&state.pool, user_id).await?;
    match query.as_of {
        Some(at) => {
            let balance = ledger::balance_as_of(&state.pool, user_id, &currency, at).await?;
            Ok(Json(HistoricalBalance {
                user_id,
                currency: normalize_currency(&currency)?,
                as_of: at,
                balance,
            })
            .into_response())
        }
        None => {
            let summary = holds::available_balance(&state.pool, user_id, &currency).await?;
            Ok(Json(summary).into_response())
        }
    }
}

/// `GET /users/:id/ledger`
pub async fn user_ledger(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<i64>,
    Query(query): Query<LedgerQuery>,
) -> Result<Json<Listing<LedgerEntry>>> {
    users::get(&state.pool, user_id).await?;
    let entries = ledger::entries(&state.pool, user_id, query.currency.as_deref()).await?;
    Ok(Json(entries.into()))
}

/// `POST /ledger/entries`
pub async fn post_entry(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<PostEntry>,
) -> Result<(StatusCode, Json<LedgerEntry>)> {
    let entry = ledger::post(&state.pool, req).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

/// `GET /ledger/entries/:id`
pub async fn get_entry(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<LedgerEntry>> {
    Ok(Json(ledger::get(&state.pool, id).await?))
}

/// `POST /ledger/entries/:id/reverse`
pub async fn reverse_entry(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    body: Option<Json<ReverseRequest>>,
) -> Result<(StatusCode, Json<LedgerEntry>)> {
    let description = body.and_then(|Json(req)| req.description);
    let entry = ledger::reverse(&state.pool, id, description).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

// ─────────────────────────────────────────────────────────
// Holds
// ─────────────────────────────────────────────────────────

/// `GET /users/:id/holds`
pub async fn user_holds(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<i64>,
    Query(query): Query<HoldQuery>,
) -> Result<Json<Listing<Hold>>> {
    users::get(&state.pool, user_id).await?;
    let rows = holds::list_for_user(&state.pool, user_id, query.status).await?;
    Ok(Json(rows.into()))
}

/// `POST /holds`
pub async fn create_hold(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<NewHold>,
) -> Result<(StatusCode, Json<Hold>)> {
    let hold = holds::create_hold(&state.pool, state.sink.as_ref(), req).await?;
    Ok((StatusCode::CREATED, Json(hold)))
}

/// `GET /holds/:id`
pub async fn get_hold(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<Hold>> {
    Ok(Json(holds::get(&state.pool, id).await?))
}

/// `POST /holds/:id/release`
pub async fn release_hold(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<Hold>> {
    Ok(Json(holds::release(&state.pool, state.sink.as_ref(), id).await?))
}

/// `POST /holds/:id/capture`
pub async fn capture_hold(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<Capture>> {
    Ok(Json(holds::capture(&state.pool, state.sink.as_ref(), id).await?))
}

// ─────────────────────────────────────────────────────────
// Transactions
// ─────────────────────────────────────────────────────────

/// `POST /transactions`
pub async fn create_transaction(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<NewTransaction>,
) -> Result<(StatusCode, Json<Transaction>)> {
    let created = transactions::create(&state.pool, req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// `GET /transactions?user_id=&status=`
pub async fn list_transactions(
    State(state): State<Arc<ApiState>>,
    Query(filter): Query<TransactionFilter>,
) -> Result<Json<Listing<Transaction>>> {
    Ok(Json(transactions::list(&state.pool, &filter).await?.into()))
}

/// `GET /transactions/:id`
pub async fn get_transaction(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<Transaction>> {
    Ok(Json(transactions::get(&state.pool, id).await?))
}

/// `PATCH /transactions/:id`
pub async fn update_transaction(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(patch): Json<TransactionUpdate>,
) -> Result<Json<Transaction>> {
    Ok(Json(transactions::update(&state.pool, id, patch).await?))
}

/// `POST /transactions/:id/transition`
pub async fn transition_transaction(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(req): Json<TransitionRequest>,
) -> Result<Json<Transaction>> {
    let updated =
        transactions::transition(&state.pool, state.sink.as_ref(), id, req.status).await?;
    Ok(Json(updated))
}
