//! Wallet registry, balance snapshot and reconciliation endpoints.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode};
use serde::{Deserialize, Serialize};

use super::extract::{Json, Path, Query};
use super::{ApiState, Listing};
use crate::errors::Result;
use crate::reconciler::{self, Drift};
use crate::users;
use crate::wallets::{self, BalanceSnapshot, NewSnapshot, NewWallet, Wallet};

#[derive(Debug, Deserialize)]
pub struct DriftQuery {
    pub wallet_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    pub wallet_id: i64,
    pub in_tolerance: bool,
    pub drift: Option<Drift>,
}

/// `POST /wallets`
pub async fn register_wallet(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<NewWallet>,
) -> Result<(StatusCode, Json<Wallet>)> {
    let wallet = wallets::register(&state.pool, req).await?;
    Ok((StatusCode::CREATED, Json(wallet)))
}

/// `GET /wallets`
pub async fn list_wallets(State(state): State<Arc<ApiState>>) -> Result<Json<Listing<Wallet>>> {
    Ok(Json(wallets::list_all(&state.pool).await?.into()))
}

/// `GET /users/:id/wallets`
pub async fn user_wallets(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<i64>,
) -> Result<Json<Listing<Wallet>>> {
    users::get(&state.pool, user_id).await?;
    Ok(Json(wallets::list_for_user(&state.pool, user_id).await?.into()))
}

/// `GET /wallets/:id`
pub async fn get_wallet(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<Wallet>> {
    Ok(Json(wallets::get(&state.pool, id).await?))
}

/// `DELETE /wallets/:id`
pub async fn delete_wallet(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    wallets::delete(&state.pool, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /wallets/:id/snapshots`
pub async fn list_snapshots(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<Listing<BalanceSnapshot>>> {
    wallets::get(&state.pool, id).await?;
    Ok(Json(wallets::snapshots(&state.pool, id).await?.into()))
}

/// `POST /wallets/:id/snapshots`
///
/// Replays of the same `idempotency_key` answer with the stored snapshot.
pub async fn record_snapshot(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(req): Json<NewSnapshot>,
) -> Result<Json<BalanceSnapshot>> {
    Ok(Json(wallets::record_snapshot(&state.pool, id, req).await?))
}

/// `POST /wallets/:id/reconcile`
pub async fn reconcile_wallet(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<ReconcileResponse>> {
    let drift = reconciler::reconcile(
        &state.pool,
        state.sink.as_ref(),
        id,
        state.config.reconcile_tolerance,
    )
    .await?;
    Ok(Json(ReconcileResponse {
        wallet_id: id,
        in_tolerance: drift.is_none(),
        drift,
    }))
}

/// `GET /drifts?wallet_id=`
pub async fn list_drifts(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<DriftQuery>,
) -> Result<Json<Listing<Drift>>> {
    Ok(Json(reconciler::drifts(&state.pool, query.wallet_id).await?.into()))
}
