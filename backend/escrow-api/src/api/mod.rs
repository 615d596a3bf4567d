//! Axum REST API: router assembly, shared state and cross-cutting layers.
//!
//! Every request carries an `x-request-id` (generated when the client does
//! not send one) that is recorded on the request span and echoed on the
//! response.

mod accounts;
mod extract;
mod money;
mod projects;
mod wallets;

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderName},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::info_span;

use self::extract::Json;
use crate::config::Config;
use crate::errors::Result;
use crate::events::EventSink;
use crate::telemetry::{self, Metrics};

const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub config: Config,
    pub sink: Arc<dyn EventSink>,
    pub metrics: Arc<Metrics>,
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct Listing<T> {
    pub count: usize,
    pub items: Vec<T>,
}

impl<T> From<Vec<T>> for Listing<T> {
    fn from(items: Vec<T>) -> Self {
        Self {
            count: items.len(),
            items,
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /metrics` in the Prometheus text exposition format.
pub async fn metrics(State(state): State<Arc<ApiState>>) -> Result<impl IntoResponse> {
    let body = state.metrics.encode()?;
    Ok(([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body))
}

pub fn router(state: Arc<ApiState>) -> Router {
    let metrics_layer =
        middleware::from_fn_with_state(state.metrics.clone(), telemetry::track_requests);

    let trace_layer = TraceLayer::new_for_http().make_span_with(|req: &Request| {
        let request_id = req
            .headers()
            .get(&REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        info_span!(
            "http_request",
            method = %req.method(),
            path = %req.uri().path(),
            request_id = %request_id,
        )
    });

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        // Accounts
        .route("/users", get(accounts::list_users).post(accounts::create_user))
        .route(
            "/users/:id",
            get(accounts::get_user)
                .patch(accounts::update_user)
                .delete(accounts::delete_user),
        )
        .route("/users/:id/kyc", get(accounts::user_kyc))
        .route("/kyc", post(accounts::submit_kyc))
        .route("/kyc/:id", get(accounts::get_kyc))
        .route("/kyc/:id/review", post(accounts::review_kyc))
        // Money movement
        .route("/users/:id/balances/:currency", get(money::user_balance))
        .route("/users/:id/ledger", get(money::user_ledger))
        .route("/users/:id/holds", get(money::user_holds))
        .route("/ledger/entries", post(money::post_entry))
        .route("/ledger/entries/:id", get(money::get_entry))
        .route("/ledger/entries/:id/reverse", post(money::reverse_entry))
        .route("/holds", post(money::create_hold))
        .route("/holds/:id", get(money::get_hold))
        .route("/holds/:id/release", post(money::release_hold))
        .route("/holds/:id/capture", post(money::capture_hold))
        .route(
            "/transactions",
            get(money::list_transactions).post(money::create_transaction),
        )
        .route(
            "/transactions/:id",
            get(money::get_transaction).patch(money::update_transaction),
        )
        .route("/transactions/:id/transition", post(money::transition_transaction))
        // Projects
        .route(
            "/projects",
            get(projects::list_projects).post(projects::create_project),
        )
        .route(
            "/projects/:id",
            get(projects::get_project)
                .patch(projects::update_project)
                .delete(projects::delete_project),
        )
        .route(
            "/projects/:id/milestones",
            get(projects::list_milestones).post(projects::create_milestone),
        )
        .route(
            "/milestones/:id",
            get(projects::get_milestone)
                .patch(projects::update_milestone)
                .delete(projects::delete_milestone),
        )
        .route("/milestones/:id/transition", post(projects::transition_milestone))
        .route("/milestones/:id/pay", post(projects::pay_milestone))
        // Wallets and reconciliation
        .route("/users/:id/wallets", get(wallets::user_wallets))
        .route(
            "/wallets",
            get(wallets::list_wallets).post(wallets::register_wallet),
        )
        .route(
            "/wallets/:id",
            get(wallets::get_wallet).delete(wallets::delete_wallet),
        )
        .route(
            "/wallets/:id/snapshots",
            get(wallets::list_snapshots).post(wallets::record_snapshot),
        )
        .route("/wallets/:id/reconcile", post(wallets::reconcile_wallet))
        .route("/drifts", get(wallets::list_drifts))
        .with_state(state)
        .layer(metrics_layer)
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::new(REQUEST_ID))
        .layer(SetRequestIdLayer::new(REQUEST_ID, MakeRequestUuid))
        .layer(CorsLayer::permissive())
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
