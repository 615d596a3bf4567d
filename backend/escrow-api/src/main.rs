//! Escrow API entry point.
//!
//! Serves the escrow REST API (accounts, ledger, holds, transactions,
//! projects, wallets) over SQLite, and runs a background sweeper that
//! reconciles provider-reported wallet balances against the ledger.

mod api;
mod config;
mod db;
mod errors;
mod events;
mod holds;
mod kyc;
mod ledger;
mod milestones;
mod projects;
mod provider;
mod reconciler;
mod sweeper;
mod telemetry;
mod transactions;
mod types;
mod users;
mod wallets;

use std::sync::Arc;

use reqwest::Client;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use events::{EventSink, LogSink};
use provider::ProviderClient;
use sweeper::SweeperState;
use telemetry::Metrics;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config).await?;

    let metrics = Arc::new(Metrics::new()?);
    let sink: Arc<dyn EventSink> = Arc::new(LogSink::new(metrics.clone()));

    // ─── Background sweeper ───────────────────────────────
    if config.reconcile_interval_secs > 0 {
        let provider = match &config.provider_balance_url {
            Some(url) => {
                let client = Client::builder()
                    .timeout(std::time::Duration::from_secs(30))
                    .build()?;
                Some(ProviderClient::new(client, url.clone(), config.provider_max_attempts))
            }
            None => None,
        };
        let sweeper_state = Arc::new(SweeperState {
            pool: pool.clone(),
            config: config.clone(),
            provider,
            sink: sink.clone(),
            metrics: metrics.clone(),
        });
        tokio::spawn(sweeper::run(sweeper_state));
    } else {
        info!("Reconciliation sweeper disabled (RECONCILE_INTERVAL_SECS=0)");
    }

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState {
        pool,
        config: config.clone(),
        sink,
        metrics,
    });
    let app = api::router(api_state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
