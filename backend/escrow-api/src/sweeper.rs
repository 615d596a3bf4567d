//! Long-running background task that pulls provider balances and
//! reconciles every wallet against the ledger.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::errors::Result;
use crate::events::EventSink;
use crate::provider::{self, ProviderClient};
use crate::reconciler::{self, SweepReport};
use crate::telemetry::Metrics;
use crate::wallets;

pub struct SweeperState {
    pub pool: SqlitePool,
    pub config: Config,
    pub provider: Option<ProviderClient>,
    pub sink: Arc<dyn EventSink>,
    pub metrics: Arc<Metrics>,
}

/// Spawn the sweeper loop as a background [`tokio`] task.
pub async fn run(state: Arc<SweeperState>) {
    let interval = Duration::from_secs(state.config.reconcile_interval_secs);
    match &state.config.provider_balance_url {
        Some(url) => info!("Sweeper starting: every {interval:?}, pulling balances from {url}"),
        None => info!("Sweeper starting: every {interval:?}, snapshots pushed via API only"),
    }

    loop {
        match sweep_once(&state).await {
            Ok(report) => info!(
                "Sweep finished: {} checked, {} drifted, {} without snapshot, {} failed",
                report.checked, report.drifted, report.skipped, report.failed
            ),
            Err(e) => {
                state.metrics.sweeps.with_label_values(&["error"]).inc();
                error!("Sweep error: {e}");
            }
        }

        tokio::time::sleep(interval).await;
    }
}

/// Perform a single sweep: refresh snapshots from the provider (when one is
/// configured), then reconcile every wallet.
pub async fn sweep_once(state: &SweeperState) -> Result<SweepReport> {
    if let Some(client) = &state.provider {
        let pulled = pull_snapshots(&state.pool, client).await?;
        state.metrics.balances_pulled.inc_by(pulled as u64);
    }

    let report =
        reconciler::reconcile_all(&state.pool, state.sink.as_ref(), state.config.reconcile_tolerance)
            .await?;
    state.metrics.sweeps.with_label_values(&["ok"]).inc();
    state.metrics.drifts_flagged.inc_by(report.drifted as u64);
    Ok(report)
}

/// Fetch and record the provider balance of every wallet. A wallet whose
/// balance cannot be fetched or recorded keeps its previous snapshot for
/// this sweep.
async fn pull_snapshots(pool: &SqlitePool, client: &ProviderClient) -> Result<usize> {
    let mut pulled = 0;
    for wallet in wallets::list_all(pool).await? {
        let reported = match client.fetch_balance(&wallet.provider_account_id).await {
            Ok(reported) => reported,
            Err(e) => {
                warn!("Skipping wallet {}: {e}", wallet.id);
                continue;
            }
        };

        let request = match provider::to_snapshot(&wallet, &reported) {
            Ok(request) => request,
            Err(e) => {
                warn!("Skipping wallet {}: {e}", wallet.id);
                continue;
            }
        };

        if let Err(e) = wallets::record_snapshot(pool, wallet.id, request).await {
            warn!("Skipping wallet {}: {e}", wallet.id);
            continue;
        }
        pulled += 1;
    }
    Ok(pulled)
}
