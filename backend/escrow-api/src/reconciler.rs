//! Wallet balance reconciler.
//!
//! Compares the newest provider snapshot of a wallet with the ledger
//! balance for the wallet's user and currency at the instant the provider
//! reported it. A difference beyond the configured tolerance is stored as a
//! [`Drift`] for operator review; the ledger itself is never touched.

use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqlitePool};
use tracing::{debug, warn};

use crate::errors::{AppError, Result};
use crate::events::{DomainEvent, EventKind, EventSink};
use crate::ledger;
use crate::types::{decimal_text, now_millis, parse_column};
use crate::wallets::{self, Wallet};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Drift {
    pub id: i64,
    pub wallet_id: i64,
    pub snapshot_id: i64,
    pub currency: String,
    pub internal_balance: Decimal,
    pub external_balance: Decimal,
    /// `external − internal`.
    pub difference: Decimal,
    pub detected_at: i64,
}

impl<'r> FromRow<'r, SqliteRow> for Drift {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            wallet_id: row.try_get("wallet_id")?,
            snapshot_id: row.try_get("snapshot_id")?,
            currency: row.try_get("currency")?,
            internal_balance: parse_column(row, "internal_balance")?,
            external_balance: parse_column(row, "external_balance")?,
            difference: parse_column(row, "difference")?,
            detected_at: row.try_get("detected_at")?,
        })
    }
}

/// Per-run totals, logged by the sweeper.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub drifted: usize,
    /// Wallets without any snapshot yet.
    pub skipped: usize,
    pub failed: usize,
}

/// Reconcile one wallet. `None` means the balances agree within
/// `tolerance`.
pub async fn reconcile(
    pool: &SqlitePool,
    sink: &dyn EventSink,
    wallet_id: i64,
    tolerance: Decimal,
) -> Result<Option<Drift>> {
    let wallet = wallets::get(pool, wallet_id).await?;
    reconcile_wallet(pool, sink, &wallet, tolerance).await
}

async fn reconcile_wallet(
    pool: &SqlitePool,
    sink: &dyn EventSink,
    wallet: &Wallet,
    tolerance: Decimal,
) -> Result<Option<Drift>> {
    let snapshot = wallets::latest_snapshot(pool, wallet.id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Balance snapshot for wallet {}", wallet.id)))?;

    let internal =
        ledger::balance_as_of(pool, wallet.user_id, &wallet.currency, snapshot.reported_at).await?;
    let difference = snapshot
        .balance
        .checked_sub(internal)
        .ok_or_else(|| AppError::Validation("balance difference out of range".to_string()))?;

    if difference.abs() <= tolerance {
        debug!(
            "Wallet {} reconciled: ledger {internal}, provider {}",
            wallet.id, snapshot.balance
        );
        // A drift flagged under a tighter tolerance no longer stands.
        sqlx::query("DELETE FROM balance_drifts WHERE snapshot_id = ?1")
            .bind(snapshot.id)
            .execute(pool)
            .await?;
        return Ok(None);
    }

    let drift = sqlx::query_as::<_, Drift>(
        r#"
        INSERT INTO balance_drifts
            (wallet_id, snapshot_id, currency, internal_balance, external_balance,
             difference, detected_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT (snapshot_id) DO UPDATE SET
            internal_balance = excluded.internal_balance,
            difference       = excluded.difference,
            detected_at      = excluded.detected_at
        RETURNING *
        "#,
    )
    .bind(wallet.id)
    .bind(snapshot.id)
    .bind(&wallet.currency)
    .bind(decimal_text(internal))
    .bind(decimal_text(snapshot.balance))
    .bind(decimal_text(difference))
    .bind(now_millis())
    .fetch_one(pool)
    .await?;

    warn!(
        "Balance drift on wallet {}: ledger {} vs provider {} ({} {})",
        wallet.id, internal, snapshot.balance, drift.difference, drift.currency
    );
    sink.publish(
        DomainEvent::new(EventKind::DriftDetected, wallet.user_id, wallet.id)
            .with_amount(drift.difference, &drift.currency),
    );
    Ok(Some(drift))
}

/// Reconcile every registered wallet. Wallets without a snapshot are
/// skipped; a wallet that fails is logged and counted, and the sweep moves on.
pub async fn reconcile_all(
    pool: &SqlitePool,
    sink: &dyn EventSink,
    tolerance: Decimal,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();
    for wallet in wallets::list_all(pool).await? {
        match reconcile_wallet(pool, sink, &wallet, tolerance).await {
            Ok(Some(_)) => {
                report.checked += 1;
                report.drifted += 1;
            }
            Ok(None) => report.checked += 1,
            Err(AppError::NotFound(_)) => report.skipped += 1,
            Err(e) => {
                warn!("Reconciling wallet {} failed: {e}", wallet.id);
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

pub async fn drifts(pool: &SqlitePool, wallet_id: Option<i64>) -> Result<Vec<Drift>> {
    let rows = sqlx::query_as::<_, Drift>(
        r#"
        SELECT * FROM balance_drifts
        WHERE  (?1 IS NULL OR wallet_id = ?1)
        ORDER  BY detected_at DESC, id DESC
        "#,
    )
    .bind(wallet_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::events::ChannelSink;
    use crate::ledger::tests::{fund, seed_user};
    use crate::wallets::tests::{seed_wallet, snapshot};

    fn cents(value: i64) -> Decimal {
        Decimal::new(value, 2)
    }

    #[tokio::test]
    async fn matching_balances_report_no_drift() {
        let pool = db::test_pool().await;
        let (sink, mut events) = ChannelSink::new();
        let user = seed_user(&pool, "r@example.com").await;
        fund(&pool, user, 100, "dep-1").await;
        let wallet = seed_wallet(&pool, user).await;
        wallets::record_snapshot(&pool, wallet.id, snapshot(100, "k-1"))
            .await
            .unwrap();

        let result = reconcile(&pool, &sink, wallet.id, cents(1)).await.unwrap();
        assert!(result.is_none());
        assert!(drifts(&pool, None).await.unwrap().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn rounding_within_tolerance_is_ignored() {
        let pool = db::test_pool().await;
        let (sink, _events) = ChannelSink::new();
        let user = seed_user(&pool, "r@example.com").await;
        fund(&pool, user, 100, "dep-1").await;
        let wallet = seed_wallet(&pool, user).await;
        let mut report = snapshot(0, "k-1");
        report.balance = cents(10_001);
        wallets::record_snapshot(&pool, wallet.id, report).await.unwrap();

        assert!(reconcile(&pool, &sink, wallet.id, cents(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn drift_is_flagged_without_touching_ledger() {
        let pool = db::test_pool().await;
        let (sink, mut events) = ChannelSink::new();
        let user = seed_user(&pool, "r@example.com").await;
        fund(&pool, user, 100, "dep-1").await;
        let wallet = seed_wallet(&pool, user).await;
        wallets::record_snapshot(&pool, wallet.id, snapshot(90, "k-1"))
            .await
            .unwrap();

        let drift = reconcile(&pool, &sink, wallet.id, cents(1))
            .await
            .unwrap()
            .expect("drift expected");
        assert_eq!(drift.internal_balance, Decimal::new(100, 0));
        assert_eq!(drift.external_balance, Decimal::new(90, 0));
        assert_eq!(drift.difference, Decimal::new(-10, 0));

        // Re-running refreshes the same drift row.
        let again = reconcile(&pool, &sink, wallet.id, cents(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, drift.id);
        assert_eq!(drifts(&pool, Some(wallet.id)).await.unwrap().len(), 1);

        assert_eq!(ledger::entries(&pool, user, None).await.unwrap().len(), 1);
        assert_eq!(events.recv().await.unwrap().kind, EventKind::DriftDetected);
    }

    #[tokio::test]
    async fn older_snapshot_is_compared_with_balance_at_report_time() {
        let pool = db::test_pool().await;
        let (sink, _events) = ChannelSink::new();
        let user = seed_user(&pool, "r@example.com").await;
        let wallet = seed_wallet(&pool, user).await;

        // The provider saw an empty account before the deposit landed.
        let mut report = snapshot(0, "k-1");
        report.reported_at = Some(1_000);
        wallets::record_snapshot(&pool, wallet.id, report).await.unwrap();
        fund(&pool, user, 100, "dep-1").await;

        assert!(reconcile(&pool, &sink, wallet.id, cents(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn drift_within_new_tolerance_is_cleared() {
        let pool = db::test_pool().await;
        let (sink, _events) = ChannelSink::new();
        let user = seed_user(&pool, "r@example.com").await;
        fund(&pool, user, 100, "dep-1").await;
        let wallet = seed_wallet(&pool, user).await;
        wallets::record_snapshot(&pool, wallet.id, snapshot(95, "k-1"))
            .await
            .unwrap();

        assert!(reconcile(&pool, &sink, wallet.id, cents(1)).await.unwrap().is_some());
        assert_eq!(drifts(&pool, Some(wallet.id)).await.unwrap().len(), 1);

        assert!(reconcile(&pool, &sink, wallet.id, Decimal::new(10, 0))
            .await
            .unwrap()
            .is_none());
        assert!(drifts(&pool, Some(wallet.id)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wallet_without_snapshot_is_not_found() {
        let pool = db::test_pool().await;
        let (sink, _events) = ChannelSink::new();
        let user = seed_user(&pool, "r@example.com").await;
        let wallet = seed_wallet(&pool, user).await;

        let err = reconcile(&pool, &sink, wallet.id, cents(1)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn sweep_counts_checked_drifted_and_skipped() {
        let pool = db::test_pool().await;
        let (sink, _events) = ChannelSink::new();
        let a = seed_user(&pool, "a@example.com").await;
        let b = seed_user(&pool, "b@example.com").await;
        let c = seed_user(&pool, "c@example.com").await;
        fund(&pool, a, 50, "dep-a").await;

        let wa = seed_wallet(&pool, a).await;
        let wb = seed_wallet(&pool, b).await;
        seed_wallet(&pool, c).await;
        wallets::record_snapshot(&pool, wa.id, snapshot(50, "k-a")).await.unwrap();
        wallets::record_snapshot(&pool, wb.id, snapshot(5, "k-b")).await.unwrap();

        let report = reconcile_all(&pool, &sink, cents(1)).await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                checked: 2,
                drifted: 1,
                skipped: 1,
                failed: 0,
            }
        );
    }
}
