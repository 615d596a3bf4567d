//! Wallet registry and provider-reported balance snapshots.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqlitePool};
use tracing::{debug, info};

use crate::db;
use crate::errors::{AppError, Result};
use crate::types::{decimal_text, normalize_currency, now_millis, parse_column, require_non_empty};

/// Link between a user and an account at an external payment provider.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Wallet {
    pub id: i64,
    pub user_id: i64,
    pub provider: String,
    pub provider_account_id: String,
    pub currency: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewWallet {
    pub user_id: i64,
    pub provider: String,
    pub provider_account_id: String,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceSnapshot {
    pub id: i64,
    pub wallet_id: i64,
    pub provider: String,
    pub balance: Decimal,
    pub currency: String,
    pub external_balance_id: String,
    pub idempotency_key: String,
    pub reported_at: i64,
    pub created_at: i64,
}

impl<'r> FromRow<'r, SqliteRow> for BalanceSnapshot {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            wallet_id: row.try_get("wallet_id")?,
            provider: row.try_get("provider")?,
            balance: parse_column(row, "balance")?,
            currency: row.try_get("currency")?,
            external_balance_id: row.try_get("external_balance_id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            reported_at: row.try_get("reported_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSnapshot {
    pub provider: String,
    pub balance: Decimal,
    pub external_balance_id: String,
    pub idempotency_key: String,
    /// Provider-side timestamp; defaults to the time of recording.
    #[serde(default)]
    pub reported_at: Option<i64>,
}

// ─────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────

pub async fn register(pool: &SqlitePool, req: NewWallet) -> Result<Wallet> {
    let provider = require_non_empty("provider", &req.provider)?;
    let account = require_non_empty("provider_account_id", &req.provider_account_id)?;
    let currency = normalize_currency(&req.currency)?;

    let wallet = sqlx::query_as::<_, Wallet>(
        r#"
        INSERT INTO wallet_registry (user_id, provider, provider_account_id, currency, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        RETURNING *
        "#,
    )
    .bind(req.user_id)
    .bind(&provider)
    .bind(&account)
    .bind(&currency)
    .bind(now_millis())
    .fetch_one(pool)
    .await?;

    info!(
        "Wallet {} registered: user {} at {provider}/{account}",
        wallet.id, wallet.user_id
    );
    Ok(wallet)
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Wallet> {
    sqlx::query_as::<_, Wallet>("SELECT * FROM wallet_registry WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Wallet {id}")))
}

pub async fn list_for_user(pool: &SqlitePool, user_id: i64) -> Result<Vec<Wallet>> {
    let rows = sqlx::query_as::<_, Wallet>(
        "SELECT * FROM wallet_registry WHERE user_id = ?1 ORDER BY id ASC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn list_all(pool: &SqlitePool) -> Result<Vec<Wallet>> {
    let rows = sqlx::query_as::<_, Wallet>("SELECT * FROM wallet_registry ORDER BY id ASC")
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Remove a wallet together with its snapshots and drift records.
pub async fn delete(pool: &SqlitePool, id: i64) -> Result<()> {
    let rows = sqlx::query("DELETE FROM wallet_registry WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    if rows == 0 {
        return Err(AppError::NotFound(format!("Wallet {id}")));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Snapshots
// ─────────────────────────────────────────────────────────

/// Record a provider-reported balance.
///
/// Resubmitting an `idempotency_key` returns the stored snapshot unchanged.
/// The UNIQUE constraints decide races: a losing insert re-reads the winner.
pub async fn record_snapshot(
    pool: &SqlitePool,
    wallet_id: i64,
    req: NewSnapshot,
) -> Result<BalanceSnapshot> {
    let idempotency_key = require_non_empty("idempotency_key", &req.idempotency_key)?;
    let external_balance_id = require_non_empty("external_balance_id", &req.external_balance_id)?;
    let provider = require_non_empty("provider", &req.provider)?;

    if let Some(existing) = find_by_key(pool, &idempotency_key).await? {
        debug!("Snapshot key {idempotency_key} already recorded as {}", existing.id);
        return ensure_same_wallet(existing, wallet_id);
    }

    let wallet = get(pool, wallet_id).await?;
    if wallet.provider != provider {
        return Err(AppError::Validation(format!(
            "wallet {wallet_id} belongs to provider {}, not {provider}",
            wallet.provider
        )));
    }

    let now = now_millis();
    let inserted = sqlx::query_as::<_, BalanceSnapshot>(
        r#"
        INSERT INTO wallet_balance_snapshots
            (wallet_id, provider, balance, currency, external_balance_id,
             idempotency_key, reported_at, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        RETURNING *
        "#,
    )
    .bind(wallet.id)
    .bind(&provider)
    .bind(decimal_text(req.balance))
    .bind(&wallet.currency)
    .bind(&external_balance_id)
    .bind(&idempotency_key)
    .bind(req.reported_at.unwrap_or(now))
    .bind(now)
    .fetch_one(pool)
    .await;

    match inserted {
        Ok(snapshot) => {
            debug!(
                "Snapshot {} recorded for wallet {}: {} {}",
                snapshot.id, snapshot.wallet_id, snapshot.balance, snapshot.currency
            );
            Ok(snapshot)
        }
        Err(err) if db::is_unique_violation(&err) => {
            match find_by_key(pool, &idempotency_key).await? {
                Some(existing) => ensure_same_wallet(existing, wallet_id),
                None => Err(AppError::Conflict(format!(
                    "external balance {external_balance_id} was already recorded under another key"
                ))),
            }
        }
        Err(err) => Err(err.into()),
    }
}

fn ensure_same_wallet(existing: BalanceSnapshot, wallet_id: i64) -> Result<BalanceSnapshot> {
    if existing.wallet_id == wallet_id {
        Ok(existing)
    } else {
        Err(AppError::Conflict(format!(
            "idempotency key {} belongs to wallet {}",
            existing.idempotency_key, existing.wallet_id
        )))
    }
}

async fn find_by_key(pool: &SqlitePool, key: &str) -> Result<Option<BalanceSnapshot>> {
    let row = sqlx::query_as::<_, BalanceSnapshot>(
        "SELECT * FROM wallet_balance_snapshots WHERE idempotency_key = ?1",
    )
    .bind(key)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Most recently reported snapshot for a wallet.
pub async fn latest_snapshot(pool: &SqlitePool, wallet_id: i64) -> Result<Option<BalanceSnapshot>> {
    let row = sqlx::query_as::<_, BalanceSnapshot>(
        r#"
        SELECT * FROM wallet_balance_snapshots
        WHERE  wallet_id = ?1
        ORDER  BY reported_at DESC, id DESC
        LIMIT  1
        "#,
    )
    .bind(wallet_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn snapshots(pool: &SqlitePool, wallet_id: i64) -> Result<Vec<BalanceSnapshot>> {
    let rows = sqlx::query_as::<_, BalanceSnapshot>(
        "SELECT * FROM wallet_balance_snapshots WHERE wallet_id = ?1 ORDER BY reported_at ASC, id ASC",
    )
    .bind(wallet_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
