//! Ledger engine — append-only bookkeeping per user and currency.
//!
//! Every balance change is an immutable [`LedgerEntry`] carrying the running
//! `balance_after`, so the balance at any instant is the `balance_after` of
//! the last entry at or before it. Entries are never updated (the schema
//! rejects it); a correction is a compensating entry posted by [`reverse`].
//!
//! ## Idempotency
//!
//! `reference` is globally unique. Posting the same reference again with
//! the same payload returns the stored entry; a different payload under a
//! known reference is a [`AppError::Conflict`]. The UNIQUE constraint is the
//! authoritative guard: a constraint hit on insert re-reads the winner.
//!
//! ## Funds policy
//!
//! A debit may not exceed the available balance, i.e. the ledger balance
//! minus the amount reserved by active holds. With no holds this is plain
//! "never go negative".

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::db;
use crate::errors::{AppError, Result};
use crate::holds;
use crate::types::{
    checked_add, checked_sub, decimal_text, normalize_currency, now_millis, parse_column,
    require_non_empty, require_positive, string_enum,
};

string_enum! {
    /// Direction of a posting against the user's balance.
    pub enum EntryType {
        Debit => "debit",
        Credit => "credit",
    }
}

impl EntryType {
    pub fn opposite(self) -> Self {
        match self {
            Self::Debit => Self::Credit,
            Self::Credit => Self::Debit,
        }
    }

    /// Balance after applying `amount` in this direction.
    pub fn apply(self, balance: Decimal, amount: Decimal) -> Result<Decimal> {
        match self {
            Self::Credit => checked_add("balance", balance, amount),
            Self::Debit => checked_sub("balance", balance, amount),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: i64,
    pub entry_type: EntryType,
    pub amount: Decimal,
    pub currency: String,
    pub balance_after: Decimal,
    pub reference: String,
    pub external_id: Option<String>,
    pub description: Option<String>,
    pub transaction_id: Option<i64>,
    pub hold_id: Option<i64>,
    pub created_at: i64,
}

impl<'r> FromRow<'r, SqliteRow> for LedgerEntry {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            entry_type: parse_column(row, "entry_type")?,
            amount: parse_column(row, "amount")?,
            currency: row.try_get("currency")?,
            balance_after: parse_column(row, "balance_after")?,
            reference: row.try_get("reference")?,
            external_id: row.try_get("external_id")?,
            description: row.try_get("description")?,
            transaction_id: row.try_get("transaction_id")?,
            hold_id: row.try_get("hold_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// A request to append one entry.
#[derive(Debug, Clone, Deserialize)]
pub struct PostEntry {
    pub user_id: i64,
    pub entry_type: EntryType,
    pub amount: Decimal,
    pub currency: String,
    pub reference: String,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(skip)]
    pub transaction_id: Option<i64>,
    #[serde(skip)]
    pub hold_id: Option<i64>,
}

impl PostEntry {
    pub fn new(
        user_id: i64,
        entry_type: EntryType,
        amount: Decimal,
        currency: impl Into<String>,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            entry_type,
            amount,
            currency: currency.into(),
            reference: reference.into(),
            external_id: None,
            description: None,
            transaction_id: None,
            hold_id: None,
        }
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn for_transaction(mut self, transaction_id: i64) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }

    pub fn for_hold(mut self, hold_id: i64) -> Self {
        self.hold_id = Some(hold_id);
        self
    }
}

// ─────────────────────────────────────────────────────────
// Writes
// ─────────────────────────────────────────────────────────

/// Append an entry in its own database transaction.
pub async fn post(pool: &SqlitePool, entry: PostEntry) -> Result<LedgerEntry> {
    require_client_reference(&entry.reference)?;
    let currency = normalize_currency(&entry.currency)?;
    let mut tx = pool.begin().await?;
    db::lock_user(&mut tx, entry.user_id).await?;
    let reserved = holds::reserved_total(&mut tx, entry.user_id, &currency).await?;
    let stored = append(&mut tx, &entry, reserved).await?;
    tx.commit().await?;
    Ok(stored)
}

/// Reference shapes derived by transaction booking, hold capture and
/// reversal. Only those paths may post under them.
const RESERVED_PREFIXES: [&str; 2] = ["txn:", "hold:"];
const RESERVED_SUFFIX: &str = ":reversal";

fn require_client_reference(reference: &str) -> Result<()> {
    let reference = reference.trim();
    if RESERVED_PREFIXES.iter().any(|p| reference.starts_with(p))
        || reference.ends_with(RESERVED_SUFFIX)
    {
        return Err(AppError::Validation(format!(
            "reference {reference:?} is reserved for system postings"
        )));
    }
    Ok(())
}

/// Post the compensating entry for `entry_id`: opposite direction, same
/// amount, reference `<original>:reversal`. Idempotent like any posting.
pub async fn reverse(
    pool: &SqlitePool,
    entry_id: i64,
    description: Option<String>,
) -> Result<LedgerEntry> {
    let original = get(pool, entry_id).await?;

    let mut tx = pool.begin().await?;
    db::lock_user(&mut tx, original.user_id).await?;
    let reserved = holds::reserved_total(&mut tx, original.user_id, &original.currency).await?;

    let mut compensation = PostEntry::new(
        original.user_id,
        original.entry_type.opposite(),
        original.amount,
        original.currency.clone(),
        format!("{}:reversal", original.reference),
    );
    compensation.description =
        description.or_else(|| Some(format!("reversal of entry {}", original.id)));
    compensation.transaction_id = original.transaction_id;
    compensation.hold_id = original.hold_id;

    let stored = append(&mut tx, &compensation, reserved).await?;
    tx.commit().await?;
    info!(
        "Reversed ledger entry {} with entry {}",
        original.id, stored.id
    );
    Ok(stored)
}

/// Core append. The caller owns the transaction, has already taken the
/// user's lock via [`db::lock_user`], and passes the amount currently
/// reserved by active holds for the entry's currency.
pub(crate) async fn append(
    conn: &mut SqliteConnection,
    entry: &PostEntry,
    reserved: Decimal,
) -> Result<LedgerEntry> {
    require_positive("amount", entry.amount)?;
    let currency = normalize_currency(&entry.currency)?;
    let reference = require_non_empty("reference", &entry.reference)?;

    if let Some(existing) = find_by_reference(conn, &reference).await? {
        debug!("Ledger reference {reference} already posted as entry {}", existing.id);
        return ensure_same_posting(existing, entry, &currency);
    }

    let previous = latest_entry(conn, entry.user_id, &currency).await?;
    let prior = previous
        .as_ref()
        .map(|e| e.balance_after)
        .unwrap_or(Decimal::ZERO);

    if entry.entry_type == EntryType::Debit {
        let available = checked_sub("available balance", prior, reserved)?;
        if entry.amount > available {
            return Err(AppError::InsufficientFunds {
                requested: entry.amount,
                available: available.max(Decimal::ZERO),
            });
        }
    }

    let balance_after = entry.entry_type.apply(prior, entry.amount)?;
    // Keep timestamps monotonic per (user, currency) so as-of reads agree
    // with posting order even if the clock steps backwards.
    let created_at = previous
        .as_ref()
        .map_or(i64::MIN, |e| e.created_at)
        .max(now_millis());

    let inserted = sqlx::query_as::<_, LedgerEntry>(
        r#"
        INSERT INTO ledger_entries
            (user_id, entry_type, amount, currency, balance_after, reference,
             external_id, description, transaction_id, hold_id, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        RETURNING *
        "#,
    )
    .bind(entry.user_id)
    .bind(entry.entry_type.as_str())
    .bind(decimal_text(entry.amount))
    .bind(&currency)
    .bind(decimal_text(balance_after))
    .bind(&reference)
    .bind(&entry.external_id)
    .bind(&entry.description)
    .bind(entry.transaction_id)
    .bind(entry.hold_id)
    .bind(created_at)
    .fetch_one(&mut *conn)
    .await;

    match inserted {
        Ok(stored) => {
            debug!(
                "Posted {} {} {} for user {} (balance {})",
                stored.entry_type, stored.amount, stored.currency, stored.user_id, stored.balance_after
            );
            Ok(stored)
        }
        Err(err) if db::is_unique_violation(&err) => {
            match find_by_reference(conn, &reference).await? {
                Some(existing) => ensure_same_posting(existing, entry, &currency),
                None => Err(AppError::Conflict(format!(
                    "ledger external_id {:?} is already used",
                    entry.external_id
                ))),
            }
        }
        Err(err) => Err(err.into()),
    }
}

fn ensure_same_posting(
    existing: LedgerEntry,
    requested: &PostEntry,
    currency: &str,
) -> Result<LedgerEntry> {
    let same = existing.user_id == requested.user_id
        && existing.entry_type == requested.entry_type
        && existing.amount == requested.amount
        && existing.currency == currency
        && (requested.external_id.is_none() || existing.external_id == requested.external_id);

    if same {
        Ok(existing)
    } else {
        Err(AppError::Conflict(format!(
            "ledger reference {} was already posted with different details",
            existing.reference
        )))
    }
}

// ─────────────────────────────────────────────────────────
// Reads
// ─────────────────────────────────────────────────────────

pub async fn get(pool: &SqlitePool, id: i64) -> Result<LedgerEntry> {
    sqlx::query_as::<_, LedgerEntry>("SELECT * FROM ledger_entries WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Ledger entry {id}")))
}

async fn find_by_reference(
    conn: &mut SqliteConnection,
    reference: &str,
) -> Result<Option<LedgerEntry>> {
    let row = sqlx::query_as::<_, LedgerEntry>("SELECT * FROM ledger_entries WHERE reference = ?1")
        .bind(reference)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row)
}

async fn latest_entry(
    conn: &mut SqliteConnection,
    user_id: i64,
    currency: &str,
) -> Result<Option<LedgerEntry>> {
    let row = sqlx::query_as::<_, LedgerEntry>(
        r#"
        SELECT * FROM ledger_entries
        WHERE  user_id = ?1 AND currency = ?2
        ORDER  BY id DESC
        LIMIT  1
        "#,
    )
    .bind(user_id)
    .bind(currency)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

/// Current ledger balance (zero when nothing was ever posted).
pub async fn balance(conn: &mut SqliteConnection, user_id: i64, currency: &str) -> Result<Decimal> {
    let currency = normalize_currency(currency)?;
    Ok(latest_entry(conn, user_id, &currency)
        .await?
        .map(|e| e.balance_after)
        .unwrap_or(Decimal::ZERO))
}

/// Balance as of `at` (epoch millis): the `balance_after` of the last entry
/// posted at or before that instant.
pub async fn balance_as_of(
    pool: &SqlitePool,
    user_id: i64,
    currency: &str,
    at: i64,
) -> Result<Decimal> {
    let currency = normalize_currency(currency)?;
    let row = sqlx::query_as::<_, LedgerEntry>(
        r#"
        SELECT * FROM ledger_entries
        WHERE  user_id = ?1 AND currency = ?2 AND created_at <= ?3
        ORDER  BY created_at DESC, id DESC
        LIMIT  1
        "#,
    )
    .bind(user_id)
    .bind(&currency)
    .bind(at)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|e| e.balance_after).unwrap_or(Decimal::ZERO))
}

/// Entries for a user in posting order, optionally narrowed to a currency.
pub async fn entries(
    pool: &SqlitePool,
    user_id: i64,
    currency: Option<&str>,
) -> Result<Vec<LedgerEntry>> {
    let rows = match currency {
        Some(currency) => {
            let currency = normalize_currency(currency)?;
            sqlx::query_as::<_, LedgerEntry>(
                r#"
                SELECT * FROM ledger_entries
                WHERE  user_id = ?1 AND currency = ?2
                ORDER  BY id ASC
                "#,
            )
            .bind(user_id)
            .bind(currency)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, LedgerEntry>(
                "SELECT * FROM ledger_entries WHERE user_id = ?1 ORDER BY id ASC",
            )
            .bind(user_id)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows)
}
