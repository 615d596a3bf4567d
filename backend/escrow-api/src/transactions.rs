//! Transaction state machine.
//!
//! ```text
//! pending ──► processing ──► completed ──► refunded
//!    │             ├──────► failed
//!    │             └──────► cancelled
//!    └──► completed | failed | cancelled
//! ```
//!
//! Ledger side effects are gated to two edges: entering `completed` posts
//! the net amount under reference `txn:<id>`, entering `refunded` posts the
//! compensating entry `txn:<id>:refund`. Both happen in the same database
//! transaction as the status change, so a failed posting leaves the status
//! untouched.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqliteConnection, SqlitePool};
use tracing::info;

use crate::db;
use crate::errors::{AppError, Result};
use crate::events::{DomainEvent, EventKind, EventSink};
use crate::holds;
use crate::ledger::{self, EntryType, PostEntry};
use crate::types::{
    decimal_text, normalize_currency, now_millis, parse_column, require_positive, string_enum,
};

string_enum! {
    pub enum TransactionType {
        Deposit => "deposit",
        Withdrawal => "withdrawal",
        EscrowHold => "escrow_hold",
        EscrowRelease => "escrow_release",
        Refund => "refund",
        Fee => "fee",
        Commission => "commission",
    }
}

impl TransactionType {
    /// Ledger direction booked when a transaction of this type completes.
    pub fn ledger_direction(self) -> EntryType {
        match self {
            Self::Deposit | Self::EscrowRelease | Self::Refund => EntryType::Credit,
            Self::Withdrawal | Self::EscrowHold | Self::Fee | Self::Commission => EntryType::Debit,
        }
    }
}

string_enum! {
    pub enum TransactionStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
        Refunded => "refunded",
    }
}

impl TransactionStatus {
    pub fn can_transition_to(self, next: Self) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Processing | Completed | Failed | Cancelled)
                | (Processing, Completed | Failed | Cancelled)
                | (Completed, Refunded)
        )
    }

    fn event_kind(self) -> Option<EventKind> {
        match self {
            Self::Completed => Some(EventKind::TransactionCompleted),
            Self::Failed => Some(EventKind::TransactionFailed),
            Self::Cancelled => Some(EventKind::TransactionCancelled),
            Self::Refunded => Some(EventKind::TransactionRefunded),
            Self::Pending | Self::Processing => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub id: i64,
    pub user_id: i64,
    pub project_id: Option<i64>,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub amount: Decimal,
    pub fee: Decimal,
    pub net_amount: Decimal,
    pub currency: String,
    pub description: Option<String>,
    pub gateway_transaction_id: Option<String>,
    pub gateway_reference: Option<String>,
    pub processed_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl<'r> FromRow<'r, SqliteRow> for Transaction {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            project_id: row.try_get("project_id")?,
            transaction_type: parse_column(row, "transaction_type")?,
            status: parse_column(row, "status")?,
            amount: parse_column(row, "amount")?,
            fee: parse_column(row, "fee")?,
            net_amount: parse_column(row, "net_amount")?,
            currency: row.try_get("currency")?,
            description: row.try_get("description")?,
            gateway_transaction_id: row.try_get("gateway_transaction_id")?,
            gateway_reference: row.try_get("gateway_reference")?,
            processed_at: row.try_get("processed_at")?,
            completed_at: row.try_get("completed_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTransaction {
    pub user_id: i64,
    #[serde(default)]
    pub project_id: Option<i64>,
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    #[serde(default)]
    pub fee: Decimal,
    pub currency: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub gateway_transaction_id: Option<String>,
    #[serde(default)]
    pub gateway_reference: Option<String>,
}

/// Fields a client may patch. Money fields only while `pending`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransactionUpdate {
    pub amount: Option<Decimal>,
    pub fee: Option<Decimal>,
    pub description: Option<String>,
    pub gateway_reference: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransactionFilter {
    pub user_id: Option<i64>,
    pub status: Option<TransactionStatus>,
}

/// `amount − fee`, with `amount > 0` and `0 <= fee < amount`.
pub fn net_amount(amount: Decimal, fee: Decimal) -> Result<Decimal> {
    require_positive("amount", amount)?;
    if fee < Decimal::ZERO {
        return Err(AppError::Validation("fee must not be negative".to_string()));
    }
    if fee >= amount {
        return Err(AppError::Validation(
            "fee must be smaller than amount".to_string(),
        ));
    }
    Ok(amount - fee)
}

// ─────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────

pub async fn create(pool: &SqlitePool, req: NewTransaction) -> Result<Transaction> {
    let net = net_amount(req.amount, req.fee)?;
    let currency = normalize_currency(&req.currency)?;
    let now = now_millis();

    let created = sqlx::query_as::<_, Transaction>(
        r#"
        INSERT INTO transactions
            (user_id, project_id, transaction_type, status, amount, fee, net_amount,
             currency, description, gateway_transaction_id, gateway_reference,
             created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
        RETURNING *
        "#,
    )
    .bind(req.user_id)
    .bind(req.project_id)
    .bind(req.transaction_type.as_str())
    .bind(TransactionStatus::Pending.as_str())
    .bind(decimal_text(req.amount))
    .bind(decimal_text(req.fee))
    .bind(decimal_text(net))
    .bind(&currency)
    .bind(&req.description)
    .bind(&req.gateway_transaction_id)
    .bind(&req.gateway_reference)
    .bind(now)
    .fetch_one(pool)
    .await?;

    info!(
        "Transaction {} created: {} {} {} (net {})",
        created.id, created.transaction_type, created.amount, created.currency, created.net_amount
    );
    Ok(created)
}

pub async fn update(pool: &SqlitePool, id: i64, patch: TransactionUpdate) -> Result<Transaction> {
    let current = get(pool, id).await?;

    let touches_money = patch.amount.is_some() || patch.fee.is_some();
    if touches_money && current.status != TransactionStatus::Pending {
        return Err(AppError::Conflict(format!(
            "transaction {id} is {}; amount and fee can only change while pending",
            current.status
        )));
    }

    let amount = patch.amount.unwrap_or(current.amount);
    let fee = patch.fee.unwrap_or(current.fee);
    let net = net_amount(amount, fee)?;
    let description = patch.description.or(current.description);
    let gateway_reference = patch.gateway_reference.or(current.gateway_reference);

    // Compare-and-set on status so a concurrent transition wins cleanly.
    let updated = sqlx::query_as::<_, Transaction>(
        r#"
        UPDATE transactions
        SET    amount = ?1, fee = ?2, net_amount = ?3, description = ?4,
               gateway_reference = ?5, updated_at = ?6
        WHERE  id = ?7 AND status = ?8
        RETURNING *
        "#,
    )
    .bind(decimal_text(amount))
    .bind(decimal_text(fee))
    .bind(decimal_text(net))
    .bind(&description)
    .bind(&gateway_reference)
    .bind(now_millis())
    .bind(id)
    .bind(current.status.as_str())
    .fetch_optional(pool)
    .await?;

    updated.ok_or_else(|| {
        AppError::Conflict(format!("transaction {id} changed status during update"))
    })
}

/// Move the transaction to `next`, booking the ledger side effect of the
/// edge. Requesting the current status again is a no-op.
pub async fn transition(
    pool: &SqlitePool,
    sink: &dyn EventSink,
    id: i64,
    next: TransactionStatus,
) -> Result<Transaction> {
    let owner = get(pool, id).await?.user_id;

    let mut tx = pool.begin().await?;
    db::lock_user(&mut tx, owner).await?;
    let current = fetch(&mut tx, id).await?;

    if current.status == next {
        return Ok(current);
    }
    if !current.status.can_transition_to(next) {
        return Err(AppError::invalid_transition(
            "transaction",
            current.status,
            next,
        ));
    }

    let now = now_millis();
    let processed_at = match next {
        TransactionStatus::Processing | TransactionStatus::Completed => {
            current.processed_at.or(Some(now))
        }
        _ => current.processed_at,
    };
    let completed_at = match next {
        TransactionStatus::Completed => Some(now),
        _ => current.completed_at,
    };

    let updated = sqlx::query_as::<_, Transaction>(
        r#"
        UPDATE transactions
        SET    status = ?1, processed_at = ?2, completed_at = ?3, updated_at = ?4
        WHERE  id = ?5 AND status = ?6
        RETURNING *
        "#,
    )
    .bind(next.as_str())
    .bind(processed_at)
    .bind(completed_at)
    .bind(now)
    .bind(id)
    .bind(current.status.as_str())
    .fetch_one(&mut *tx)
    .await?;

    match next {
        TransactionStatus::Completed => {
            book(&mut tx, &updated, updated.transaction_type.ledger_direction(), "").await?;
        }
        TransactionStatus::Refunded => {
            let direction = updated.transaction_type.ledger_direction().opposite();
            book(&mut tx, &updated, direction, ":refund").await?;
        }
        _ => {}
    }

    tx.commit().await?;

    info!(
        "Transaction {} moved {} -> {}",
        updated.id, current.status, updated.status
    );
    if let Some(kind) = next.event_kind() {
        sink.publish(
            DomainEvent::new(kind, updated.user_id, updated.id)
                .with_amount(updated.net_amount, &updated.currency),
        );
    }
    Ok(updated)
}

async fn book(
    conn: &mut SqliteConnection,
    txn: &Transaction,
    direction: EntryType,
    suffix: &str,
) -> Result<()> {
    let reserved = holds::reserved_total(conn, txn.user_id, &txn.currency).await?;
    let mut entry = PostEntry::new(
        txn.user_id,
        direction,
        txn.net_amount,
        txn.currency.clone(),
        format!("txn:{}{suffix}", txn.id),
    )
    .for_transaction(txn.id);
    entry.external_id = match (&txn.gateway_transaction_id, suffix.is_empty()) {
        (Some(gateway_id), true) => Some(gateway_id.clone()),
        _ => None,
    };
    entry.description = txn.description.clone();
    ledger::append(conn, &entry, reserved).await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Reads
// ─────────────────────────────────────────────────────────

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Transaction> {
    sqlx::query_as::<_, Transaction>("SELECT * FROM transactions WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Transaction {id}")))
}

async fn fetch(conn: &mut SqliteConnection, id: i64) -> Result<Transaction> {
    sqlx::query_as::<_, Transaction>("SELECT * FROM transactions WHERE id = ?1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Transaction {id}")))
}

pub async fn list(pool: &SqlitePool, filter: &TransactionFilter) -> Result<Vec<Transaction>> {
    let rows = sqlx::query_as::<_, Transaction>(
        r#"
        SELECT * FROM transactions
        WHERE  (?1 IS NULL OR user_id = ?1)
          AND  (?2 IS NULL OR status = ?2)
        ORDER  BY id ASC
        "#,
    )
    .bind(filter.user_id)
    .bind(filter.status.map(|s| s.as_str()))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
