//! Hold manager — earmarks funds without moving them.
//!
//! A hold reserves part of the ledger balance for a later settlement:
//!
//! ```text
//! active ──release──► released   (terminal, funds return to available)
//!    └────capture───► captured   (terminal, debit posted to the ledger)
//! ```
//!
//! `available = ledger balance − Σ active holds` is never negative: a hold
//! is only created when it fits, and ledger debits respect the reserve.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqliteConnection, SqlitePool};
use tracing::info;

use crate::db;
use crate::errors::{AppError, Result};
use crate::events::{DomainEvent, EventKind, EventSink};
use crate::ledger::{self, EntryType, LedgerEntry, PostEntry};
use crate::types::{
    checked_sub, decimal_text, normalize_currency, now_millis, parse_column, require_non_empty,
    require_positive, string_enum, sum_decimal_text,
};

string_enum! {
    pub enum HoldStatus {
        Active => "active",
        Released => "released",
        Captured => "captured",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hold {
    pub id: i64,
    pub user_id: i64,
    pub project_id: Option<i64>,
    pub amount: Decimal,
    pub currency: String,
    pub status: HoldStatus,
    pub reference: String,
    pub external_id: String,
    pub created_at: i64,
    pub released_at: Option<i64>,
    pub captured_at: Option<i64>,
}

impl<'r> FromRow<'r, SqliteRow> for Hold {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            project_id: row.try_get("project_id")?,
            amount: parse_column(row, "amount")?,
            currency: row.try_get("currency")?,
            status: parse_column(row, "status")?,
            reference: row.try_get("reference")?,
            external_id: row.try_get("external_id")?,
            created_at: row.try_get("created_at")?,
            released_at: row.try_get("released_at")?,
            captured_at: row.try_get("captured_at")?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewHold {
    pub user_id: i64,
    pub amount: Decimal,
    pub currency: String,
    pub reference: String,
    /// Correlation ID supplied by the payment gateway.
    pub external_id: String,
    #[serde(default)]
    pub project_id: Option<i64>,
}

/// Result of a capture: the terminal hold and the debit it produced.
#[derive(Debug, Clone, Serialize)]
pub struct Capture {
    pub hold: Hold,
    pub entry: LedgerEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceSummary {
    pub user_id: i64,
    pub currency: String,
    pub ledger_balance: Decimal,
    pub held: Decimal,
    pub available: Decimal,
}

// ─────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────

/// Reserve `amount` against the user's available balance.
///
/// Idempotent by `reference`: replaying an identical request returns the
/// existing hold, whatever state it has reached since.
pub async fn create_hold(pool: &SqlitePool, sink: &dyn EventSink, req: NewHold) -> Result<Hold> {
    require_positive("amount", req.amount)?;
    let currency = normalize_currency(&req.currency)?;
    let reference = require_non_empty("reference", &req.reference)?;
    let external_id = require_non_empty("external_id", &req.external_id)?;

    let mut tx = pool.begin().await?;
    db::lock_user(&mut tx, req.user_id).await?;

    if let Some(existing) = find_by_reference(&mut tx, &reference).await? {
        let same = existing.user_id == req.user_id
            && existing.amount == req.amount
            && existing.currency == currency
            && existing.external_id == external_id;
        return if same {
            Ok(existing)
        } else {
            Err(AppError::Conflict(format!(
                "hold reference {reference} was already used with different details"
            )))
        };
    }

    let summary = summary_in(&mut tx, req.user_id, &currency).await?;
    if req.amount > summary.available {
        return Err(AppError::InsufficientFunds {
            requested: req.amount,
            available: summary.available,
        });
    }

    let hold = sqlx::query_as::<_, Hold>(
        r#"
        INSERT INTO holds
            (user_id, project_id, amount, currency, status, reference, external_id, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        RETURNING *
        "#,
    )
    .bind(req.user_id)
    .bind(req.project_id)
    .bind(decimal_text(req.amount))
    .bind(&currency)
    .bind(HoldStatus::Active.as_str())
    .bind(&reference)
    .bind(&external_id)
    .bind(now_millis())
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    info!(
        "Hold {} placed: {} {} for user {}",
        hold.id, hold.amount, hold.currency, hold.user_id
    );
    sink.publish(
        DomainEvent::new(EventKind::HoldCreated, hold.user_id, hold.id)
            .with_amount(hold.amount, &hold.currency),
    );
    Ok(hold)
}

/// Return the held funds to the available balance.
///
/// Releasing an already released hold is a no-op; a captured hold cannot
/// be released.
pub async fn release(pool: &SqlitePool, sink: &dyn EventSink, hold_id: i64) -> Result<Hold> {
    let owner = get(pool, hold_id).await?.user_id;

    let mut tx = pool.begin().await?;
    db::lock_user(&mut tx, owner).await?;
    let hold = fetch(&mut tx, hold_id).await?;

    match hold.status {
        HoldStatus::Released => return Ok(hold),
        HoldStatus::Captured => {
            return Err(AppError::invalid_transition(
                "hold",
                hold.status,
                HoldStatus::Released,
            ))
        }
        HoldStatus::Active => {}
    }

    let released = sqlx::query_as::<_, Hold>(
        r#"
        UPDATE holds SET status = ?1, released_at = ?2
        WHERE  id = ?3 AND status = ?4
        RETURNING *
        "#,
    )
    .bind(HoldStatus::Released.as_str())
    .bind(now_millis())
    .bind(hold_id)
    .bind(HoldStatus::Active.as_str())
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    info!("Hold {} released", released.id);
    sink.publish(
        DomainEvent::new(EventKind::HoldReleased, released.user_id, released.id)
            .with_amount(released.amount, &released.currency),
    );
    Ok(released)
}

/// Settle the hold: mark it captured and debit the ledger by its amount,
/// both in one database transaction.
pub async fn capture(pool: &SqlitePool, sink: &dyn EventSink, hold_id: i64) -> Result<Capture> {
    let owner = get(pool, hold_id).await?.user_id;

    let mut tx = pool.begin().await?;
    db::lock_user(&mut tx, owner).await?;
    let hold = fetch(&mut tx, hold_id).await?;

    if hold.status != HoldStatus::Active {
        return Err(AppError::invalid_transition(
            "hold",
            hold.status,
            HoldStatus::Captured,
        ));
    }

    let captured = sqlx::query_as::<_, Hold>(
        r#"
        UPDATE holds SET status = ?1, captured_at = ?2
        WHERE  id = ?3 AND status = ?4
        RETURNING *
        "#,
    )
    .bind(HoldStatus::Captured.as_str())
    .bind(now_millis())
    .bind(hold_id)
    .bind(HoldStatus::Active.as_str())
    .fetch_one(&mut *tx)
    .await?;

    // The captured hold no longer reserves anything, so the debit is
    // checked against what the remaining holds leave available.
    let reserved = reserved_total(&mut tx, captured.user_id, &captured.currency).await?;
    let debit = PostEntry::new(
        captured.user_id,
        EntryType::Debit,
        captured.amount,
        captured.currency.clone(),
        format!("hold:{}:capture", captured.reference),
    )
    .described(format!("capture of hold {}", captured.id))
    .for_hold(captured.id);
    let entry = ledger::append(&mut tx, &debit, reserved).await?;

    tx.commit().await?;

    info!(
        "Hold {} captured: ledger entry {} debited {} {}",
        captured.id, entry.id, entry.amount, entry.currency
    );
    sink.publish(
        DomainEvent::new(EventKind::HoldCaptured, captured.user_id, captured.id)
            .with_amount(captured.amount, &captured.currency),
    );
    Ok(Capture {
        hold: captured,
        entry,
    })
}

// ─────────────────────────────────────────────────────────
// Reads
// ─────────────────────────────────────────────────────────

pub async fn get(pool: &SqlitePool, hold_id: i64) -> Result<Hold> {
    sqlx::query_as::<_, Hold>("SELECT * FROM holds WHERE id = ?1")
        .bind(hold_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Hold {hold_id}")))
}

async fn fetch(conn: &mut SqliteConnection, hold_id: i64) -> Result<Hold> {
    sqlx::query_as::<_, Hold>("SELECT * FROM holds WHERE id = ?1")
        .bind(hold_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Hold {hold_id}")))
}

async fn find_by_reference(conn: &mut SqliteConnection, reference: &str) -> Result<Option<Hold>> {
    let row = sqlx::query_as::<_, Hold>("SELECT * FROM holds WHERE reference = ?1")
        .bind(reference)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row)
}

pub async fn list_for_user(
    pool: &SqlitePool,
    user_id: i64,
    status: Option<HoldStatus>,
) -> Result<Vec<Hold>> {
    let rows = sqlx::query_as::<_, Hold>(
        r#"
        SELECT * FROM holds
        WHERE  user_id = ?1 AND (?2 IS NULL OR status = ?2)
        ORDER  BY id ASC
        "#,
    )
    .bind(user_id)
    .bind(status.map(|s| s.as_str()))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Sum of active holds for (user, currency).
pub(crate) async fn reserved_total(
    conn: &mut SqliteConnection,
    user_id: i64,
    currency: &str,
) -> Result<Decimal> {
    // Amounts are decimal text, so the sum happens here rather than in SQL.
    let amounts: Vec<String> = sqlx::query_scalar(
        "SELECT amount FROM holds WHERE user_id = ?1 AND currency = ?2 AND status = ?3",
    )
    .bind(user_id)
    .bind(currency)
    .bind(HoldStatus::Active.as_str())
    .fetch_all(&mut *conn)
    .await?;

    sum_decimal_text("held amount", &amounts)
}

pub(crate) async fn summary_in(
    conn: &mut SqliteConnection,
    user_id: i64,
    currency: &str,
) -> Result<BalanceSummary> {
    let ledger_balance = ledger::balance(conn, user_id, currency).await?;
    let held = reserved_total(conn, user_id, currency).await?;
    Ok(BalanceSummary {
        user_id,
        currency: currency.to_string(),
        ledger_balance,
        held,
        available: checked_sub("available balance", ledger_balance, held)?,
    })
}

/// Ledger balance, held amount and what remains available.
pub async fn available_balance(
    pool: &SqlitePool,
    user_id: i64,
    currency: &str,
) -> Result<BalanceSummary> {
    let currency = normalize_currency(currency)?;
    let mut conn = pool.acquire().await?;
    summary_in(&mut conn, user_id, &currency).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelSink;
    use crate::ledger::tests::{fund, seed_user};

    fn new_hold(user_id: i64, amount: i64, reference: &str) -> NewHold {
        NewHold {
            user_id,
            amount: Decimal::new(amount, 0),
            currency: "USD".into(),
            reference: reference.into(),
            external_id: format!("ext-{reference}"),
            project_id: None,
        }
    }

    #[tokio::test]
    async fn hold_capture_walkthrough() {
        let pool = db::test_pool().await;
        let (sink, mut events) = ChannelSink::new();
        let user = seed_user(&pool, "buyer@example.com").await;
        fund(&pool, user, 100, "dep-1").await;

        let first = create_hold(&pool, &sink, new_hold(user, 80, "h-1")).await.unwrap();
        assert_eq!(first.status, HoldStatus::Active);

        let summary = available_balance(&pool, user, "USD").await.unwrap();
        assert_eq!(summary.ledger_balance, Decimal::new(100, 0));
        assert_eq!(summary.held, Decimal::new(80, 0));
        assert_eq!(summary.available, Decimal::new(20, 0));

        let err = create_hold(&pool, &sink, new_hold(user, 30, "h-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InsufficientFunds { .. }));

        let capture = capture(&pool, &sink, first.id).await.unwrap();
        assert_eq!(capture.hold.status, HoldStatus::Captured);
        assert!(capture.hold.captured_at.is_some());
        assert_eq!(capture.entry.entry_type, EntryType::Debit);
        assert_eq!(capture.entry.amount, Decimal::new(80, 0));
        assert_eq!(capture.entry.hold_id, Some(first.id));

        let summary = available_balance(&pool, user, "USD").await.unwrap();
        assert_eq!(summary.ledger_balance, Decimal::new(20, 0));
        assert_eq!(summary.available, Decimal::new(20, 0));

        assert_eq!(events.recv().await.unwrap().kind, EventKind::HoldCreated);
        assert_eq!(events.recv().await.unwrap().kind, EventKind::HoldCaptured);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn release_is_idempotent_and_frees_funds() {
        let pool = db::test_pool().await;
        let (sink, mut events) = ChannelSink::new();
        let user = seed_user(&pool, "buyer@example.com").await;
        fund(&pool, user, 50, "dep-1").await;

        let hold = create_hold(&pool, &sink, new_hold(user, 50, "h-1")).await.unwrap();
        let released = release(&pool, &sink, hold.id).await.unwrap();
        assert_eq!(released.status, HoldStatus::Released);

        let again = release(&pool, &sink, hold.id).await.unwrap();
        assert_eq!(again, released);

        let summary = available_balance(&pool, user, "USD").await.unwrap();
        assert_eq!(summary.available, Decimal::new(50, 0));

        let kinds: Vec<EventKind> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![EventKind::HoldCreated, EventKind::HoldReleased]);
    }

    #[tokio::test]
    async fn terminal_holds_reject_capture_and_keep_state() {
        let pool = db::test_pool().await;
        let (sink, _events) = ChannelSink::new();
        let user = seed_user(&pool, "buyer@example.com").await;
        fund(&pool, user, 100, "dep-1").await;

        let released = create_hold(&pool, &sink, new_hold(user, 10, "h-1")).await.unwrap();
        release(&pool, &sink, released.id).await.unwrap();
        let err = capture(&pool, &sink, released.id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidStateTransition { .. }));
        assert_eq!(get(&pool, released.id).await.unwrap().status, HoldStatus::Released);

        let captured = create_hold(&pool, &sink, new_hold(user, 10, "h-2")).await.unwrap();
        capture(&pool, &sink, captured.id).await.unwrap();
        let err = capture(&pool, &sink, captured.id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidStateTransition { .. }));
        let err = release(&pool, &sink, captured.id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidStateTransition { .. }));

        // One capture debit only.
        let debits = ledger::entries(&pool, user, Some("USD"))
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.entry_type == EntryType::Debit)
            .count();
        assert_eq!(debits, 1);
    }

    #[tokio::test]
    async fn ledger_debits_cannot_spend_held_funds() {
        let pool = db::test_pool().await;
        let (sink, _events) = ChannelSink::new();
        let user = seed_user(&pool, "buyer@example.com").await;
        fund(&pool, user, 100, "dep-1").await;
        create_hold(&pool, &sink, new_hold(user, 70, "h-1")).await.unwrap();

        let err = ledger::post(
            &pool,
            PostEntry::new(user, EntryType::Debit, Decimal::new(31, 0), "USD", "wd-1"),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            AppError::InsufficientFunds { available, .. } if available == Decimal::new(30, 0)
        ));

        let summary = available_balance(&pool, user, "USD").await.unwrap();
        assert!(summary.available >= Decimal::ZERO);
        assert_eq!(summary.available, summary.ledger_balance - summary.held);
    }

    #[tokio::test]
    async fn replayed_hold_request_returns_existing_hold() {
        let pool = db::test_pool().await;
        let (sink, _events) = ChannelSink::new();
        let user = seed_user(&pool, "buyer@example.com").await;
        fund(&pool, user, 100, "dep-1").await;

        let first = create_hold(&pool, &sink, new_hold(user, 40, "h-1")).await.unwrap();
        let replay = create_hold(&pool, &sink, new_hold(user, 40, "h-1")).await.unwrap();
        assert_eq!(first, replay);
        assert_eq!(list_for_user(&pool, user, None).await.unwrap().len(), 1);

        let err = create_hold(&pool, &sink, new_hold(user, 41, "h-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let pool = db::test_pool().await;
        let (sink, _events) = ChannelSink::new();
        let user = seed_user(&pool, "buyer@example.com").await;
        fund(&pool, user, 100, "dep-1").await;

        let a = create_hold(&pool, &sink, new_hold(user, 10, "h-1")).await.unwrap();
        create_hold(&pool, &sink, new_hold(user, 10, "h-2")).await.unwrap();
        release(&pool, &sink, a.id).await.unwrap();

        let active = list_for_user(&pool, user, Some(HoldStatus::Active)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].reference, "h-2");
    }

    #[tokio::test]
    async fn missing_hold_is_not_found() {
        let pool = db::test_pool().await;
        let (sink, _events) = ChannelSink::new();
        assert!(matches!(
            capture(&pool, &sink, 12).await.unwrap_err(),
            AppError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn concurrent_holds_never_overcommit() {
        let (pool, _dir) = db::concurrent_test_pool().await;
        let user = seed_user(&pool, "buyer@example.com").await;
        fund(&pool, user, 100, "dep-1").await;
        let (sink, _events) = ChannelSink::new();
        let sink = std::sync::Arc::new(sink);

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..10 {
            let pool = pool.clone();
            let sink = sink.clone();
            tasks.spawn(async move {
                create_hold(&pool, sink.as_ref(), new_hold(user, 30, &format!("h-{i}"))).await
            });
        }

        let mut created = 0;
        while let Some(result) = tasks.join_next().await {
            match result.unwrap() {
                Ok(_) => created += 1,
                Err(AppError::InsufficientFunds { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(created, 3);

        let summary = available_balance(&pool, user, "USD").await.unwrap();
        assert_eq!(summary.held, Decimal::new(90, 0));
        assert_eq!(summary.available, Decimal::new(10, 0));
    }
}
