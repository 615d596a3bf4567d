//! Identity verification submissions.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqlitePool};
use tracing::info;

use crate::db;
use crate::errors::{AppError, Result};
use crate::types::{now_millis, parse_column, require_non_empty, string_enum};

string_enum! {
    pub enum KycStatus {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KycSubmission {
    pub id: i64,
    pub user_id: i64,
    pub document_type: String,
    pub document_number: String,
    pub status: KycStatus,
    pub rejection_reason: Option<String>,
    pub submitted_at: i64,
    pub reviewed_at: Option<i64>,
}

impl<'r> FromRow<'r, SqliteRow> for KycSubmission {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            document_type: row.try_get("document_type")?,
            document_number: row.try_get("document_number")?,
            status: parse_column(row, "status")?,
            rejection_reason: row.try_get("rejection_reason")?,
            submitted_at: row.try_get("submitted_at")?,
            reviewed_at: row.try_get("reviewed_at")?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSubmission {
    pub user_id: i64,
    pub document_type: String,
    pub document_number: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Review {
    pub decision: Decision,
    #[serde(default)]
    pub reason: Option<String>,
}

/// File a submission. A user may have only one awaiting review.
pub async fn submit(pool: &SqlitePool, req: NewSubmission) -> Result<KycSubmission> {
    let document_type = require_non_empty("document_type", &req.document_type)?;
    let document_number = require_non_empty("document_number", &req.document_number)?;

    let inserted = sqlx::query_as::<_, KycSubmission>(
        r#"
        INSERT INTO kyc_submissions
            (user_id, document_type, document_number, status, submitted_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        RETURNING *
        "#,
    )
    .bind(req.user_id)
    .bind(&document_type)
    .bind(&document_number)
    .bind(KycStatus::Pending.as_str())
    .bind(now_millis())
    .fetch_one(pool)
    .await;

    match inserted {
        Ok(submission) => {
            info!("KYC submission {} filed for user {}", submission.id, submission.user_id);
            Ok(submission)
        }
        Err(e) if db::is_unique_violation(&e) => Err(AppError::Conflict(format!(
            "user {} already has a submission awaiting review",
            req.user_id
        ))),
        Err(e) => Err(e.into()),
    }
}

pub async fn review(pool: &SqlitePool, id: i64, review: Review) -> Result<KycSubmission> {
    let (status, reason) = match review.decision {
        Decision::Approve => (KycStatus::Approved, None),
        Decision::Reject => {
            let reason = review
                .reason
                .as_deref()
                .map(|r| require_non_empty("reason", r))
                .transpose()?
                .ok_or_else(|| {
                    AppError::Validation("a reason is required when rejecting".to_string())
                })?;
            (KycStatus::Rejected, Some(reason))
        }
    };

    let current = get(pool, id).await?;
    if current.status != KycStatus::Pending {
        return Err(AppError::invalid_transition("kyc submission", current.status, status));
    }

    let reviewed = sqlx::query_as::<_, KycSubmission>(
        r#"
        UPDATE kyc_submissions
        SET    status = ?1, rejection_reason = ?2, reviewed_at = ?3
        WHERE  id = ?4 AND status = 'pending'
        RETURNING *
        "#,
    )
    .bind(status.as_str())
    .bind(reason)
    .bind(now_millis())
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::Conflict(format!("KYC submission {id} was reviewed concurrently")))?;

    info!("KYC submission {id} {}", reviewed.status);
    Ok(reviewed)
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<KycSubmission> {
    sqlx::query_as::<_, KycSubmission>("SELECT * FROM kyc_submissions WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("KYC submission {id}")))
}

pub async fn list_for_user(pool: &SqlitePool, user_id: i64) -> Result<Vec<KycSubmission>> {
    let rows = sqlx::query_as::<_, KycSubmission>(
        "SELECT * FROM kyc_submissions WHERE user_id = ?1 ORDER BY submitted_at DESC, id DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
