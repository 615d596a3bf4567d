//! Escrow projects: the agreement between a buyer and a seller that
//! milestones, holds and transactions hang off.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqliteConnection, SqlitePool};
use tracing::info;

use crate::errors::{AppError, Result};
use crate::milestones;
use crate::types::{
    decimal_text, normalize_currency, now_millis, parse_column, require_non_empty,
    require_positive, string_enum,
};

string_enum! {
    pub enum ProjectStatus {
        Draft => "draft",
        Active => "active",
        Completed => "completed",
        Cancelled => "cancelled",
        Disputed => "disputed",
    }
}

impl ProjectStatus {
    pub fn can_transition_to(self, next: Self) -> bool {
        use ProjectStatus::*;
        matches!(
            (self, next),
            (Draft, Active | Cancelled)
                | (Active, Completed | Cancelled | Disputed)
                | (Disputed, Active | Completed | Cancelled)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Project {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub creator_id: i64,
    pub buyer_id: Option<i64>,
    pub seller_id: Option<i64>,
    pub total_amount: Decimal,
    pub currency: String,
    pub status: ProjectStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl<'r> FromRow<'r, SqliteRow> for Project {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            creator_id: row.try_get("creator_id")?,
            buyer_id: row.try_get("buyer_id")?,
            seller_id: row.try_get("seller_id")?,
            total_amount: parse_column(row, "total_amount")?,
            currency: row.try_get("currency")?,
            status: parse_column(row, "status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewProject {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub creator_id: i64,
    #[serde(default)]
    pub buyer_id: Option<i64>,
    #[serde(default)]
    pub seller_id: Option<i64>,
    pub total_amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub buyer_id: Option<i64>,
    pub seller_id: Option<i64>,
    pub total_amount: Option<Decimal>,
    pub status: Option<ProjectStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectFilter {
    pub user_id: Option<i64>,
    pub status: Option<ProjectStatus>,
}

pub async fn create(pool: &SqlitePool, req: NewProject) -> Result<Project> {
    let title = require_non_empty("title", &req.title)?;
    require_positive("total_amount", req.total_amount)?;
    let currency = normalize_currency(&req.currency)?;
    if req.buyer_id.is_some() && req.buyer_id == req.seller_id {
        return Err(AppError::Validation(
            "buyer and seller must be different users".to_string(),
        ));
    }
    let now = now_millis();

    let project = sqlx::query_as::<_, Project>(
        r#"
        INSERT INTO projects
            (title, description, creator_id, buyer_id, seller_id, total_amount,
             currency, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
        RETURNING *
        "#,
    )
    .bind(&title)
    .bind(&req.description)
    .bind(req.creator_id)
    .bind(req.buyer_id)
    .bind(req.seller_id)
    .bind(decimal_text(req.total_amount))
    .bind(&currency)
    .bind(ProjectStatus::Draft.as_str())
    .bind(now)
    .fetch_one(pool)
    .await?;

    info!(
        "Project {} created by user {}: {} {}",
        project.id, project.creator_id, project.total_amount, project.currency
    );
    Ok(project)
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Project> {
    let mut conn = pool.acquire().await?;
    get_in(&mut conn, id).await
}

async fn get_in(conn: &mut SqliteConnection, id: i64) -> Result<Project> {
    sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Project {id}")))
}

/// Projects a user takes part in (as creator, buyer or seller), optionally
/// narrowed by status.
pub async fn list(pool: &SqlitePool, filter: &ProjectFilter) -> Result<Vec<Project>> {
    let rows = sqlx::query_as::<_, Project>(
        r#"
        SELECT * FROM projects
        WHERE  (?1 IS NULL OR creator_id = ?1 OR buyer_id = ?1 OR seller_id = ?1)
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

/// Apply a partial update.
///
/// Runs under the project lock that milestone writers take, so the total
/// and the milestone allocation are checked against each other atomically.
pub async fn update(pool: &SqlitePool, id: i64, patch: ProjectUpdate) -> Result<Project> {
    let mut tx = pool.begin().await?;
    milestones::lock_project(&mut tx, id).await?;
    let current = get_in(&mut tx, id).await?;

    let title = patch
        .title
        .as_deref()
        .map(|t| require_non_empty("title", t))
        .transpose()?
        .unwrap_or(current.title);

    if let Some(next) = patch.status {
        if next != current.status && !current.status.can_transition_to(next) {
            return Err(AppError::invalid_transition("project", current.status, next));
        }
    }
    let status = patch.status.unwrap_or(current.status);

    let total = patch.total_amount.unwrap_or(current.total_amount);
    require_positive("total_amount", total)?;
    if total < current.total_amount {
        let allocated = milestones::allocated_in(&mut tx, id, None).await?;
        if allocated > total {
            return Err(AppError::Validation(format!(
                "total_amount {total} is below the {allocated} already allocated to milestones"
            )));
        }
    }

    let buyer_id = patch.buyer_id.or(current.buyer_id);
    let seller_id = patch.seller_id.or(current.seller_id);
    if buyer_id.is_some() && buyer_id == seller_id {
        return Err(AppError::Validation(
            "buyer and seller must be different users".to_string(),
        ));
    }

    let updated = sqlx::query_as::<_, Project>(
        r#"
        UPDATE projects
        SET    title = ?1, description = ?2, buyer_id = ?3, seller_id = ?4,
               total_amount = ?5, status = ?6, updated_at = ?7
        WHERE  id = ?8 AND status = ?9
        RETURNING *
        "#,
    )
    .bind(&title)
    .bind(patch.description.or(current.description))
    .bind(buyer_id)
    .bind(seller_id)
    .bind(decimal_text(total))
    .bind(status.as_str())
    .bind(now_millis())
    .bind(id)
    .bind(current.status.as_str())
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| AppError::Conflict(format!("project {id} changed status during update")))?;
    tx.commit().await?;

    if updated.status != current.status {
        info!("Project {id}: {} -> {}", current.status, updated.status);
    }
    Ok(updated)
}

/// Delete a project and its milestones. Holds and transactions that
/// referenced it are kept and detached.
pub async fn delete(pool: &SqlitePool, id: i64) -> Result<()> {
    let rows = sqlx::query("DELETE FROM projects WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    if rows == 0 {
        return Err(AppError::NotFound(format!("Project {id}")));
    }
    info!("Project {id} deleted");
    Ok(())
}
