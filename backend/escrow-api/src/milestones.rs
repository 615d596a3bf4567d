//! Project milestones.
//!
//! ```text
//! pending ──► in_progress ──► completed ──► approved
//!                                  ├──────► rejected
//!                                  └──────► disputed ──► approved | rejected
//! ```
//!
//! The amounts of a project's milestones never add up to more than the
//! project total. Writers take the project row first so two concurrent
//! creates cannot both pass the check.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqliteConnection, SqlitePool};
use tracing::info;

use crate::errors::{AppError, Result};
use crate::types::{
    checked_add, decimal_text, now_millis, parse_column, require_non_empty, require_positive,
    string_enum, sum_decimal_text,
};

string_enum! {
    pub enum MilestoneStatus {
        Pending => "pending",
        InProgress => "in_progress",
        Completed => "completed",
        Approved => "approved",
        Rejected => "rejected",
        Disputed => "disputed",
    }
}

impl MilestoneStatus {
    pub fn can_transition_to(self, next: Self) -> bool {
        use MilestoneStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (Completed, Approved | Rejected | Disputed)
                | (Disputed, Approved | Rejected)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Milestone {
    pub id: i64,
    pub project_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub amount: Decimal,
    pub status: MilestoneStatus,
    pub is_paid: bool,
    pub due_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl<'r> FromRow<'r, SqliteRow> for Milestone {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            amount: parse_column(row, "amount")?,
            status: parse_column(row, "status")?,
            is_paid: row.try_get("is_paid")?,
            due_at: row.try_get("due_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewMilestone {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub amount: Decimal,
    #[serde(default)]
    pub due_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MilestoneUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub amount: Option<Decimal>,
    pub due_at: Option<i64>,
}

/// Take the project's write lock and return its total. Must open the
/// transaction.
pub(crate) async fn lock_project(conn: &mut SqliteConnection, project_id: i64) -> Result<Decimal> {
    let row = sqlx::query(
        "UPDATE projects SET updated_at = updated_at WHERE id = ?1 RETURNING total_amount",
    )
    .bind(project_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("Project {project_id}")))?;
    Ok(parse_column(&row, "total_amount")?)
}

/// Sum of milestone amounts for a project, skipping `except`.
pub(crate) async fn allocated_in(
    conn: &mut SqliteConnection,
    project_id: i64,
    except: Option<i64>,
) -> Result<Decimal> {
    let amounts: Vec<String> = sqlx::query_scalar(
        "SELECT amount FROM milestones WHERE project_id = ?1 AND (?2 IS NULL OR id <> ?2)",
    )
    .bind(project_id)
    .bind(except)
    .fetch_all(&mut *conn)
    .await?;

    sum_decimal_text("milestone allocation", &amounts)
}

fn check_allocation(total: Decimal, allocated: Decimal, amount: Decimal) -> Result<()> {
    let allocated = checked_add("milestone allocation", allocated, amount)?;
    if allocated > total {
        return Err(AppError::Validation(format!(
            "milestones would total {allocated} but the project is worth {total}"
        )));
    }
    Ok(())
}

pub async fn create(pool: &SqlitePool, project_id: i64, req: NewMilestone) -> Result<Milestone> {
    let title = require_non_empty("title", &req.title)?;
    require_positive("amount", req.amount)?;

    let mut tx = pool.begin().await?;
    let total = lock_project(&mut tx, project_id).await?;
    let allocated = allocated_in(&mut tx, project_id, None).await?;
    check_allocation(total, allocated, req.amount)?;

    let now = now_millis();
    let milestone = sqlx::query_as::<_, Milestone>(
        r#"
        INSERT INTO milestones
            (project_id, title, description, amount, status, is_paid, due_at,
             created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?7)
        RETURNING *
        "#,
    )
    .bind(project_id)
    .bind(&title)
    .bind(&req.description)
    .bind(decimal_text(req.amount))
    .bind(MilestoneStatus::Pending.as_str())
    .bind(req.due_at)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    info!(
        "Milestone {} added to project {project_id}: {}",
        milestone.id, milestone.amount
    );
    Ok(milestone)
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Milestone> {
    sqlx::query_as::<_, Milestone>("SELECT * FROM milestones WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Milestone {id}")))
}

pub async fn list_for_project(pool: &SqlitePool, project_id: i64) -> Result<Vec<Milestone>> {
    let rows = sqlx::query_as::<_, Milestone>(
        "SELECT * FROM milestones WHERE project_id = ?1 ORDER BY id ASC",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn update(pool: &SqlitePool, id: i64, patch: MilestoneUpdate) -> Result<Milestone> {
    let title = patch
        .title
        .as_deref()
        .map(|t| require_non_empty("title", t))
        .transpose()?;
    if let Some(amount) = patch.amount {
        require_positive("amount", amount)?;
    }

    let project_id = get(pool, id).await?.project_id;

    let mut tx = pool.begin().await?;
    let total = lock_project(&mut tx, project_id).await?;
    let current = sqlx::query_as::<_, Milestone>("SELECT * FROM milestones WHERE id = ?1")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Milestone {id}")))?;

    if let Some(amount) = patch.amount {
        if current.is_paid && amount != current.amount {
            return Err(AppError::Conflict(format!(
                "milestone {id} is paid; its amount can no longer change"
            )));
        }
        let allocated = allocated_in(&mut tx, project_id, Some(id)).await?;
        check_allocation(total, allocated, amount)?;
    }

    let updated = sqlx::query_as::<_, Milestone>(
        r#"
        UPDATE milestones
        SET    title = ?1, description = ?2, amount = ?3, due_at = ?4, updated_at = ?5
        WHERE  id = ?6
        RETURNING *
        "#,
    )
    .bind(title.unwrap_or(current.title))
    .bind(patch.description.or(current.description))
    .bind(decimal_text(patch.amount.unwrap_or(current.amount)))
    .bind(patch.due_at.or(current.due_at))
    .bind(now_millis())
    .bind(id)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(updated)
}

pub async fn transition(pool: &SqlitePool, id: i64, next: MilestoneStatus) -> Result<Milestone> {
    let current = get(pool, id).await?;
    if current.status == next {
        return Ok(current);
    }
    if !current.status.can_transition_to(next) {
        return Err(AppError::invalid_transition("milestone", current.status, next));
    }

    let updated = sqlx::query_as::<_, Milestone>(
        r#"
        UPDATE milestones
        SET    status = ?1, updated_at = ?2
        WHERE  id = ?3 AND status = ?4
        RETURNING *
        "#,
    )
    .bind(next.as_str())
    .bind(now_millis())
    .bind(id)
    .bind(current.status.as_str())
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::Conflict(format!("milestone {id} changed status concurrently")))?;

    info!("Milestone {id}: {} -> {next}", current.status);
    Ok(updated)
}

/// Flag an approved milestone as paid out. Paying twice is a conflict.
pub async fn mark_paid(pool: &SqlitePool, id: i64) -> Result<Milestone> {
    let current = get(pool, id).await?;
    if current.status != MilestoneStatus::Approved {
        return Err(AppError::invalid_transition("milestone", current.status, "paid"));
    }
    if current.is_paid {
        return Err(AppError::Conflict(format!("milestone {id} is already paid")));
    }

    let updated = sqlx::query_as::<_, Milestone>(
        r#"
        UPDATE milestones
        SET    is_paid = 1, updated_at = ?1
        WHERE  id = ?2 AND status = 'approved' AND is_paid = 0
        RETURNING *
        "#,
    )
    .bind(now_millis())
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::Conflict(format!("milestone {id} is already paid")))?;

    info!("Milestone {id} paid: {}", updated.amount);
    Ok(updated)
}

pub async fn delete(pool: &SqlitePool, id: i64) -> Result<()> {
    let rows = sqlx::query("DELETE FROM milestones WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    if rows == 0 {
        return Err(AppError::NotFound(format!("Milestone {id}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::ledger::tests::seed_user;
    use crate::projects::{self, tests::seed_project};

    fn milestone(amount: i64) -> NewMilestone {
        NewMilestone {
            title: "Wireframes".into(),
            description: None,
            amount: Decimal::new(amount, 0),
            due_at: None,
        }
    }

    #[test]
    fn transition_table() {
        use MilestoneStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(Completed.can_transition_to(Disputed));
        assert!(Disputed.can_transition_to(Approved));
        assert!(!Pending.can_transition_to(Approved));
        assert!(!Approved.can_transition_to(Rejected));
        assert!(!Rejected.can_transition_to(Pending));
    }

    #[tokio::test]
    async fn allocation_cannot_exceed_project_total() {
        let pool = db::test_pool().await;
        let user = seed_user(&pool, "m@example.com").await;
        let project = seed_project(&pool, user, 100).await;

        create(&pool, project.id, milestone(60)).await.unwrap();
        let second = create(&pool, project.id, milestone(40)).await.unwrap();
        let err = create(&pool, project.id, milestone(1)).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        // Shrinking one milestone frees room for another.
        let err = update(
            &pool,
            second.id,
            MilestoneUpdate {
                amount: Some(Decimal::new(41, 0)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        update(
            &pool,
            second.id,
            MilestoneUpdate {
                amount: Some(Decimal::new(30, 0)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        create(&pool, project.id, milestone(10)).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(
            allocated_in(&mut conn, project.id, None).await.unwrap(),
            Decimal::new(100, 0)
        );
    }

    #[tokio::test]
    async fn project_total_cannot_drop_below_allocation() {
        let pool = db::test_pool().await;
        let user = seed_user(&pool, "m@example.com").await;
        let project = seed_project(&pool, user, 100).await;
        create(&pool, project.id, milestone(80)).await.unwrap();

        let err = projects::update(
            &pool,
            project.id,
            projects::ProjectUpdate {
                total_amount: Some(Decimal::new(50, 0)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn lifecycle_ends_in_single_payment() {
        let pool = db::test_pool().await;
        let user = seed_user(&pool, "m@example.com").await;
        let project = seed_project(&pool, user, 100).await;
        let m = create(&pool, project.id, milestone(50)).await.unwrap();

        let err = mark_paid(&pool, m.id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidStateTransition { .. }));

        let err = transition(&pool, m.id, MilestoneStatus::Approved)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidStateTransition { .. }));

        for next in [
            MilestoneStatus::InProgress,
            MilestoneStatus::Completed,
            MilestoneStatus::Disputed,
            MilestoneStatus::Approved,
        ] {
            assert_eq!(transition(&pool, m.id, next).await.unwrap().status, next);
        }

        let paid = mark_paid(&pool, m.id).await.unwrap();
        assert!(paid.is_paid);
        assert!(matches!(
            mark_paid(&pool, m.id).await.unwrap_err(),
            AppError::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn deleting_project_removes_milestones() {
        let pool = db::test_pool().await;
        let user = seed_user(&pool, "m@example.com").await;
        let project = seed_project(&pool, user, 100).await;
        let m = create(&pool, project.id, milestone(10)).await.unwrap();

        projects::delete(&pool, project.id).await.unwrap();
        assert!(matches!(
            get(&pool, m.id).await.unwrap_err(),
            AppError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn milestone_for_missing_project_is_not_found() {
        let pool = db::test_pool().await;
        let err = create(&pool, 9, milestone(10)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn racing_total_cut_and_new_milestone_keep_allocation_within_total() {
        let (pool, _dir) = db::concurrent_test_pool().await;
        let user = seed_user(&pool, "m@example.com").await;
        let project = seed_project(&pool, user, 100).await;
        create(&pool, project.id, milestone(50)).await.unwrap();

        let cut = projects::update(
            &pool,
            project.id,
            projects::ProjectUpdate {
                total_amount: Some(Decimal::new(60, 0)),
                ..Default::default()
            },
        );
        let add = create(&pool, project.id, milestone(40));
        let (cut, add) = tokio::join!(cut, add);
        assert!(cut.is_ok() != add.is_ok(), "exactly one writer wins");

        let total = projects::get(&pool, project.id).await.unwrap().total_amount;
        let mut conn = pool.acquire().await.unwrap();
        let allocated = allocated_in(&mut conn, project.id, None).await.unwrap();
        assert!(allocated <= total);
    }
}
