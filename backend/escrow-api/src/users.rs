//! Platform accounts.

use serde::{Deserialize, Serialize};
use sqlx::error::ErrorKind;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqlitePool};
use tracing::info;

use crate::errors::{AppError, Result};
use crate::types::{now_millis, parse_column, require_non_empty, string_enum};

string_enum! {
    pub enum Role {
        Admin => "admin",
        Client => "client",
        Freelancer => "freelancer",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub created_at: i64,
    pub updated_at: i64,
}

impl<'r> FromRow<'r, SqliteRow> for User {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            role: parse_column(row, "role")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<Role>,
}

fn normalize_email(raw: &str) -> Result<String> {
    let email = require_non_empty("email", raw)?.to_ascii_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(email),
        _ => Err(AppError::Validation(format!("{raw:?} is not an email address"))),
    }
}

pub async fn create(pool: &SqlitePool, req: NewUser) -> Result<User> {
    let name = require_non_empty("name", &req.name)?;
    let email = normalize_email(&req.email)?;
    let now = now_millis();

    let user = sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (name, email, role, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?4)
        RETURNING *
        "#,
    )
    .bind(&name)
    .bind(&email)
    .bind(req.role.as_str())
    .bind(now)
    .fetch_one(pool)
    .await?;

    info!("User {} created ({})", user.id, user.role);
    Ok(user)
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<User> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User {id}")))
}

pub async fn list(pool: &SqlitePool) -> Result<Vec<User>> {
    let rows = sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY id ASC")
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn update(pool: &SqlitePool, id: i64, patch: UserUpdate) -> Result<User> {
    let name = patch
        .name
        .as_deref()
        .map(|n| require_non_empty("name", n))
        .transpose()?;
    let email = patch.email.as_deref().map(normalize_email).transpose()?;

    sqlx::query_as::<_, User>(
        r#"
        UPDATE users
        SET    name       = COALESCE(?1, name),
               email      = COALESCE(?2, email),
               role       = COALESCE(?3, role),
               updated_at = ?4
        WHERE  id = ?5
        RETURNING *
        "#,
    )
    .bind(name)
    .bind(email)
    .bind(patch.role.map(|r| r.as_str()))
    .bind(now_millis())
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("User {id}")))
}

/// Delete an account. Users that still own ledger history, holds,
/// projects or wallets cannot be removed.
pub async fn delete(pool: &SqlitePool, id: i64) -> Result<()> {
    let result = sqlx::query("DELETE FROM users WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await;

    match result {
        Ok(done) if done.rows_affected() == 0 => Err(AppError::NotFound(format!("User {id}"))),
        Ok(_) => {
            info!("User {id} deleted");
            Ok(())
        }
        Err(sqlx::Error::Database(db)) if db.kind() == ErrorKind::ForeignKeyViolation => Err(
            AppError::Conflict(format!("user {id} is still referenced by other records")),
        ),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::ledger::tests::{fund, seed_user};

    fn new_user(email: &str) -> NewUser {
        NewUser {
            name: "Ada".into(),
            email: email.into(),
            role: Role::Freelancer,
        }
    }

    #[tokio::test]
    async fn create_and_fetch() {
        let pool = db::test_pool().await;
        let user = create(&pool, new_user("Ada@Example.com")).await.unwrap();
        assert_eq!(user.email, "ada@example.com");
        assert_eq!(get(&pool, user.id).await.unwrap(), user);
        assert_eq!(list(&pool).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() {
        let pool = db::test_pool().await;
        create(&pool, new_user("ada@example.com")).await.unwrap();
        let err = create(&pool, new_user("ADA@example.com")).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn invalid_email_is_rejected() {
        let pool = db::test_pool().await;
        let err = create(&pool, new_user("not-an-email")).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn update_patches_only_given_fields() {
        let pool = db::test_pool().await;
        let user = create(&pool, new_user("ada@example.com")).await.unwrap();

        let updated = update(
            &pool,
            user.id,
            UserUpdate {
                role: Some(Role::Admin),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.role, Role::Admin);
        assert_eq!(updated.name, "Ada");
        assert_eq!(updated.email, user.email);

        let err = update(&pool, 999, UserUpdate::default()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn update_rejects_unknown_fields() {
        assert!(serde_json::from_str::<UserUpdate>(r#"{"balance_version": 3}"#).is_err());
    }

    #[tokio::test]
    async fn delete_refuses_users_with_history() {
        let pool = db::test_pool().await;
        let user = seed_user(&pool, "funded@example.com").await;
        fund(&pool, user, 10, "dep-1").await;

        let err = delete(&pool, user).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let fresh = create(&pool, new_user("fresh@example.com")).await.unwrap();
        delete(&pool, fresh.id).await.unwrap();
        assert!(matches!(
            get(&pool, fresh.id).await.unwrap_err(),
            AppError::NotFound(_)
        ));
    }
}
