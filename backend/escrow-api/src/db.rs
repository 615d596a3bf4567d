//! Database layer — pool setup, migrations and the per-user balance lock.

use std::str::FromStr;
use std::time::Duration;

use sqlx::error::ErrorKind;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

use crate::config::Config;
use crate::errors::{AppError, Result};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(config: &Config) -> Result<SqlitePool> {
    // Make sure the file is created if it doesn't exist yet.
    let url = if config.database_url.starts_with("sqlite:") {
        config.database_url.clone()
    } else {
        format!("sqlite:{}", config.database_url)
    };

    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_millis(config.db_busy_timeout_ms));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations applied successfully");
    Ok(())
}

/// Take the write lock for `user_id` inside the caller's transaction.
///
/// Must be the first statement of the transaction: SQLite hands out its
/// write lock on the first write, so every balance read that follows sees
/// the latest committed state and no other writer can interleave until
/// commit. Also serves as the existence check for the user.
pub async fn lock_user(conn: &mut SqliteConnection, user_id: i64) -> Result<()> {
    let rows = sqlx::query("UPDATE users SET balance_version = balance_version + 1 WHERE id = ?1")
        .bind(user_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    if rows == 0 {
        return Err(AppError::NotFound(format!("User {user_id}")));
    }
    Ok(())
}

/// True when `err` is a UNIQUE / PRIMARY KEY violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.kind() == ErrorKind::UniqueViolation)
}

/// Single-connection in-memory database with the schema applied.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .expect("valid in-memory url")
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .expect("in-memory pool");

    migrate(&pool).await.expect("migrations apply");
    pool
}

/// File-backed WAL pool with several connections, for tests that race
/// writers against each other. Keep the directory alive as long as the pool.
#[cfg(test)]
pub async fn concurrent_test_pool() -> (SqlitePool, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = Config {
        database_url: dir.path().join("escrow.db").display().to_string(),
        db_max_connections: 8,
        db_busy_timeout_ms: 10_000,
        ..Config::from_lookup(|_| None).expect("default config")
    };
    let pool = init_pool(&config).await.expect("file-backed pool");
    (pool, dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_user_rejects_unknown_user() {
        let pool = test_pool().await;
        let mut tx = pool.begin().await.unwrap();
        let err = lock_user(&mut tx, 404).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn lock_user_bumps_balance_version() {
        let pool = test_pool().await;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO users (name, email, role, created_at, updated_at)
             VALUES ('Ada', 'ada@example.com', 'client', 0, 0) RETURNING id",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        let mut tx = pool.begin().await.unwrap();
        lock_user(&mut tx, id).await.unwrap();
        tx.commit().await.unwrap();

        let version: i64 = sqlx::query_scalar("SELECT balance_version FROM users WHERE id = ?1")
            .bind(id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(version, 1);
    }
}
