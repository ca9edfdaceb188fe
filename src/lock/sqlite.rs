//! SQLite lease locks, shared by every process using the same database.

use std::time::Duration;

use async_trait::async_trait;
use sea_query::{Expr, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};

use super::{LockService, Result};
use crate::storage::schema::{Locks, CREATE_LOCKS_TABLE};

// The conflict clause only takes over a lease that expired or that the caller
// already owns, so `rows_affected` tells whether the lock was obtained.
const TRY_ACQUIRE: &str = r#"
INSERT INTO locks (lock_key, holder, expires_at_ms) VALUES (?1, ?2, ?3)
ON CONFLICT (lock_key) DO UPDATE
    SET holder = excluded.holder, expires_at_ms = excluded.expires_at_ms
    WHERE locks.expires_at_ms <= ?4 OR locks.holder = excluded.holder
"#;

/// SQLite implementation of `LockService`.
pub struct SqliteLockService {
    pool: SqlitePool,
}

impl SqliteLockService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the lock table if it does not exist.
    pub async fn init(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_LOCKS_TABLE).execute(&self.pool).await?;
        Ok(())
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl LockService for SqliteLockService {
    async fn try_acquire(&self, key: &str, holder: &str, lease: Duration) -> Result<bool> {
        let now = now_ms();
        let expires_at = now + lease.as_millis() as i64;

        let result = sqlx::query(TRY_ACQUIRE)
            .bind(key)
            .bind(holder)
            .bind(expires_at)
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, key: &str, holder: &str) -> Result<()> {
        let query = Query::delete()
            .from_table(Locks::Table)
            .and_where(Expr::col(Locks::LockKey).eq(key))
            .and_where(Expr::col(Locks::Holder).eq(holder))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn is_held(&self, key: &str, holder: &str) -> Result<bool> {
        let query = Query::select()
            .column(Locks::ExpiresAtMs)
            .from(Locks::Table)
            .and_where(Expr::col(Locks::LockKey).eq(key))
            .and_where(Expr::col(Locks::Holder).eq(holder))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        Ok(row.is_some_and(|row| row.get::<i64, _>("expires_at_ms") > now_ms()))
    }
}
