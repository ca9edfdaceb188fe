//! SQLite TimelineRepository implementation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Expr, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use super::repository::TimelineRepository;
use super::{EventTypeRecord, Result, Timeline, TimelineError, TimelineState};
use crate::cursor::Offset;
use crate::storage::schema::{EventTypes, Timelines, CREATE_TIMELINE_TABLES};

/// SQLite implementation of `TimelineRepository`.
pub struct SqliteTimelineRepository {
    pool: SqlitePool,
}

impl SqliteTimelineRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the metadata tables if they do not exist.
    pub async fn init(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_TIMELINE_TABLES)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert(conn: &mut SqliteConnection, timeline: &Timeline) -> Result<()> {
        let query = Query::insert()
            .into_table(Timelines::Table)
            .columns([
                Timelines::Id,
                Timelines::EventType,
                Timelines::TimelineOrder,
                Timelines::StorageId,
                Timelines::PhysicalLogId,
                Timelines::State,
                Timelines::CreatedAt,
                Timelines::SwitchedAt,
                Timelines::CleanupAt,
                Timelines::SealedEnd,
            ])
            .values_panic([
                timeline.id.as_str().into(),
                timeline.event_type.as_str().into(),
                timeline.order.into(),
                timeline.storage_id.as_str().into(),
                timeline.physical_log_id.as_str().into(),
                timeline.state.as_str().into(),
                timeline.created_at.to_rfc3339().into(),
                timeline.switched_at.map(|t| t.to_rfc3339()).into(),
                timeline.cleanup_at.map(|t| t.to_rfc3339()).into(),
                timeline.sealed_end.as_deref().map(encode_ends).into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&mut *conn).await?;
        Ok(())
    }

    async fn update(conn: &mut SqliteConnection, timeline: &Timeline) -> Result<()> {
        let query = Query::update()
            .table(Timelines::Table)
            .values([
                (Timelines::State, timeline.state.as_str().into()),
                (
                    Timelines::SwitchedAt,
                    timeline.switched_at.map(|t| t.to_rfc3339()).into(),
                ),
                (
                    Timelines::CleanupAt,
                    timeline.cleanup_at.map(|t| t.to_rfc3339()).into(),
                ),
                (
                    Timelines::SealedEnd,
                    timeline.sealed_end.as_deref().map(encode_ends).into(),
                ),
            ])
            .and_where(Expr::col(Timelines::Id).eq(timeline.id.as_str()))
            .to_string(SqliteQueryBuilder);

        let updated = sqlx::query(&query)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(TimelineError::Repository(format!(
                "timeline {} does not exist",
                timeline.id
            )));
        }
        Ok(())
    }
}

fn encode_ends(ends: &[Offset]) -> String {
    ends.iter()
        .map(|o| o.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn decode_ends(raw: &str) -> Result<Vec<Offset>> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|s| {
            s.parse::<Offset>()
                .map_err(|e| TimelineError::Repository(format!("bad sealed end {:?}: {}", raw, e)))
        })
        .collect()
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TimelineError::Repository(format!("bad timestamp {:?}: {}", raw, e)))
}

fn parse_optional_time(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_time).transpose()
}

fn event_type_from_row(row: &SqliteRow) -> Result<EventTypeRecord> {
    let partitions: i64 = row.get("partitions");
    let retention_ms: i64 = row.get("retention_ms");
    let created_at: String = row.get("created_at");
    Ok(EventTypeRecord {
        name: row.get("name"),
        partitions: partitions as u32,
        storage_id: row.get("storage_id"),
        base_log_id: row.get("base_log_id"),
        retention: Duration::from_millis(retention_ms.max(0) as u64),
        created_at: parse_time(&created_at)?,
    })
}

fn timeline_from_row(row: &SqliteRow) -> Result<Timeline> {
    let order: i64 = row.get("timeline_order");
    let state: String = row.get("state");
    let created_at: String = row.get("created_at");
    let sealed_end: Option<String> = row.get("sealed_end");
    Ok(Timeline {
        id: row.get("id"),
        event_type: row.get("event_type"),
        order: order as u32,
        storage_id: row.get("storage_id"),
        physical_log_id: row.get("physical_log_id"),
        state: TimelineState::parse(&state)
            .ok_or_else(|| TimelineError::Repository(format!("unknown state {:?}", state)))?,
        created_at: parse_time(&created_at)?,
        switched_at: parse_optional_time(row.get("switched_at"))?,
        cleanup_at: parse_optional_time(row.get("cleanup_at"))?,
        sealed_end: sealed_end.as_deref().map(decode_ends).transpose()?,
    })
}

#[async_trait]
impl TimelineRepository for SqliteTimelineRepository {
    async fn create_event_type(&self, record: &EventTypeRecord) -> Result<()> {
        if self.get_event_type(&record.name).await?.is_some() {
            return Err(TimelineError::EventTypeExists {
                event_type: record.name.clone(),
            });
        }

        let query = Query::insert()
            .into_table(EventTypes::Table)
            .columns([
                EventTypes::Name,
                EventTypes::Partitions,
                EventTypes::StorageId,
                EventTypes::BaseLogId,
                EventTypes::RetentionMs,
                EventTypes::CreatedAt,
            ])
            .values_panic([
                record.name.as_str().into(),
                record.partitions.into(),
                record.storage_id.as_str().into(),
                record.base_log_id.as_str().into(),
                (record.retention.as_millis() as i64).into(),
                record.created_at.to_rfc3339().into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn get_event_type(&self, name: &str) -> Result<Option<EventTypeRecord>> {
        let query = Query::select()
            .columns([
                EventTypes::Name,
                EventTypes::Partitions,
                EventTypes::StorageId,
                EventTypes::BaseLogId,
                EventTypes::RetentionMs,
                EventTypes::CreatedAt,
            ])
            .from(EventTypes::Table)
            .and_where(Expr::col(EventTypes::Name).eq(name))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(event_type_from_row).transpose()
    }

    async fn list_event_types(&self) -> Result<Vec<EventTypeRecord>> {
        let query = Query::select()
            .columns([
                EventTypes::Name,
                EventTypes::Partitions,
                EventTypes::StorageId,
                EventTypes::BaseLogId,
                EventTypes::RetentionMs,
                EventTypes::CreatedAt,
            ])
            .from(EventTypes::Table)
            .order_by(EventTypes::Name, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(event_type_from_row).collect()
    }

    async fn list_timelines(&self, event_type: &str) -> Result<Vec<Timeline>> {
        let query = Query::select()
            .columns([
                Timelines::Id,
                Timelines::EventType,
                Timelines::TimelineOrder,
                Timelines::StorageId,
                Timelines::PhysicalLogId,
                Timelines::State,
                Timelines::CreatedAt,
                Timelines::SwitchedAt,
                Timelines::CleanupAt,
                Timelines::SealedEnd,
            ])
            .from(Timelines::Table)
            .and_where(Expr::col(Timelines::EventType).eq(event_type))
            .order_by(Timelines::TimelineOrder, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(timeline_from_row).collect()
    }

    async fn commit(&self, inserts: &[Timeline], updates: &[Timeline]) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = async {
            for timeline in updates {
                Self::update(&mut conn, timeline).await?;
            }
            for timeline in inserts {
                Self::insert(&mut conn, timeline).await?;
            }
            Ok::<_, TimelineError>(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(())
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn storage_in_use(&self, storage_id: &str) -> Result<bool> {
        let timelines = Query::select()
            .expr(Expr::col(Timelines::Id).count())
            .from(Timelines::Table)
            .and_where(Expr::col(Timelines::StorageId).eq(storage_id))
            .and_where(Expr::col(Timelines::State).ne(TimelineState::Deleted.as_str()))
            .to_string(SqliteQueryBuilder);
        let count: i64 = sqlx::query(&timelines).fetch_one(&self.pool).await?.get(0);
        if count > 0 {
            return Ok(true);
        }

        let never_switched = Query::select()
            .expr(Expr::col((EventTypes::Table, EventTypes::Name)).count())
            .from(EventTypes::Table)
            .and_where(Expr::col((EventTypes::Table, EventTypes::StorageId)).eq(storage_id))
            .and_where(
                Expr::col((EventTypes::Table, EventTypes::Name)).not_in_subquery(
                    Query::select()
                        .column(Timelines::EventType)
                        .from(Timelines::Table)
                        .and_where(Expr::col(Timelines::SwitchedAt).is_not_null())
                        .to_owned(),
                ),
            )
            .to_string(SqliteQueryBuilder);
        let count: i64 = sqlx::query(&never_switched)
            .fetch_one(&self.pool)
            .await?
            .get(0);
        Ok(count > 0)
    }
}
