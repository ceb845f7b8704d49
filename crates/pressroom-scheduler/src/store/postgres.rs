use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use sqlx::types::Json;
use uuid::Uuid;

use super::{AvailableWorker, ScheduleStore, ScheduledCall, Submission, TaskDispatcher, WorkerRegistry};

/// Create the `pressroom` schema and the tables the scheduler core shares
/// with the workers and the dispatch coordinator.
pub async fn ensure_schema(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    let statements = [
        "CREATE SCHEMA IF NOT EXISTS pressroom",
        r#"
        CREATE TABLE IF NOT EXISTS pressroom.schedule
        (
            id                   TEXT PRIMARY KEY,
            enabled              BOOLEAN NOT NULL DEFAULT TRUE,
            schedule             TEXT NOT NULL,
            task                 TEXT NOT NULL,
            args                 JSONB NOT NULL DEFAULT '[]',
            kwargs               JSONB NOT NULL DEFAULT '{}',
            options              JSONB NOT NULL DEFAULT '{}',
            last_run             TIMESTAMP,
            remaining_runs       BIGINT,
            consecutive_failures BIGINT NOT NULL DEFAULT 0,
            failure_threshold    BIGINT,
            last_updated         BIGINT NOT NULL DEFAULT 0
        )
        "#,
        "CREATE INDEX IF NOT EXISTS schedule_enabled_updated
             ON pressroom.schedule (enabled, last_updated)",
        r#"
        CREATE TABLE IF NOT EXISTS pressroom.worker
        (
            name             TEXT PRIMARY KEY,
            last_heartbeat   TIMESTAMP NOT NULL,
            num_reservations BIGINT NOT NULL DEFAULT 0
        )
        "#,
        "CREATE INDEX IF NOT EXISTS worker_last_heartbeat
             ON pressroom.worker (last_heartbeat)",
        r#"
        CREATE TABLE IF NOT EXISTS pressroom.task
        (
            id           UUID PRIMARY KEY,
            name         TEXT NOT NULL,
            args         JSONB NOT NULL DEFAULT '[]',
            kwargs       JSONB NOT NULL DEFAULT '{}',
            queue        TEXT NOT NULL,
            state        TEXT NOT NULL DEFAULT 'ready',
            submitted_at TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'utc')
        )
        "#,
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    id: String,
    enabled: bool,
    schedule: String,
    task: String,
    args: Json<serde_json::Value>,
    kwargs: Json<serde_json::Value>,
    options: Json<serde_json::Value>,
    last_run: Option<NaiveDateTime>,
    remaining_runs: Option<i64>,
    consecutive_failures: i64,
    failure_threshold: Option<i64>,
    last_updated: i64,
}

impl From<ScheduleRow> for ScheduledCall {
    fn from(row: ScheduleRow) -> Self {
        Self {
            id: row.id,
            enabled: row.enabled,
            schedule: row.schedule,
            task: row.task,
            args: row.args.0,
            kwargs: row.kwargs.0,
            options: row.options.0,
            last_run: row.last_run,
            remaining_runs: row.remaining_runs,
            consecutive_failures: row.consecutive_failures,
            failure_threshold: row.failure_threshold,
            last_updated: row.last_updated,
        }
    }
}

pub struct PgScheduleStore {
    pool: sqlx::PgPool,
}

impl PgScheduleStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleStore for PgScheduleStore {
    fn get_enabled(&self) -> BoxStream<'_, anyhow::Result<ScheduledCall>> {
        sqlx::query_as::<_, ScheduleRow>(
            "SELECT id, enabled, schedule, task, args, kwargs, options, last_run, \
                    remaining_runs, consecutive_failures, failure_threshold, last_updated
               FROM pressroom.schedule
              WHERE enabled",
        )
        .fetch(&self.pool)
        .map(|row| row.map(ScheduledCall::from).map_err(anyhow::Error::from))
        .boxed()
    }

    fn get_updated_since(&self, since: i64) -> BoxStream<'_, anyhow::Result<ScheduledCall>> {
        sqlx::query_as::<_, ScheduleRow>(
            "SELECT id, enabled, schedule, task, args, kwargs, options, last_run, \
                    remaining_runs, consecutive_failures, failure_threshold, last_updated
               FROM pressroom.schedule
              WHERE enabled AND last_updated > $1",
        )
        .bind(since)
        .fetch(&self.pool)
        .map(|row| row.map(ScheduledCall::from).map_err(anyhow::Error::from))
        .boxed()
    }

    async fn count_enabled(&self) -> anyhow::Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM pressroom.schedule WHERE enabled",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn count_updated_since(&self, since: i64) -> anyhow::Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM pressroom.schedule WHERE enabled AND last_updated > $1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn increment_failure_count(&self, schedule_id: &str) -> anyhow::Result<()> {
        // One statement, so the increment and the compare-and-disable cannot
        // interleave with a concurrent reset.
        sqlx::query(
            "UPDATE pressroom.schedule
                SET consecutive_failures = consecutive_failures + 1,
                    enabled = enabled
                        AND (failure_threshold IS NULL
                             OR consecutive_failures + 1 < failure_threshold),
                    last_updated = GREATEST(last_updated + 1, $2)
              WHERE id = $1",
        )
        .bind(schedule_id)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reset_failure_count(&self, schedule_id: &str) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE pressroom.schedule
                SET consecutive_failures = 0,
                    last_updated = GREATEST(last_updated + 1, $2)
              WHERE id = $1",
        )
        .bind(schedule_id)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_run(&self, schedule_id: &str, at: NaiveDateTime) -> anyhow::Result<()> {
        // The last finite run flips the row disabled in the same statement,
        // so the enabled-count probe stays in agreement with the snapshot.
        sqlx::query(
            "UPDATE pressroom.schedule
                SET last_run = $2,
                    remaining_runs = CASE
                        WHEN remaining_runs IS NULL THEN NULL
                        ELSE GREATEST(remaining_runs - 1, 0)
                    END,
                    enabled = enabled AND (remaining_runs IS NULL OR remaining_runs > 1)
              WHERE id = $1",
        )
        .bind(schedule_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

pub struct PgWorkerRegistry {
    pool: sqlx::PgPool,
}

impl PgWorkerRegistry {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkerRegistry for PgWorkerRegistry {
    async fn upsert(&self, name: &str, last_heartbeat: NaiveDateTime) -> anyhow::Result<bool> {
        let created = sqlx::query_scalar::<_, bool>(
            "INSERT INTO pressroom.worker (name, last_heartbeat)
             VALUES ($1, $2)
             ON CONFLICT (name) DO UPDATE
                SET last_heartbeat = EXCLUDED.last_heartbeat
             RETURNING (xmax = 0)",
        )
        .bind(name)
        .bind(last_heartbeat)
        .fetch_one(&self.pool)
        .await?;

        Ok(created)
    }

    async fn stale(&self, cutoff: NaiveDateTime) -> anyhow::Result<Vec<AvailableWorker>> {
        let workers = sqlx::query_as::<_, AvailableWorker>(
            "SELECT name, last_heartbeat, num_reservations
               FROM pressroom.worker
              WHERE last_heartbeat < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(workers)
    }

    async fn get(&self, name: &str) -> anyhow::Result<Option<AvailableWorker>> {
        let worker = sqlx::query_as::<_, AvailableWorker>(
            "SELECT name, last_heartbeat, num_reservations
               FROM pressroom.worker
              WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(worker)
    }
}

/// Submits tasks by inserting a `pressroom.task` row and notifying the
/// queue's channel, which is where workers and the dispatch coordinator
/// pick them up.
pub struct PgTaskDispatcher {
    pool: sqlx::PgPool,
}

impl PgTaskDispatcher {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskDispatcher for PgTaskDispatcher {
    async fn apply_async(
        &self,
        task: &str,
        args: &serde_json::Value,
        kwargs: &serde_json::Value,
        queue: &str,
    ) -> anyhow::Result<Submission> {
        let id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO pressroom.task (id, name, args, kwargs, queue)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(id)
        .bind(task)
        .bind(Json(args))
        .bind(Json(kwargs))
        .bind(queue)
        .execute(&mut *tx)
        .await?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(format!("pressroom:queue:{queue}"))
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Submission { id })
    }
}
