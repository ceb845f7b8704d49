use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::config::{DELETE_QUEUE_TASK, RESOURCE_MANAGER_QUEUE};

mod postgres;

pub use self::postgres::{
    ensure_schema, PgScheduleStore, PgTaskDispatcher, PgWorkerRegistry,
};

/// A persisted periodic schedule.
///
/// `last_updated` advances monotonically on every edit; the scheduler uses
/// it (together with the enabled count) to notice out-of-band changes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduledCall {
    pub id: String,
    pub enabled: bool,
    pub schedule: String,
    pub task: String,
    pub args: serde_json::Value,
    pub kwargs: serde_json::Value,
    pub options: serde_json::Value,
    pub last_run: Option<NaiveDateTime>,
    /// How many more runs this schedule gets. `None` means unlimited; a row
    /// that has counted down to zero is ignored by the scheduler even while
    /// still enabled.
    pub remaining_runs: Option<i64>,
    pub consecutive_failures: i64,
    /// `None` disables the consecutive-failure policy for this schedule.
    pub failure_threshold: Option<i64>,
    pub last_updated: i64,
}

/// A worker the platform currently believes to be alive.
///
/// Created on first heartbeat, refreshed on every later one, and removed by
/// the cleanup task once the worker goes away. `num_reservations` belongs to
/// the dispatch coordinator; the scheduler only carries it.
#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct AvailableWorker {
    pub name: String,
    pub last_heartbeat: NaiveDateTime,
    pub num_reservations: i64,
}

/// The handle returned by a task submission.
#[derive(Clone, Debug)]
pub struct Submission {
    pub id: Uuid,
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Every enabled schedule, in no particular order.
    fn get_enabled(&self) -> BoxStream<'_, anyhow::Result<ScheduledCall>>;

    /// Enabled schedules updated strictly after `since`.
    fn get_updated_since(&self, since: i64) -> BoxStream<'_, anyhow::Result<ScheduledCall>>;

    async fn count_enabled(&self) -> anyhow::Result<i64>;

    async fn count_updated_since(&self, since: i64) -> anyhow::Result<i64>;

    /// Atomically bump a schedule's consecutive-failure count, disabling the
    /// schedule when the count reaches its threshold.
    async fn increment_failure_count(&self, schedule_id: &str) -> anyhow::Result<()>;

    /// Atomically zero a schedule's consecutive-failure count.
    async fn reset_failure_count(&self, schedule_id: &str) -> anyhow::Result<()>;

    /// Record that a run was dispatched: set `last_run` and count down
    /// `remaining_runs` where finite. Deliberately does not advance
    /// `last_updated` — a run is not an edit.
    async fn record_run(&self, schedule_id: &str, at: NaiveDateTime) -> anyhow::Result<()>;
}

#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Insert or refresh a worker row. Returns true when the worker was not
    /// previously known.
    async fn upsert(&self, name: &str, last_heartbeat: NaiveDateTime) -> anyhow::Result<bool>;

    /// Workers whose last heartbeat is strictly older than `cutoff`.
    async fn stale(&self, cutoff: NaiveDateTime) -> anyhow::Result<Vec<AvailableWorker>>;

    async fn get(&self, name: &str) -> anyhow::Result<Option<AvailableWorker>>;
}

#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Submit a task to a named queue, returning its stable id.
    async fn apply_async(
        &self,
        task: &str,
        args: &serde_json::Value,
        kwargs: &serde_json::Value,
        queue: &str,
    ) -> anyhow::Result<Submission>;

    /// Ask the dispatch coordinator to clean up after a departed worker.
    /// The task runs in the coordinator's single-writer context, which owns
    /// the registry row removal and work reclamation.
    async fn delete_queue(&self, worker_name: &str) -> anyhow::Result<Submission> {
        self.apply_async(
            DELETE_QUEUE_TASK,
            &json!([worker_name]),
            &json!({}),
            RESOURCE_MANAGER_QUEUE,
        )
        .await
    }
}
