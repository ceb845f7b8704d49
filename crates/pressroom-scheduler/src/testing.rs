//! In-memory collaborator implementations for tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use uuid::Uuid;

use crate::event::{EventBus, EventStream};
use crate::store::{
    AvailableWorker, ScheduleStore, ScheduledCall, Submission, TaskDispatcher, WorkerRegistry,
};

pub(crate) fn scheduled_call(id: &str, spec: &str) -> ScheduledCall {
    ScheduledCall {
        id: id.to_owned(),
        enabled: true,
        schedule: spec.to_owned(),
        task: "pressroom.tasks.sync".to_owned(),
        args: json!([]),
        kwargs: json!({}),
        options: json!({}),
        last_run: None,
        remaining_runs: None,
        consecutive_failures: 0,
        failure_threshold: None,
        last_updated: 1,
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum StoreCall {
    IncrementFailureCount(String),
    ResetFailureCount(String),
    RecordRun(String),
}

/// A schedule store over a plain vector, recording every write it sees.
#[derive(Default)]
pub(crate) struct MemScheduleStore {
    rows: Mutex<Vec<ScheduledCall>>,
    calls: Mutex<Vec<StoreCall>>,
}

impl MemScheduleStore {
    pub fn push(&self, call: ScheduledCall) {
        self.rows.lock().push(call);
    }

    pub fn remove(&self, id: &str) {
        self.rows.lock().retain(|call| call.id != id);
    }

    pub fn touch(&self, id: &str) {
        if let Some(call) = self.rows.lock().iter_mut().find(|call| call.id == id) {
            call.last_updated += 1;
        }
    }

    pub fn call(&self, id: &str) -> Option<ScheduledCall> {
        self.rows.lock().iter().find(|call| call.id == id).cloned()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ScheduleStore for MemScheduleStore {
    fn get_enabled(&self) -> BoxStream<'_, anyhow::Result<ScheduledCall>> {
        let rows: Vec<_> = self
            .rows
            .lock()
            .iter()
            .filter(|call| call.enabled)
            .cloned()
            .map(Ok)
            .collect();
        futures_util::stream::iter(rows).boxed()
    }

    fn get_updated_since(&self, since: i64) -> BoxStream<'_, anyhow::Result<ScheduledCall>> {
        let rows: Vec<_> = self
            .rows
            .lock()
            .iter()
            .filter(|call| call.enabled && call.last_updated > since)
            .cloned()
            .map(Ok)
            .collect();
        futures_util::stream::iter(rows).boxed()
    }

    async fn count_enabled(&self) -> anyhow::Result<i64> {
        Ok(self.rows.lock().iter().filter(|call| call.enabled).count() as i64)
    }

    async fn count_updated_since(&self, since: i64) -> anyhow::Result<i64> {
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|call| call.enabled && call.last_updated > since)
            .count() as i64)
    }

    async fn increment_failure_count(&self, schedule_id: &str) -> anyhow::Result<()> {
        self.calls
            .lock()
            .push(StoreCall::IncrementFailureCount(schedule_id.to_owned()));

        let mut rows = self.rows.lock();
        if let Some(call) = rows.iter_mut().find(|call| call.id == schedule_id) {
            call.consecutive_failures += 1;
            if let Some(threshold) = call.failure_threshold {
                if call.consecutive_failures >= threshold {
                    call.enabled = false;
                }
            }
            call.last_updated += 1;
        }

        Ok(())
    }

    async fn reset_failure_count(&self, schedule_id: &str) -> anyhow::Result<()> {
        self.calls
            .lock()
            .push(StoreCall::ResetFailureCount(schedule_id.to_owned()));

        let mut rows = self.rows.lock();
        if let Some(call) = rows.iter_mut().find(|call| call.id == schedule_id) {
            call.consecutive_failures = 0;
            call.last_updated += 1;
        }

        Ok(())
    }

    async fn record_run(&self, schedule_id: &str, at: NaiveDateTime) -> anyhow::Result<()> {
        self.calls
            .lock()
            .push(StoreCall::RecordRun(schedule_id.to_owned()));

        let mut rows = self.rows.lock();
        if let Some(call) = rows.iter_mut().find(|call| call.id == schedule_id) {
            call.last_run = Some(at);
            if let Some(remaining) = call.remaining_runs.as_mut() {
                *remaining = (*remaining - 1).max(0);
                if *remaining == 0 {
                    call.enabled = false;
                }
            }
        }

        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MemWorkerRegistry {
    rows: Mutex<HashMap<String, AvailableWorker>>,
    upserts: Mutex<usize>,
}

impl MemWorkerRegistry {
    pub fn insert_worker(&self, name: &str, last_heartbeat: NaiveDateTime) {
        self.rows.lock().insert(
            name.to_owned(),
            AvailableWorker {
                name: name.to_owned(),
                last_heartbeat,
                num_reservations: 0,
            },
        );
    }

    pub fn get_worker(&self, name: &str) -> Option<AvailableWorker> {
        self.rows.lock().get(name).cloned()
    }

    pub fn upsert_count(&self) -> usize {
        *self.upserts.lock()
    }
}

#[async_trait]
impl WorkerRegistry for MemWorkerRegistry {
    async fn upsert(&self, name: &str, last_heartbeat: NaiveDateTime) -> anyhow::Result<bool> {
        *self.upserts.lock() += 1;

        let mut rows = self.rows.lock();
        match rows.get_mut(name) {
            Some(worker) => {
                worker.last_heartbeat = last_heartbeat;
                Ok(false)
            }
            None => {
                rows.insert(
                    name.to_owned(),
                    AvailableWorker {
                        name: name.to_owned(),
                        last_heartbeat,
                        num_reservations: 0,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn stale(&self, cutoff: NaiveDateTime) -> anyhow::Result<Vec<AvailableWorker>> {
        Ok(self
            .rows
            .lock()
            .values()
            .filter(|worker| worker.last_heartbeat < cutoff)
            .cloned()
            .collect())
    }

    async fn get(&self, name: &str) -> anyhow::Result<Option<AvailableWorker>> {
        Ok(self.get_worker(name))
    }
}

#[derive(Clone, Debug)]
pub(crate) struct SubmittedTask {
    pub id: Uuid,
    pub task: String,
    pub args: serde_json::Value,
    pub kwargs: serde_json::Value,
    pub queue: String,
}

#[derive(Default)]
pub(crate) struct RecordingDispatcher {
    submissions: Mutex<Vec<SubmittedTask>>,
}

impl RecordingDispatcher {
    pub fn submissions(&self) -> Vec<SubmittedTask> {
        self.submissions.lock().clone()
    }
}

#[async_trait]
impl TaskDispatcher for RecordingDispatcher {
    async fn apply_async(
        &self,
        task: &str,
        args: &serde_json::Value,
        kwargs: &serde_json::Value,
        queue: &str,
    ) -> anyhow::Result<Submission> {
        let id = Uuid::new_v4();
        self.submissions.lock().push(SubmittedTask {
            id,
            task: task.to_owned(),
            args: args.clone(),
            kwargs: kwargs.clone(),
            queue: queue.to_owned(),
        });

        Ok(Submission { id })
    }
}

/// An event bus whose connect call never completes. Tests drive handlers
/// directly, so nothing ever consumes from it.
pub(crate) struct UnreachableBus;

#[async_trait]
impl EventBus for UnreachableBus {
    async fn connect(&self) -> anyhow::Result<Box<dyn EventStream>> {
        std::future::pending::<()>().await;
        unreachable!("the test bus never connects")
    }
}
