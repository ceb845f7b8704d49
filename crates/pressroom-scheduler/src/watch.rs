use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::event::{TaskFailed, TaskSucceeded};
use crate::store::ScheduleStore;

#[derive(Clone, Debug)]
struct WatchedTask {
    submitted_at: i64,
    schedule_id: String,
    had_failure: bool,
}

/// Tracks dispatched tasks whose outcome must adjust their schedule's
/// consecutive-failure count.
///
/// Shared between the beat loop (which registers submissions and trims) and
/// the event monitor (which resolves outcomes), so every access goes through
/// one mutex. The lock is never held across an await.
pub struct FailureWatcher {
    ttl: Duration,
    watches: Mutex<HashMap<Uuid, WatchedTask>>,
}

impl FailureWatcher {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Start watching a task. Re-adding an id overwrites the old watch.
    ///
    /// `had_failure` snapshots whether the schedule had any consecutive
    /// failures recorded at submit time; the success handler uses it to skip
    /// store writes for schedules that were already clean.
    pub fn add(&self, task_id: Uuid, schedule_id: &str, had_failure: bool) {
        self.add_at(task_id, schedule_id, had_failure, Utc::now().timestamp());
    }

    fn add_at(&self, task_id: Uuid, schedule_id: &str, had_failure: bool, submitted_at: i64) {
        self.watches.lock().insert(
            task_id,
            WatchedTask {
                submitted_at,
                schedule_id: schedule_id.to_owned(),
                had_failure,
            },
        );
    }

    /// Stop watching a task, returning its schedule id and submit-time
    /// failure flag. Unknown ids simply return `None`.
    pub fn pop(&self, task_id: Uuid) -> Option<(String, bool)> {
        self.watches
            .lock()
            .remove(&task_id)
            .map(|watch| (watch.schedule_id, watch.had_failure))
    }

    /// Evict watches older than the TTL.
    ///
    /// Runs from the beat loop each tick, so the table stays bounded even
    /// when the event stream loses a terminal event.
    pub fn trim(&self) {
        self.trim_at(Utc::now().timestamp());
    }

    fn trim_at(&self, now: i64) {
        let oldest_allowed = now - self.ttl.as_secs() as i64;
        let mut watches = self.watches.lock();
        watches.retain(|_, watch| watch.submitted_at >= oldest_allowed);
        metrics::gauge!("pressroom_watched_tasks").set(watches.len() as f64);
    }

    pub fn len(&self) -> usize {
        self.watches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.lock().is_empty()
    }

    /// Resolve a `task-succeeded` event.
    ///
    /// A chained result transfers the watch to the child task, since only
    /// the end of the chain says anything about the schedule. Otherwise the
    /// failure count is reset, but only when there was something to reset;
    /// clean schedules staying clean cost the store nothing.
    pub async fn handle_task_succeeded(&self, event: &TaskSucceeded, store: &dyn ScheduleStore) {
        let Some((schedule_id, had_failure)) = self.pop(event.uuid) else {
            return;
        };

        if let Some(child) = event.result.pending_task() {
            tracing::debug!("watching child task {child} for failure");
            self.add_at(child, &schedule_id, had_failure, Utc::now().timestamp());
        } else if had_failure {
            tracing::info!("resetting consecutive failure count for schedule {schedule_id}");
            if let Err(e) = store.reset_failure_count(&schedule_id).await {
                tracing::error!("failed to reset failure count for schedule {schedule_id}: {e:#}");
            }
        }
    }

    /// Resolve a `task-failed` event. The store owns disabling the schedule
    /// once its threshold is reached.
    pub async fn handle_task_failed(&self, event: &TaskFailed, store: &dyn ScheduleStore) {
        let Some((schedule_id, _had_failure)) = self.pop(event.uuid) else {
            return;
        };

        tracing::info!("incrementing consecutive failure count for schedule {schedule_id}");
        if let Err(e) = store.increment_failure_count(&schedule_id).await {
            tracing::error!("failed to increment failure count for schedule {schedule_id}: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TaskOutcome;
    use crate::testing::{MemScheduleStore, StoreCall};

    fn watcher() -> FailureWatcher {
        FailureWatcher::new(Duration::from_secs(4 * 3600))
    }

    fn succeeded(uuid: Uuid, result: TaskOutcome) -> TaskSucceeded {
        TaskSucceeded {
            uuid,
            hostname: "reserved_resource_worker-0@h1".to_owned(),
            timestamp: 1000.0,
            result,
        }
    }

    fn failed(uuid: Uuid) -> TaskFailed {
        TaskFailed {
            uuid,
            hostname: "reserved_resource_worker-0@h1".to_owned(),
            timestamp: 1000.0,
        }
    }

    #[test]
    fn pop_returns_the_watch_once() {
        let watcher = watcher();
        let task = Uuid::new_v4();
        watcher.add(task, "sync-repo", true);

        assert_eq!(watcher.pop(task), Some(("sync-repo".to_owned(), true)));
        assert_eq!(watcher.pop(task), None);
    }

    #[test]
    fn add_overwrites_last_writer_wins() {
        let watcher = watcher();
        let task = Uuid::new_v4();
        watcher.add(task, "sync-repo", false);
        watcher.add(task, "publish-repo", true);

        assert_eq!(watcher.len(), 1);
        assert_eq!(watcher.pop(task), Some(("publish-repo".to_owned(), true)));
    }

    #[test]
    fn trim_evicts_only_expired_watches() {
        let watcher = watcher();
        let now = 1_000_000;
        let old = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        watcher.add_at(old, "sync-repo", false, now - 4 * 3600 - 1);
        watcher.add_at(fresh, "publish-repo", false, now - 4 * 3600);

        watcher.trim_at(now);

        assert_eq!(watcher.len(), 1);
        assert!(watcher.pop(fresh).is_some());
    }

    #[tokio::test]
    async fn success_without_prior_failure_writes_nothing() {
        let watcher = watcher();
        let store = MemScheduleStore::default();
        let task = Uuid::new_v4();
        watcher.add(task, "sync-repo", false);

        watcher
            .handle_task_succeeded(&succeeded(task, TaskOutcome::default()), &store)
            .await;

        assert!(store.calls().is_empty());
        assert!(watcher.is_empty());
    }

    #[tokio::test]
    async fn success_after_failure_resets_exactly_once() {
        let watcher = watcher();
        let store = MemScheduleStore::default();
        let task = Uuid::new_v4();
        watcher.add(task, "sync-repo", true);

        watcher
            .handle_task_succeeded(&succeeded(task, TaskOutcome::default()), &store)
            .await;

        assert_eq!(
            store.calls(),
            vec![StoreCall::ResetFailureCount("sync-repo".to_owned())]
        );
    }

    #[tokio::test]
    async fn failure_increments_regardless_of_prior_state() {
        let watcher = watcher();
        let store = MemScheduleStore::default();
        let task = Uuid::new_v4();
        watcher.add(task, "sync-repo", false);

        watcher.handle_task_failed(&failed(task), &store).await;

        assert_eq!(
            store.calls(),
            vec![StoreCall::IncrementFailureCount("sync-repo".to_owned())]
        );
        assert!(watcher.is_empty());
    }

    #[tokio::test]
    async fn chained_result_transfers_the_watch() {
        let watcher = watcher();
        let store = MemScheduleStore::default();
        let parent = Uuid::new_v4();
        let child = Uuid::new_v4();
        watcher.add(parent, "sync-repo", true);

        watcher
            .handle_task_succeeded(&succeeded(parent, TaskOutcome::Pending { task: child }), &store)
            .await;

        assert!(store.calls().is_empty());
        assert_eq!(watcher.pop(parent), None);
        assert_eq!(watcher.pop(child), Some(("sync-repo".to_owned(), true)));
    }

    #[tokio::test]
    async fn unwatched_outcomes_are_ignored() {
        let watcher = watcher();
        let store = MemScheduleStore::default();

        watcher
            .handle_task_succeeded(&succeeded(Uuid::new_v4(), TaskOutcome::default()), &store)
            .await;
        watcher.handle_task_failed(&failed(Uuid::new_v4()), &store).await;

        assert!(store.calls().is_empty());
    }
}
