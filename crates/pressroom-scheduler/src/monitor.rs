use std::sync::Arc;

use crate::event::{Event, EventBus};
use crate::store::ScheduleStore;
use crate::watch::FailureWatcher;
use crate::worker::WorkerWatcher;

/// The long-lived consumer of broker events.
///
/// Task outcomes flow to the failure watcher, worker lifecycle events to the
/// worker watcher. The consume call is blocking and unbounded; any error
/// escaping it tears down the subscription and the monitor re-enters from
/// the top with a fresh one. No backoff — the connection layer underneath
/// does its own retrying.
pub struct EventMonitor {
    bus: Box<dyn EventBus>,
    watcher: Arc<FailureWatcher>,
    store: Arc<dyn ScheduleStore>,
    workers: WorkerWatcher,
}

impl EventMonitor {
    pub fn new(
        bus: Box<dyn EventBus>,
        watcher: Arc<FailureWatcher>,
        store: Arc<dyn ScheduleStore>,
        workers: WorkerWatcher,
    ) -> Self {
        Self {
            bus,
            watcher,
            store,
            workers,
        }
    }

    pub async fn run(mut self) {
        loop {
            if let Err(e) = self.monitor_events().await {
                tracing::error!("event monitor failed: {e:#}");
            }
        }
    }

    async fn monitor_events(&mut self) -> anyhow::Result<()> {
        let mut stream = self.bus.connect().await?;

        // Already-running workers answer the wakeup with a fresh heartbeat,
        // so discovery works no matter who started first.
        stream.request_wakeup().await?;

        tracing::info!("event monitor started");
        loop {
            let event = stream.next().await?;
            self.dispatch(event).await;
        }
    }

    /// Route one event to its handler. Handlers log-and-swallow their own
    /// store errors; nothing here may kill the loop.
    pub async fn dispatch(&self, event: Event) {
        match event {
            Event::WorkerHeartbeat(event) => self.workers.handle_worker_heartbeat(&event).await,
            Event::WorkerOffline(event) => self.workers.handle_worker_offline(&event).await,
            Event::TaskSucceeded(event) => {
                self.watcher
                    .handle_task_succeeded(&event, self.store.as_ref())
                    .await
            }
            Event::TaskFailed(event) => {
                self.watcher
                    .handle_task_failed(&event, self.store.as_ref())
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::event::TaskFailed;
    use crate::testing::{MemScheduleStore, MemWorkerRegistry, RecordingDispatcher, StoreCall, UnreachableBus};

    #[tokio::test]
    async fn dispatch_routes_task_outcomes_to_the_watcher() {
        let watcher = Arc::new(FailureWatcher::new(Duration::from_secs(3600)));
        let store = Arc::new(MemScheduleStore::default());
        let registry = Arc::new(MemWorkerRegistry::default());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let monitor = EventMonitor::new(
            Box::new(UnreachableBus),
            watcher.clone(),
            store.clone(),
            WorkerWatcher::new(registry, dispatcher),
        );

        let task = Uuid::new_v4();
        watcher.add(task, "sync-repo", false);

        monitor
            .dispatch(Event::TaskFailed(TaskFailed {
                uuid: task,
                hostname: "reserved_resource_worker-0@h1".to_owned(),
                timestamp: 1000.0,
            }))
            .await;

        assert_eq!(
            store.calls(),
            vec![StoreCall::IncrementFailureCount("sync-repo".to_owned())]
        );
        assert!(watcher.is_empty());
    }
}
