use std::sync::Arc;

use chrono::Utc;

use crate::config::{Config, RESOURCE_MANAGER_PREFIX};
use crate::error::MalformedEvent;
use crate::event::{naive_utc_from_epoch, WorkerHeartbeat, WorkerOffline};
use crate::store::{TaskDispatcher, WorkerRegistry};

fn is_resource_manager(hostname: &str) -> bool {
    hostname.starts_with(RESOURCE_MANAGER_PREFIX)
}

/// Handlers for worker lifecycle events.
///
/// Stateless: discovery and departure both flow through the registry and the
/// dispatcher, never through memory held here.
pub struct WorkerWatcher {
    registry: Arc<dyn WorkerRegistry>,
    dispatcher: Arc<dyn TaskDispatcher>,
}

impl WorkerWatcher {
    pub fn new(registry: Arc<dyn WorkerRegistry>, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        Self {
            registry,
            dispatcher,
        }
    }

    /// Record a worker heartbeat, creating the registry row on first sight.
    pub async fn handle_worker_heartbeat(&self, event: &WorkerHeartbeat) {
        tracing::debug!(
            "received 'worker-heartbeat' from {} at {}",
            event.hostname,
            event.timestamp
        );

        if is_resource_manager(&event.hostname) {
            return;
        }

        let Some(heartbeat) = naive_utc_from_epoch(event.timestamp) else {
            tracing::error!(
                "{}",
                MalformedEvent::new("worker-heartbeat", format!("bad timestamp {}", event.timestamp))
            );
            return;
        };

        match self.registry.upsert(&event.hostname, heartbeat).await {
            Ok(true) => tracing::info!("new worker '{}' discovered", event.hostname),
            Ok(false) => {}
            Err(e) => tracing::error!("failed to record heartbeat for '{}': {e:#}", event.hostname),
        }
    }

    /// React to a graceful worker shutdown by requesting cleanup on the
    /// manager queue. Sudden deaths never emit this event; the timeout
    /// sweeper handles those.
    pub async fn handle_worker_offline(&self, event: &WorkerOffline) {
        tracing::debug!(
            "received 'worker-offline' from {} at {}",
            event.hostname,
            event.timestamp
        );

        if is_resource_manager(&event.hostname) {
            return;
        }

        tracing::info!("worker '{}' shut down", event.hostname);

        match self.registry.get(&event.hostname).await {
            Ok(Some(worker)) if worker.num_reservations > 0 => tracing::info!(
                "worker '{}' leaves {} reservations behind, cleanup will reclaim them",
                worker.name,
                worker.num_reservations
            ),
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("could not read registry row for '{}': {e:#}", event.hostname)
            }
        }

        if let Err(e) = self.dispatcher.delete_queue(&event.hostname).await {
            tracing::error!("failed to request cleanup for '{}': {e:#}", event.hostname);
        }
    }
}

/// Periodically sweeps the registry for workers that stopped heartbeating
/// without saying goodbye, and requests cleanup for each.
pub struct WorkerTimeoutMonitor {
    registry: Arc<dyn WorkerRegistry>,
    dispatcher: Arc<dyn TaskDispatcher>,
    config: Config,
}

impl WorkerTimeoutMonitor {
    pub fn new(
        registry: Arc<dyn WorkerRegistry>,
        dispatcher: Arc<dyn TaskDispatcher>,
        config: Config,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            config,
        }
    }

    /// Loop forever. Sleeps before the first sweep so workers get a chance
    /// to heartbeat after a cold start.
    pub async fn run(self) {
        tracing::info!("worker timeout monitor started");
        loop {
            tokio::time::sleep(self.config.sweep_frequency).await;
            if let Err(e) = self.check_workers().await {
                tracing::error!("worker timeout sweep failed: {e:#}");
            }
        }
    }

    /// One sweep: every worker silent past the timeout gets a cleanup task
    /// submitted on the manager queue.
    pub async fn check_workers(&self) -> anyhow::Result<usize> {
        tracing::debug!(
            "looking for workers missing for more than {}",
            humantime::Duration::from(self.config.worker_timeout)
        );

        let cutoff = Utc::now().naive_utc() - chrono::Duration::from_std(self.config.worker_timeout)?;
        let missing = self.registry.stale(cutoff).await?;

        for worker in &missing {
            tracing::error!(
                "worker '{}' has gone missing, requesting cleanup",
                worker.name
            );
            self.dispatcher.delete_queue(&worker.name).await?;
        }

        Ok(missing.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DELETE_QUEUE_TASK, RESOURCE_MANAGER_QUEUE};
    use crate::testing::{MemWorkerRegistry, RecordingDispatcher};
    use chrono::NaiveDate;

    fn watcher() -> (WorkerWatcher, Arc<MemWorkerRegistry>, Arc<RecordingDispatcher>) {
        let registry = Arc::new(MemWorkerRegistry::default());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let watcher = WorkerWatcher::new(registry.clone(), dispatcher.clone());
        (watcher, registry, dispatcher)
    }

    #[tokio::test]
    async fn heartbeat_discovers_a_new_worker() {
        let (watcher, registry, dispatcher) = watcher();

        watcher
            .handle_worker_heartbeat(&WorkerHeartbeat {
                hostname: "reserved_resource_worker-0@h1".to_owned(),
                timestamp: 1000.0,
            })
            .await;

        let worker = registry.get_worker("reserved_resource_worker-0@h1").unwrap();
        let expected = NaiveDate::from_ymd_opt(1970, 1, 1)
            .unwrap()
            .and_hms_opt(0, 16, 40)
            .unwrap();
        assert_eq!(worker.last_heartbeat, expected);
        assert!(dispatcher.submissions().is_empty());
    }

    #[tokio::test]
    async fn heartbeat_refreshes_a_known_worker() {
        let (watcher, registry, _dispatcher) = watcher();

        for timestamp in [1000.0, 2000.0] {
            watcher
                .handle_worker_heartbeat(&WorkerHeartbeat {
                    hostname: "reserved_resource_worker-0@h1".to_owned(),
                    timestamp,
                })
                .await;
        }

        let worker = registry.get_worker("reserved_resource_worker-0@h1").unwrap();
        assert_eq!(worker.last_heartbeat.and_utc().timestamp(), 2000);
        assert_eq!(registry.upsert_count(), 2);
    }

    #[tokio::test]
    async fn offline_requests_cleanup_on_the_manager_queue() {
        let (watcher, registry, dispatcher) = watcher();
        registry.insert_worker("reserved_resource_worker-0@h1", Utc::now().naive_utc());

        watcher
            .handle_worker_offline(&WorkerOffline {
                hostname: "reserved_resource_worker-0@h1".to_owned(),
                timestamp: 1000.0,
            })
            .await;

        let submissions = dispatcher.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].task, DELETE_QUEUE_TASK);
        assert_eq!(submissions[0].queue, RESOURCE_MANAGER_QUEUE);
        assert_eq!(
            submissions[0].args,
            serde_json::json!(["reserved_resource_worker-0@h1"])
        );
        assert_eq!(submissions[0].kwargs, serde_json::json!({}));
    }

    #[tokio::test]
    async fn resource_manager_events_are_dropped() {
        let (watcher, registry, dispatcher) = watcher();

        watcher
            .handle_worker_heartbeat(&WorkerHeartbeat {
                hostname: "resource_manager@host1".to_owned(),
                timestamp: 1000.0,
            })
            .await;
        watcher
            .handle_worker_offline(&WorkerOffline {
                hostname: "resource_manager@host1".to_owned(),
                timestamp: 1000.0,
            })
            .await;

        assert_eq!(registry.upsert_count(), 0);
        assert!(dispatcher.submissions().is_empty());
    }

    #[tokio::test]
    async fn sweep_requests_cleanup_for_silent_workers() {
        let registry = Arc::new(MemWorkerRegistry::default());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let monitor =
            WorkerTimeoutMonitor::new(registry.clone(), dispatcher.clone(), Config::default());

        let now = Utc::now().naive_utc();
        registry.insert_worker("w1", now - chrono::Duration::seconds(400));
        registry.insert_worker("w2", now - chrono::Duration::seconds(10));

        let missing = monitor.check_workers().await.unwrap();

        assert_eq!(missing, 1);
        let submissions = dispatcher.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].task, DELETE_QUEUE_TASK);
        assert_eq!(submissions[0].queue, RESOURCE_MANAGER_QUEUE);
        assert_eq!(submissions[0].args, serde_json::json!(["w1"]));
    }

    #[tokio::test]
    async fn sweep_is_quiet_when_everyone_is_alive() {
        let registry = Arc::new(MemWorkerRegistry::default());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let monitor =
            WorkerTimeoutMonitor::new(registry.clone(), dispatcher.clone(), Config::default());

        registry.insert_worker("w1", Utc::now().naive_utc());

        assert_eq!(monitor.check_workers().await.unwrap(), 0);
        assert!(dispatcher.submissions().is_empty());
    }
}
