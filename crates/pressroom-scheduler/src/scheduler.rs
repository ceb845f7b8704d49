use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{NaiveDateTime, Utc};
use futures_util::TryStreamExt;

use crate::config::Config;
use crate::error::UnsupportedOperation;
use crate::event::{EventBus, PgEventBus};
use crate::monitor::EventMonitor;
use crate::schedule::ScheduleEntry;
use crate::store::{
    PgScheduleStore, PgTaskDispatcher, PgWorkerRegistry, ScheduleStore, Submission,
    TaskDispatcher, WorkerRegistry,
};
use crate::watch::FailureWatcher;
use crate::worker::{WorkerTimeoutMonitor, WorkerWatcher};

pub struct SchedulerBuilder {
    config: Config,
    entries: Vec<ScheduleEntry>,
    pool: Option<sqlx::PgPool>,
    store: Option<Arc<dyn ScheduleStore>>,
    registry: Option<Arc<dyn WorkerRegistry>>,
    dispatcher: Option<Arc<dyn TaskDispatcher>>,
    bus: Option<Box<dyn EventBus>>,
}

impl SchedulerBuilder {
    /// A scheduler wired to the Postgres-backed collaborators.
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self {
            config: Config::default(),
            entries: Vec::new(),
            pool: Some(pool),
            store: None,
            registry: None,
            dispatcher: None,
            bus: None,
        }
    }

    /// A scheduler whose collaborators are all supplied by the caller.
    /// `build` fails if any of them is missing.
    pub fn external() -> Self {
        Self {
            config: Config::default(),
            entries: Vec::new(),
            pool: None,
            store: None,
            registry: None,
            dispatcher: None,
            bus: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Add a statically configured schedule entry. These sit alongside the
    /// store-backed schedules in every snapshot.
    pub fn entry(mut self, entry: ScheduleEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Mark this scheduler as a throwaway instance; see [`Config::lazy`].
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.config.lazy = lazy;
        self
    }

    pub fn schedule_store(mut self, store: Arc<dyn ScheduleStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn worker_registry(mut self, registry: Arc<dyn WorkerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn task_dispatcher(mut self, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn event_bus(mut self, bus: Box<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> anyhow::Result<Scheduler> {
        fn require_pool(pool: &Option<sqlx::PgPool>) -> anyhow::Result<sqlx::PgPool> {
            pool.clone().context(
                "a database pool is required unless every collaborator is supplied explicitly",
            )
        }

        let store = match self.store {
            Some(store) => store,
            None => Arc::new(PgScheduleStore::new(require_pool(&self.pool)?)) as _,
        };
        let registry = match self.registry {
            Some(registry) => registry,
            None => Arc::new(PgWorkerRegistry::new(require_pool(&self.pool)?)) as _,
        };
        let dispatcher = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => Arc::new(PgTaskDispatcher::new(require_pool(&self.pool)?)) as _,
        };
        let bus = match self.bus {
            Some(bus) => bus,
            None => Box::new(PgEventBus::new(require_pool(&self.pool)?)) as _,
        };

        let watcher = Arc::new(FailureWatcher::new(self.config.failure_watch_ttl));
        let workers = WorkerWatcher::new(registry.clone(), dispatcher.clone());
        let event_monitor = EventMonitor::new(bus, watcher.clone(), store.clone(), workers);
        let timeout_monitor =
            WorkerTimeoutMonitor::new(registry, dispatcher.clone(), self.config.clone());

        Ok(Scheduler {
            config: self.config,
            store,
            dispatcher,
            watcher,
            static_entries: self.entries,
            schedule: None,
            loaded_from_db: 0,
            most_recent_timestamp: 0,
            event_monitor: Some(event_monitor),
            timeout_monitor: Some(timeout_monitor),
        })
    }
}

/// The beat scheduler.
///
/// Owns the in-memory schedule snapshot and the two background monitors.
/// Everything on the snapshot runs on the beat task alone; the failure
/// watcher is the only state shared with the monitors.
pub struct Scheduler {
    config: Config,
    store: Arc<dyn ScheduleStore>,
    dispatcher: Arc<dyn TaskDispatcher>,
    watcher: Arc<FailureWatcher>,
    static_entries: Vec<ScheduleEntry>,
    schedule: Option<HashMap<String, ScheduleEntry>>,
    loaded_from_db: i64,
    most_recent_timestamp: i64,
    event_monitor: Option<EventMonitor>,
    timeout_monitor: Option<WorkerTimeoutMonitor>,
}

impl Scheduler {
    /// Spawn the event monitor and the worker-timeout sweeper.
    ///
    /// Idempotent, and a no-op on lazy instances: the beat framework builds
    /// schedulers speculatively, and only the instance it commits to may own
    /// background work. The monitors run as detached tasks with no shutdown
    /// protocol; they die with the process.
    pub fn start(&mut self) {
        if self.config.lazy {
            return;
        }

        if let Some(monitor) = self.event_monitor.take() {
            tokio::spawn(monitor.run());
        }
        if let Some(sweeper) = self.timeout_monitor.take() {
            tokio::spawn(sweeper.run());
        }
    }

    /// Drive the beat loop forever.
    ///
    /// Failing to read the very first snapshot is a startup error and
    /// propagates; after that the loop only logs.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.setup_schedule()
            .await
            .context("failed to load the initial schedule snapshot")?;
        self.start();

        tracing::info!(
            "beat loop starting with {} schedules",
            self.schedule.as_ref().map_or(0, HashMap::len)
        );

        loop {
            let sleep = self.tick().await;
            tracing::trace!("beat sleeping for {}", humantime::Duration::from(sleep));
            tokio::time::sleep(sleep).await;
        }
    }

    /// Rebuild the snapshot from the static entries and the store.
    pub async fn setup_schedule(&mut self) -> anyhow::Result<()> {
        let mut schedule = HashMap::new();
        for entry in &self.static_entries {
            schedule.insert(entry.name.clone(), entry.clone());
        }

        tracing::debug!("loading schedules from the store");
        let mut most_recent = 0;
        let mut loaded = 0;
        let mut ignored = 0;

        let store = self.store.clone();
        let mut calls = store.get_enabled();
        while let Some(call) = calls.try_next().await? {
            if call.remaining_runs == Some(0) {
                tracing::debug!("ignoring schedule with no remaining runs: {}", call.id);
                ignored += 1;
                continue;
            }

            // Unusable rows still count as loaded, otherwise the count
            // probe would report a change on every tick.
            most_recent = most_recent.max(call.last_updated);
            loaded += 1;

            match ScheduleEntry::from_call(&call) {
                Ok(entry) => {
                    schedule.insert(call.id.clone(), entry);
                }
                Err(e) => tracing::error!("skipping schedule: {e:#}"),
            }
        }
        drop(calls);

        tracing::debug!("loaded {loaded} schedules from the store, ignored {ignored}");

        self.schedule = Some(schedule);
        self.loaded_from_db = loaded;
        self.most_recent_timestamp = most_recent;

        Ok(())
    }

    /// Whether the set of enabled schedules in the store no longer matches
    /// the snapshot. Two indexed probes; there is no push notification from
    /// the store, so this runs every tick.
    pub async fn schedule_changed(&self) -> anyhow::Result<bool> {
        if self.store.count_enabled().await? != self.loaded_from_db {
            tracing::debug!("the number of enabled schedules has changed");
            return Ok(true);
        }

        if self
            .store
            .count_updated_since(self.most_recent_timestamp)
            .await?
            > 0
        {
            tracing::debug!("one or more enabled schedules has been updated");
            self.log_updated_schedules().await;
            return Ok(true);
        }

        Ok(false)
    }

    /// Name the schedules behind a positive updated-since probe. Pulls a row
    /// stream, so it only runs when someone is listening at debug level.
    async fn log_updated_schedules(&self) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }

        let mut updated = self.store.get_updated_since(self.most_recent_timestamp);
        loop {
            match updated.try_next().await {
                Ok(Some(call)) => tracing::debug!("schedule {} was updated", call.id),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("failed to list updated schedules: {e:#}");
                    break;
                }
            }
        }
    }

    /// The active snapshot, rebuilt first if the store changed underneath it.
    pub async fn schedule(&mut self) -> anyhow::Result<&HashMap<String, ScheduleEntry>> {
        self.refresh_schedule().await?;
        Ok(self.schedule.get_or_insert_with(HashMap::new))
    }

    async fn refresh_schedule(&mut self) -> anyhow::Result<()> {
        if self.schedule.is_none() || self.schedule_changed().await? {
            self.setup_schedule().await?;
        }

        Ok(())
    }

    /// One beat iteration: dispatch everything due, trim the failure watch
    /// table, and say how long to sleep. The sleep is capped so schedule
    /// changes are noticed in bounded time even when nothing is due.
    pub async fn tick(&mut self) -> Duration {
        if let Err(e) = self.refresh_schedule().await {
            tracing::error!("failed to refresh the schedule snapshot: {e:#}");
        }

        let now = Utc::now().naive_utc();
        let mut sleep = self.config.max_beat_interval;
        let mut due = Vec::new();

        if let Some(schedule) = &self.schedule {
            for entry in schedule.values() {
                let (is_due, next) = entry.schedule.is_due(entry.last_run, now);
                if is_due {
                    due.push(entry.clone());
                }
                sleep = sleep.min(next);
            }
        }

        for entry in due {
            match self.apply_async(&entry).await {
                Ok(submission) => {
                    tracing::debug!(
                        "dispatched task {} for schedule {}",
                        submission.id,
                        entry.name
                    );
                    metrics::counter!("pressroom_dispatched_tasks").increment(1);

                    if entry.store_backed {
                        if let Err(e) = self.store.record_run(&entry.name, now).await {
                            tracing::error!(
                                "failed to record a run for schedule {}: {e:#}",
                                entry.name
                            );
                        }
                    }
                    self.mark_dispatched(&entry.name, now);
                }
                Err(e) => tracing::error!("failed to dispatch schedule {}: {e:#}", entry.name),
            }
        }

        self.watcher.trim();
        sleep.min(self.config.max_beat_interval)
    }

    /// Submit one entry's task, and watch it for failure when the schedule
    /// carries a threshold.
    ///
    /// The `had_failure` flag snapshots the count as of submit time. A run
    /// dispatched while an earlier one is still in flight sees the
    /// pre-flight state; the policy tolerates that, since a reset is only a
    /// redundant write and a disable only comes from the store's own atomic
    /// increment.
    pub async fn apply_async(&self, entry: &ScheduleEntry) -> anyhow::Result<Submission> {
        let submission = self
            .dispatcher
            .apply_async(&entry.task, &entry.args, &entry.kwargs, &entry.queue)
            .await?;

        if entry.failure_threshold.is_some() {
            self.watcher
                .add(submission.id, &entry.name, entry.consecutive_failures > 0);
            tracing::debug!("watching task {} for failure", submission.id);
        }

        Ok(submission)
    }

    /// In-place additions are not supported: new schedules are written to
    /// the store and picked up by invalidation.
    pub fn add(&mut self, _entry: ScheduleEntry) -> Result<(), UnsupportedOperation> {
        Err(UnsupportedOperation)
    }

    /// The failure-watch table shared with the event monitor.
    pub fn failure_watcher(&self) -> &Arc<FailureWatcher> {
        &self.watcher
    }

    fn mark_dispatched(&mut self, name: &str, now: NaiveDateTime) {
        let Some(schedule) = self.schedule.as_mut() else {
            return;
        };
        let Some(entry) = schedule.get_mut(name) else {
            return;
        };

        entry.last_run = Some(now);
        let mut retire = false;
        if let Some(remaining) = entry.remaining_runs.as_mut() {
            *remaining -= 1;
            retire = *remaining <= 0;
        }

        if retire {
            tracing::info!("schedule {name} has used up its remaining runs, retiring it");
            schedule.remove(name);
        }
    }
}
