use std::time::Duration;

/// Worker hostnames beginning with this prefix belong to the dispatch
/// coordinator, not to a content worker. Events from it are ignored.
pub const RESOURCE_MANAGER_PREFIX: &str = "resource_manager@";

/// The dedicated queue consumed by the single dispatch coordinator. All
/// serialized state mutations (worker cleanup included) go through it.
pub const RESOURCE_MANAGER_QUEUE: &str = "resource_manager";

/// The cleanup task submitted when a worker goes away. The task body runs in
/// the dispatch coordinator's single-writer context and owns the registry
/// row removal and work reclamation.
pub const DELETE_QUEUE_TASK: &str = "pressroom.tasks.delete_queue";

/// The queue a schedule dispatches to when its options carry no `queue` key.
pub const DEFAULT_TASK_QUEUE: &str = "tasks";

#[derive(Clone, Debug)]
pub struct Config {
    /// How long a worker may go without a heartbeat before the timeout
    /// sweeper considers it missing and requests cleanup.
    ///
    /// Workers heartbeat far more often than this; a worker that crosses the
    /// timeout has died without emitting a `worker-offline` event.
    pub worker_timeout: Duration,

    /// The period of the worker-timeout sweeper.
    ///
    /// The sweeper sleeps first and sweeps second, so no sweep runs before
    /// any heartbeat has had a chance to be recorded.
    pub sweep_frequency: Duration,

    /// How long a dispatched task stays in the failure-watch table without a
    /// terminal event before it is evicted.
    ///
    /// Eviction happens from the beat loop, so the table is bounded even if
    /// the event stream drops an outcome.
    pub failure_watch_ttl: Duration,

    /// The maximum number of seconds the beat loop will sleep between ticks.
    ///
    /// This bounds how long it can take to notice schedule changes in the
    /// store when nothing is due.
    pub max_beat_interval: Duration,

    /// Whether this scheduler is a throwaway instance.
    ///
    /// The beat framework constructs schedulers speculatively before
    /// committing to one. A lazy scheduler builds all of its internals but
    /// never spawns the event monitor or the timeout sweeper.
    pub lazy: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_timeout: Duration::from_secs(300),
            sweep_frequency: Duration::from_secs(60),
            failure_watch_ttl: Duration::from_secs(4 * 3600),
            max_beat_interval: Duration::from_secs(90),
            lazy: false,
        }
    }
}
