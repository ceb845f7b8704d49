use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgNotification};

use crate::error::MalformedEvent;

mod events;

pub use self::events::*;

pub const CHANNEL_WORKER_HEARTBEAT: &str = "pressroom:worker-heartbeat";
pub const CHANNEL_WORKER_OFFLINE: &str = "pressroom:worker-offline";
pub const CHANNEL_TASK_SUCCEEDED: &str = "pressroom:task-succeeded";
pub const CHANNEL_TASK_FAILED: &str = "pressroom:task-failed";

/// The control channel workers listen on. A notification here asks every
/// live worker to emit a fresh heartbeat, which bootstraps discovery when
/// the monitor starts after the workers did.
pub const CHANNEL_WAKEUP: &str = "pressroom:wakeup";

#[derive(Clone, Debug)]
pub enum Event {
    WorkerHeartbeat(WorkerHeartbeat),
    WorkerOffline(WorkerOffline),
    TaskSucceeded(TaskSucceeded),
    TaskFailed(TaskFailed),
}

/// A factory for broker event streams.
///
/// The event monitor opens a fresh stream on every (re)entry, so the bus
/// outlives any individual connection.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Box<dyn EventStream>>;
}

/// One open subscription to the four broker event kinds.
#[async_trait]
pub trait EventStream: Send {
    /// Ask already-running workers to emit a fresh heartbeat.
    async fn request_wakeup(&mut self) -> anyhow::Result<()>;

    /// Receive the next event. Blocking and unbounded; an error here means
    /// the subscription is gone and the caller must reconnect.
    async fn next(&mut self) -> anyhow::Result<Event>;
}

/// The Postgres-backed event bus, carried over LISTEN/NOTIFY.
pub struct PgEventBus {
    pool: sqlx::PgPool,
}

impl PgEventBus {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventBus for PgEventBus {
    async fn connect(&self) -> anyhow::Result<Box<dyn EventStream>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;

        listener
            .listen_all([
                CHANNEL_WORKER_HEARTBEAT,
                CHANNEL_WORKER_OFFLINE,
                CHANNEL_TASK_SUCCEEDED,
                CHANNEL_TASK_FAILED,
            ])
            .await?;

        Ok(Box::new(PgEventStream {
            listener,
            pool: self.pool.clone(),
        }))
    }
}

pub struct PgEventStream {
    listener: PgListener,
    pool: sqlx::PgPool,
}

#[async_trait]
impl EventStream for PgEventStream {
    async fn request_wakeup(&mut self) -> anyhow::Result<()> {
        sqlx::query("SELECT pg_notify($1, '')")
            .bind(CHANNEL_WAKEUP)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn next(&mut self) -> anyhow::Result<Event> {
        loop {
            match self.listener.try_recv().await {
                Ok(Some(notification)) => {
                    tracing::trace!(
                        "received event {}: {}",
                        notification.channel(),
                        notification.payload()
                    );

                    match parse_notification(&notification) {
                        Ok(Some(event)) => return Ok(event),
                        // A channel we never subscribed to.
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::error!("{e}");
                            continue;
                        }
                    }
                }
                // The connection was lost and sqlx reconnected underneath
                // us. Notifications may have been missed, so force the
                // monitor to re-enter and re-request a wakeup.
                Ok(None) => anyhow::bail!("event subscription was reset"),
                Err(e) => return Err(anyhow::Error::from(e).context("failed to receive event")),
            }
        }
    }
}

fn parse_notification(notification: &PgNotification) -> Result<Option<Event>, MalformedEvent> {
    fn parse<T, F>(kind: &'static str, payload: &str, wrap: F) -> Result<Option<Event>, MalformedEvent>
    where
        T: serde::de::DeserializeOwned,
        F: FnOnce(T) -> Event,
    {
        serde_json::from_str(payload)
            .map(|event| Some(wrap(event)))
            .map_err(|e| MalformedEvent::new(kind, e.to_string()))
    }

    let payload = notification.payload();
    match notification.channel() {
        CHANNEL_WORKER_HEARTBEAT => parse("worker-heartbeat", payload, Event::WorkerHeartbeat),
        CHANNEL_WORKER_OFFLINE => parse("worker-offline", payload, Event::WorkerOffline),
        CHANNEL_TASK_SUCCEEDED => parse("task-succeeded", payload, Event::TaskSucceeded),
        CHANNEL_TASK_FAILED => parse("task-failed", payload, Event::TaskFailed),
        _ => Ok(None),
    }
}
