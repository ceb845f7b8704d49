use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A worker liveness event.
///
/// Workers emit these periodically; the broker also re-broadcasts one from
/// every live worker in response to a wakeup request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub hostname: String,
    pub timestamp: f64,
}

/// Emitted when a worker shuts down gracefully.
///
/// A worker that dies abruptly never emits this; the timeout sweeper covers
/// that case instead.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerOffline {
    pub hostname: String,
    pub timestamp: f64,
}

/// Emitted when a task reaches a successful terminal state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSucceeded {
    pub uuid: Uuid,
    pub hostname: String,
    pub timestamp: f64,
    #[serde(default)]
    pub result: TaskOutcome,
}

/// Emitted when a task reaches a failed terminal state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskFailed {
    pub uuid: Uuid,
    pub hostname: String,
    pub timestamp: f64,
}

/// The result carried by a `task-succeeded` event.
///
/// A task may finish by handing its work off to a chained task, in which
/// case the interesting outcome is the child's, not this one's.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The task produced a plain value.
    Value(serde_json::Value),

    /// The task's result is another, still-pending task.
    Pending { task: Uuid },
}

impl Default for TaskOutcome {
    fn default() -> Self {
        Self::Value(serde_json::Value::Null)
    }
}

impl TaskOutcome {
    /// The chained task id, if this outcome is a task reference.
    pub fn pending_task(&self) -> Option<Uuid> {
        match self {
            Self::Pending { task } => Some(*task),
            Self::Value(_) => None,
        }
    }
}

/// Convert a wire timestamp (seconds since the epoch) into the naive UTC
/// representation the registry stores.
pub(crate) fn naive_utc_from_epoch(timestamp: f64) -> Option<NaiveDateTime> {
    if !timestamp.is_finite() || timestamp < 0.0 {
        return None;
    }

    let secs = timestamp.trunc() as i64;
    let nanos = (timestamp.fract() * 1_000_000_000.0) as u32;
    DateTime::from_timestamp(secs, nanos).map(|at| at.naive_utc())
}
