use std::fmt;

/// Returned by [`Scheduler::add`](crate::Scheduler::add).
///
/// Schedules cannot be added to a running scheduler in place; they are
/// written to the schedule store and picked up by cache invalidation.
#[derive(Copy, Clone, Debug, Default)]
pub struct UnsupportedOperation;

impl fmt::Display for UnsupportedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "schedules cannot be added in place, write them to the schedule store instead"
        )
    }
}

impl std::error::Error for UnsupportedOperation {}

/// A broker event that could not be decoded.
///
/// Malformed events are logged and dropped; they never take down the event
/// monitor.
#[derive(Clone, Debug)]
pub struct MalformedEvent {
    kind: &'static str,
    reason: String,
}

impl MalformedEvent {
    pub(crate) fn new(kind: &'static str, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    /// The event kind as it appeared on the wire, e.g. `worker-heartbeat`.
    pub fn kind(&self) -> &str {
        self.kind
    }
}

impl fmt::Display for MalformedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dropping malformed '{}' event: {}", self.kind, self.reason)
    }
}

impl std::error::Error for MalformedEvent {}
