use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::json;

use crate::config::DEFAULT_TASK_QUEUE;
use crate::store::ScheduledCall;

/// Sleep returned when a cron spec has no upcoming occurrence at all. The
/// beat loop caps its sleep far below this anyway.
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 3600);

/// The iteration specifier of a schedule: either a fixed interval
/// ("30s", "5m 10s") or a crontab-like expression ("0 4 * * *").
#[derive(Clone, Debug)]
pub enum RunSchedule {
    Interval(Duration),
    Cron(Box<cron::Schedule>),
}

impl RunSchedule {
    pub fn parse(spec: &str) -> anyhow::Result<Self> {
        let spec = spec.trim();

        if let Ok(every) = humantime::parse_duration(spec) {
            anyhow::ensure!(!every.is_zero(), "interval schedules must be non-zero");
            return Ok(Self::Interval(every));
        }

        // Classic five-field crontab lines get a seconds column prepended,
        // since the cron parser wants six or seven fields.
        let expr = match spec.split_whitespace().count() {
            5 => format!("0 {spec}"),
            _ => spec.to_owned(),
        };

        let schedule = cron::Schedule::from_str(&expr)
            .with_context(|| format!("`{spec}` is neither an interval nor a cron expression"))?;

        Ok(Self::Cron(Box::new(schedule)))
    }

    /// Whether a schedule with the given last run is due at `now`, and how
    /// long until it next needs attention.
    ///
    /// For a due entry the returned duration is the time until the run after
    /// this one, which is what the beat loop folds into its sleep.
    pub fn is_due(&self, last_run: Option<NaiveDateTime>, now: NaiveDateTime) -> (bool, Duration) {
        match self {
            Self::Interval(every) => {
                let Some(last) = last_run else {
                    // Never ran: fire on first sight.
                    return (true, *every);
                };

                let delta = chrono::Duration::from_std(*every).unwrap_or(chrono::Duration::MAX);
                match last.checked_add_signed(delta) {
                    Some(next) if now >= next => (true, *every),
                    Some(next) => (false, until(next, now)),
                    None => (false, FAR_FUTURE),
                }
            }
            Self::Cron(schedule) => {
                let now_utc = Utc.from_utc_datetime(&now);
                let next_after = |base: DateTime<Utc>| schedule.after(&base).next();

                let Some(last) = last_run else {
                    // Never ran: wait for the next cron instant.
                    return match next_after(now_utc) {
                        Some(next) => (false, until(next.naive_utc(), now)),
                        None => (false, FAR_FUTURE),
                    };
                };

                match next_after(Utc.from_utc_datetime(&last)) {
                    Some(next) if next <= now_utc => {
                        let following = next_after(now_utc)
                            .map(|next| until(next.naive_utc(), now))
                            .unwrap_or(FAR_FUTURE);
                        (true, following)
                    }
                    Some(next) => (false, until(next.naive_utc(), now)),
                    None => (false, FAR_FUTURE),
                }
            }
        }
    }
}

fn until(next: NaiveDateTime, now: NaiveDateTime) -> Duration {
    (next - now).to_std().unwrap_or_default()
}

/// What the beat loop iterates: a schedule's dispatch-relevant fields,
/// copied out of its source [`ScheduledCall`] at snapshot time.
///
/// The failure-policy fields are snapshots too; they feed the submit-time
/// `had_failure` flag and refresh whenever the snapshot is rebuilt.
#[derive(Clone, Debug)]
pub struct ScheduleEntry {
    pub name: String,
    pub task: String,
    pub args: serde_json::Value,
    pub kwargs: serde_json::Value,
    pub queue: String,
    pub schedule: RunSchedule,
    pub last_run: Option<NaiveDateTime>,
    pub remaining_runs: Option<i64>,
    pub failure_threshold: Option<i64>,
    pub consecutive_failures: i64,
    /// Whether this entry came from the store. Static entries exist only in
    /// configuration, so there is no row to record their runs against.
    pub store_backed: bool,
}

impl ScheduleEntry {
    /// An entry for a statically configured schedule.
    pub fn new(name: impl Into<String>, task: impl Into<String>, schedule: RunSchedule) -> Self {
        Self {
            name: name.into(),
            task: task.into(),
            args: json!([]),
            kwargs: json!({}),
            queue: DEFAULT_TASK_QUEUE.to_owned(),
            schedule,
            last_run: None,
            remaining_runs: None,
            failure_threshold: None,
            consecutive_failures: 0,
            store_backed: false,
        }
    }

    pub fn from_call(call: &ScheduledCall) -> anyhow::Result<Self> {
        let schedule = RunSchedule::parse(&call.schedule)
            .with_context(|| format!("schedule `{}` has an invalid iteration spec", call.id))?;

        let queue = call
            .options
            .get("queue")
            .and_then(|queue| queue.as_str())
            .unwrap_or(DEFAULT_TASK_QUEUE)
            .to_owned();

        Ok(Self {
            name: call.id.clone(),
            task: call.task.clone(),
            args: call.args.clone(),
            kwargs: call.kwargs.clone(),
            queue,
            schedule,
            last_run: call.last_run,
            remaining_runs: call.remaining_runs,
            failure_threshold: call.failure_threshold,
            consecutive_failures: call.consecutive_failures,
            store_backed: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::scheduled_call;

    fn at(secs: i64) -> NaiveDateTime {
        DateTime::from_timestamp(secs, 0).unwrap().naive_utc()
    }

    #[test]
    fn parses_interval_specs() {
        match RunSchedule::parse("5m 30s").unwrap() {
            RunSchedule::Interval(every) => assert_eq!(every, Duration::from_secs(330)),
            other => panic!("expected an interval, got {other:?}"),
        }
    }

    #[test]
    fn parses_five_field_cron_specs() {
        assert!(matches!(
            RunSchedule::parse("0 4 * * *").unwrap(),
            RunSchedule::Cron(_)
        ));
    }

    #[test]
    fn rejects_garbage_specs() {
        assert!(RunSchedule::parse("whenever").is_err());
        assert!(RunSchedule::parse("0s").is_err());
    }

    #[test]
    fn interval_is_due_on_first_sight() {
        let schedule = RunSchedule::parse("30s").unwrap();
        let (due, sleep) = schedule.is_due(None, at(1_000));
        assert!(due);
        assert_eq!(sleep, Duration::from_secs(30));
    }

    #[test]
    fn interval_due_math() {
        let schedule = RunSchedule::parse("30s").unwrap();

        let (due, sleep) = schedule.is_due(Some(at(1_000)), at(1_010));
        assert!(!due);
        assert_eq!(sleep, Duration::from_secs(20));

        let (due, sleep) = schedule.is_due(Some(at(1_000)), at(1_030));
        assert!(due);
        assert_eq!(sleep, Duration::from_secs(30));
    }

    #[test]
    fn cron_waits_for_the_next_instant_when_never_run() {
        // Hourly on the hour; "now" is 00:16:40.
        let schedule = RunSchedule::parse("0 * * * *").unwrap();
        let (due, sleep) = schedule.is_due(None, at(1_000));
        assert!(!due);
        assert_eq!(sleep, Duration::from_secs(2_600));
    }

    #[test]
    fn cron_fires_once_per_instant() {
        let schedule = RunSchedule::parse("0 * * * *").unwrap();

        // Last ran at 00:00, now past 01:00: due.
        let (due, _) = schedule.is_due(Some(at(0)), at(3_660));
        assert!(due);

        // Last ran at exactly 01:00, still inside the hour: not due.
        let (due, sleep) = schedule.is_due(Some(at(3_600)), at(3_660));
        assert!(!due);
        assert_eq!(sleep, Duration::from_secs(3_540));
    }

    #[test]
    fn entry_takes_queue_from_options() {
        let mut call = scheduled_call("nightly-publish", "30s");
        call.options = json!({"queue": "publishing"});

        let entry = ScheduleEntry::from_call(&call).unwrap();
        assert_eq!(entry.queue, "publishing");

        call.options = json!({});
        let entry = ScheduleEntry::from_call(&call).unwrap();
        assert_eq!(entry.queue, DEFAULT_TASK_QUEUE);
    }

    #[test]
    fn entry_rejects_invalid_specs() {
        let call = scheduled_call("broken", "not-a-schedule");
        assert!(ScheduleEntry::from_call(&call).is_err());
    }
}
