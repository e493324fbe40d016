use std::time::Duration;

use chrono::{DateTime, Utc};
use rpnet_sync::Merge;
use serde::{Deserialize, Serialize};

/// Applied when a cronjob is registered without a timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// Longest timeout a cronjob may ask for.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// `UNSPECIFIED → WAITING` on registration, `PENDING` once dispatched, back
/// to `WAITING` when the completion is consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CronjobState {
    #[default]
    Unspecified,
    Waiting,
    Pending,
    Running,
}

/// Opaque payload carried from run to run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CronjobData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CronjobData {
    pub fn new(payload: serde_json::Value, updated_at: DateTime<Utc>) -> Self {
        Self {
            payload: Some(payload),
            updated_at: Some(updated_at),
        }
    }
}

/// Job definition and scheduling state, stored in the `cronjobs` bucket
/// under its sanitized name.
///
/// ```json
/// {
///   "name": "node_heartbeat",
///   "schedule": "*/1 * * * *",
///   "state": "WAITING",
///   "next_schedule_time": "2026-01-01T00:01:00Z",
///   "timeout_sec": 60,
///   "data": { "payload": { "runs": 3 }, "updated_at": "2026-01-01T00:00:00Z" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cronjob {
    pub name: String,
    /// 5- or 6-field cron expression, a `@` descriptor, or `@always`.
    pub schedule: String,
    #[serde(default)]
    pub state: CronjobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_schedule_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub data: CronjobData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_event: Option<CronjobCompletedEvent>,
}

impl Cronjob {
    pub fn new(name: impl Into<String>, schedule: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schedule: schedule.into(),
            state: CronjobState::Unspecified,
            next_schedule_time: None,
            last_attempt_time: None,
            timeout_sec: None,
            data: CronjobData::default(),
            last_completed_event: None,
        }
    }

    /// Timeouts are stored in whole seconds; fractions round up.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
        self.timeout_sec = Some(secs);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.data.payload = Some(payload);
        self
    }

    /// Run deadline, [`DEFAULT_TIMEOUT`] when unset.
    pub fn timeout(&self) -> Duration {
        self.timeout_sec
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_schedule_time.is_some_and(|at| at <= now)
    }
}

impl Merge for Cronjob {
    /// The incoming definition wins, except that attempt times only move
    /// forward and the newer data payload is kept.
    fn merge(&mut self, incoming: Self) {
        let last_attempt_time = self.last_attempt_time.max(incoming.last_attempt_time);
        let data = if incoming.data.updated_at >= self.data.updated_at {
            incoming.data
        } else {
            std::mem::take(&mut self.data)
        };
        *self = Self {
            last_attempt_time,
            data,
            ..incoming
        };
    }
}

/// Published on `cron.schedule` when a job is due.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronjobSchedulerEvent {
    pub cronjob: Cronjob,
    pub scheduled_at: DateTime<Utc>,
}

/// Published on `cron.complete` after every run, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronjobCompletedEvent {
    pub name: String,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub node_name: String,
    /// Data returned by the handler, if it returned any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<CronjobData>,
}
