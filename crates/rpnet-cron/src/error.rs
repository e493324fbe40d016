use rpnet_nats::{ConnectError, KvError, StreamError};
use rpnet_sync::{ElectionError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cronjob name '{0}'")]
    InvalidName(String),

    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error("invalid timeout for '{name}': {reason}")]
    InvalidTimeout { name: String, reason: String },

    #[error("cronjob '{0}' not found")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Election(#[from] ElectionError),

    #[error(transparent)]
    Connect(#[from] ConnectError),
}

impl CronError {
    /// A caller mistake rather than an infrastructure failure.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidName(_) | Self::InvalidSchedule { .. } | Self::InvalidTimeout { .. }
        )
    }
}
