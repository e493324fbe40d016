//! # rpnet-nats
//!
//! The substrate the coordination layer runs on: NATS JetStream key/value
//! buckets and streams.
//!
//! - [`KvBucket`]: revisioned get/put/create/update/delete plus watches.
//! - [`JetStream`] / [`StreamMessage`]: publish and durable pull consumers
//!   with explicit ack, nak-with-delay and bounded redelivery.
//! - [`connect`]: connection with reconnect backoff and lifecycle logging.
//! - In-memory [`mocks`] of both traits (with the `test-support` feature).
//!
//! Everything above this crate depends on the traits only, so any substrate
//! with the same guarantees can stand in for NATS.
//!
//! ```rust,no_run
//! use rpnet_nats::{NatsConfig, connect, kv};
//! use rpnet_std::env::SystemEnv;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = connect(&NatsConfig::from_env(&SystemEnv)).await?;
//! let js = async_nats::jetstream::new(client);
//! let bucket = kv::get_or_create_bucket(&js, kv::BucketConfig::new("cronjobs")).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod connect;
pub mod error;
pub mod kv;
pub mod stream;

#[cfg(any(test, feature = "test-support"))]
pub mod mocks;

pub use auth::{NatsAuth, NatsConfig};
pub use connect::{ConnectError, connect};
pub use error::{KvError, StreamError};
pub use kv::{KvBucket, KvEntry, KvOperation, KvWatch, NatsKv};
pub use stream::{ConsumerConfig, JetStream, NatsStream, StreamMessage, StreamMessages};

#[cfg(any(test, feature = "test-support"))]
pub use mocks::{MockKv, MockMessage, MockStream};

/// Whether a NATS subject or KV key matches a pattern that may contain the
/// `*` (one token) and `>` (one or more trailing tokens) wildcards.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::subject_matches;

    #[test]
    fn exact_subject_matches() {
        assert!(subject_matches("cron.schedule", "cron.schedule"));
        assert!(!subject_matches("cron.schedule", "cron.complete"));
    }

    #[test]
    fn full_wildcard_matches_one_or_more_tokens() {
        assert!(subject_matches(">", "LOCK.jobs"));
        assert!(subject_matches("cron.>", "cron.schedule"));
        assert!(subject_matches("cron.>", "cron.a.b"));
        assert!(!subject_matches("cron.>", "cron"));
    }

    #[test]
    fn token_wildcard_matches_exactly_one_token() {
        assert!(subject_matches("jobs.*", "jobs.backup"));
        assert!(!subject_matches("jobs.*", "jobs.backup.extra"));
        assert!(!subject_matches("jobs.*", "jobs"));
    }
}
