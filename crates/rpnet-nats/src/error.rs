use thiserror::Error;

/// Failures of [`KvBucket`](crate::KvBucket) operations.
///
/// Optimistic-concurrency conflicts get their own variants so retry loops
/// can tell a lost race apart from a substrate failure.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("key '{0}' already exists")]
    AlreadyExists(String),

    #[error("wrong last revision for key '{0}'")]
    WrongRevision(String),

    #[error("KV operation on '{key}' failed: {reason}")]
    Backend { key: String, reason: String },

    #[error("KV watch failed: {0}")]
    Watch(String),

    #[error("KV bucket '{bucket}' setup failed: {reason}")]
    Bucket { bucket: String, reason: String },
}

impl KvError {
    pub(crate) fn backend(key: &str, reason: impl ToString) -> Self {
        Self::Backend {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Lost an optimistic-concurrency race rather than failed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::AlreadyExists(_) | Self::WrongRevision(_))
    }
}

/// Failures of [`JetStream`](crate::JetStream) operations.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("publish to '{subject}' failed: {reason}")]
    Publish { subject: String, reason: String },

    #[error("consumer '{consumer}' failed: {reason}")]
    Consumer { consumer: String, reason: String },

    #[error("acknowledgement failed: {0}")]
    Ack(String),

    #[error("stream '{stream}' setup failed: {reason}")]
    Setup { stream: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_are_classified() {
        assert!(KvError::AlreadyExists("LOCK.a".into()).is_conflict());
        assert!(KvError::WrongRevision("LOCK.a".into()).is_conflict());
        assert!(!KvError::backend("LOCK.a", "timed out").is_conflict());
        assert!(!KvError::Watch("closed".into()).is_conflict());
    }

    #[test]
    fn display_names_the_key() {
        let err = KvError::backend("jobs.backup", "no responders");
        assert_eq!(
            err.to_string(),
            "KV operation on 'jobs.backup' failed: no responders"
        );
    }
}
