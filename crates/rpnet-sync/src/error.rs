use rpnet_nats::KvError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock '{0}' is not held by this process")]
    NotHeld(String),

    #[error(transparent)]
    Kv(#[from] KvError),
}

#[derive(Debug, Error)]
pub enum ElectionError {
    #[error("invalid election config: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key '{0}' not found")]
    NotFound(String),

    #[error("failed to encode value for '{key}': {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode value for '{key}': {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Kv(#[from] KvError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_errors_wrap_kv_errors() {
        let err: LockError = KvError::WrongRevision("LOCK.a".into()).into();
        assert_eq!(err.to_string(), "wrong last revision for key 'LOCK.a'");
    }

    #[test]
    fn store_errors_name_the_key() {
        let source = serde_json::from_slice::<u32>(b"nope").unwrap_err();
        let err = StoreError::Decode {
            key: "demo".into(),
            source,
        };
        assert!(err.to_string().starts_with("failed to decode value for 'demo'"));
    }
}
