use std::future::Future;
use std::time::Duration;

use async_nats::jetstream::{self, kv};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::error::KvError;

/// Stream of entries produced by [`KvBucket::watch`].
pub type KvWatch = BoxStream<'static, Result<KvEntry, KvError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvOperation {
    Put,
    Delete,
    Purge,
}

/// One revision of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Bytes,
    pub revision: u64,
    /// Entries still pending in a history replay after this one; `0` marks
    /// the end of the initial snapshot.
    pub delta: u64,
    pub created: DateTime<Utc>,
    pub operation: KvOperation,
}

impl KvEntry {
    pub fn is_removal(&self) -> bool {
        self.operation != KvOperation::Put
    }
}

/// Revisioned key/value operations, one bucket per handle.
///
/// `delete` with `Some(revision)` only succeeds while the key is still at
/// that revision; conflicts surface as [`KvError::AlreadyExists`] and
/// [`KvError::WrongRevision`].
pub trait KvBucket: Send + Sync + Clone + 'static {
    fn bucket(&self) -> &str;

    /// Latest live value of `key`; deleted or purged keys read as `None`.
    fn entry(&self, key: &str) -> impl Future<Output = Result<Option<KvEntry>, KvError>> + Send;

    fn put(&self, key: &str, value: Bytes) -> impl Future<Output = Result<u64, KvError>> + Send;

    /// Write only if the key has no live value.
    fn create(&self, key: &str, value: Bytes)
    -> impl Future<Output = Result<u64, KvError>> + Send;

    /// Write only if the key is still at `revision`.
    fn update(
        &self,
        key: &str,
        value: Bytes,
        revision: u64,
    ) -> impl Future<Output = Result<u64, KvError>> + Send;

    fn delete(
        &self,
        key: &str,
        revision: Option<u64>,
    ) -> impl Future<Output = Result<(), KvError>> + Send;

    fn purge(&self, key: &str) -> impl Future<Output = Result<(), KvError>> + Send;

    /// Watch keys matching `pattern` (`>` for the whole bucket). With
    /// `history`, the current value of every matching key is delivered
    /// first.
    fn watch(
        &self,
        pattern: &str,
        history: bool,
    ) -> impl Future<Output = Result<KvWatch, KvError>> + Send;
}

/// [`KvBucket`] backed by a JetStream key/value store.
#[derive(Clone)]
pub struct NatsKv {
    store: kv::Store,
    bucket: String,
}

impl NatsKv {
    pub fn new(store: kv::Store, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }
}

impl From<kv::Entry> for KvEntry {
    fn from(entry: kv::Entry) -> Self {
        let nanos = i64::try_from(entry.created.unix_timestamp_nanos()).unwrap_or(i64::MAX);
        Self {
            key: entry.key,
            value: entry.value,
            revision: entry.revision,
            delta: entry.delta,
            created: DateTime::from_timestamp_nanos(nanos),
            operation: match entry.operation {
                kv::Operation::Put => KvOperation::Put,
                kv::Operation::Delete => KvOperation::Delete,
                kv::Operation::Purge => KvOperation::Purge,
            },
        }
    }
}

impl KvBucket for NatsKv {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn entry(&self, key: &str) -> Result<Option<KvEntry>, KvError> {
        match self
            .store
            .entry(key)
            .await
            .map_err(|e| KvError::backend(key, e))?
        {
            Some(entry) if entry.operation == kv::Operation::Put => Ok(Some(entry.into())),
            _ => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<u64, KvError> {
        self.store
            .put(key, value)
            .await
            .map_err(|e| KvError::backend(key, e))
    }

    async fn create(&self, key: &str, value: Bytes) -> Result<u64, KvError> {
        self.store.create(key, value).await.map_err(|e| match e.kind() {
            kv::CreateErrorKind::AlreadyExists => KvError::AlreadyExists(key.to_string()),
            _ => KvError::backend(key, e),
        })
    }

    async fn update(&self, key: &str, value: Bytes, revision: u64) -> Result<u64, KvError> {
        self.store
            .update(key, value, revision)
            .await
            .map_err(|e| match e.kind() {
                kv::UpdateErrorKind::WrongLastRevision => KvError::WrongRevision(key.to_string()),
                _ => KvError::backend(key, e),
            })
    }

    async fn delete(&self, key: &str, revision: Option<u64>) -> Result<(), KvError> {
        self.store
            .delete_expect_revision(key, revision)
            .await
            .map_err(|e| match e.kind() {
                kv::DeleteErrorKind::WrongLastRevision => KvError::WrongRevision(key.to_string()),
                _ => KvError::backend(key, e),
            })
    }

    async fn purge(&self, key: &str) -> Result<(), KvError> {
        self.store
            .purge(key)
            .await
            .map_err(|e| KvError::backend(key, e))
    }

    async fn watch(&self, pattern: &str, history: bool) -> Result<KvWatch, KvError> {
        let watch = if history {
            self.store.watch_with_history(pattern).await
        } else {
            self.store.watch(pattern).await
        }
        .map_err(|e| KvError::Watch(e.to_string()))?;

        Ok(watch
            .map(|entry| {
                entry
                    .map(KvEntry::from)
                    .map_err(|e| KvError::Watch(e.to_string()))
            })
            .boxed())
    }
}

/// Bucket settings the coordination layer cares about.
#[derive(Debug, Clone)]
pub struct BucketConfig {
    pub name: String,
    pub history: i64,
    /// Per-key TTL; `None` keeps values forever.
    pub max_age: Option<Duration>,
    /// How long the delete marker left by a TTL expiry is kept. Without it
    /// expiries are silent and watchers never see the key go.
    pub marker_ttl: Option<Duration>,
    pub description: String,
}

impl BucketConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            history: 1,
            max_age: None,
            marker_ttl: None,
            description: String::new(),
        }
    }

    pub fn history(mut self, history: i64) -> Self {
        self.history = history;
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn marker_ttl(mut self, marker_ttl: Duration) -> Self {
        self.marker_ttl = Some(marker_ttl);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Create the bucket, or bind to it if another node already did.
pub async fn get_or_create_bucket(
    js: &jetstream::Context,
    config: BucketConfig,
) -> Result<NatsKv, KvError> {
    let name = config.name.clone();
    let created = js
        .create_key_value(kv::Config {
            bucket: config.name,
            description: config.description,
            history: config.history,
            max_age: config.max_age.unwrap_or_default(),
            limit_markers: config.marker_ttl,
            ..Default::default()
        })
        .await;

    let store = match created {
        Ok(store) => store,
        Err(_) => js
            .get_key_value(&name)
            .await
            .map_err(|e| KvError::Bucket {
                bucket: name.clone(),
                reason: e.to_string(),
            })?,
    };
    Ok(NatsKv::new(store, name))
}
