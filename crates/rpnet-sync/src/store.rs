use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures::StreamExt;
use rpnet_nats::{KvBucket, KvEntry};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::lock::{LOCK_PREFIX, Lock};

/// How long `start` waits for the history snapshot before going live.
const REPLAY_DEADLINE: Duration = Duration::from_millis(500);

/// A value that can be reconciled with another version of itself.
///
/// Every change to a cached value, local or remote, goes through `merge`.
pub trait Merge: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn merge(&mut self, incoming: Self);
}

type UpdateFn<T> = Arc<dyn Fn(&str, &T) + Send + Sync>;
type DeleteFn<T> = Arc<dyn Fn(&str, Option<&T>) + Send + Sync>;

enum LockMode<K: KvBucket> {
    OwnBucket,
    Shared(Arc<Lock<K>>),
    Disabled,
}

/// Configures a [`Store`].
pub struct StoreBuilder<T, K: KvBucket> {
    kv: K,
    prefix: String,
    lock: LockMode<K>,
    on_update: Option<UpdateFn<T>>,
    on_delete: Option<DeleteFn<T>>,
    on_remote_update: Option<UpdateFn<T>>,
    on_remote_delete: Option<DeleteFn<T>>,
}

impl<T: Merge, K: KvBucket> StoreBuilder<T, K> {
    /// Only keys under `prefix` belong to the store; it is stripped from the
    /// keys the store hands out.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Serialize writers through a shared lock instead of one over the
    /// store's own bucket.
    pub fn lock(mut self, lock: Arc<Lock<K>>) -> Self {
        self.lock = LockMode::Shared(lock);
        self
    }

    /// Write without any locking. Only safe with a single writer.
    pub fn without_lock(mut self) -> Self {
        self.lock = LockMode::Disabled;
        self
    }

    pub fn on_update(mut self, f: impl Fn(&str, &T) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Arc::new(f));
        self
    }

    pub fn on_delete(mut self, f: impl Fn(&str, Option<&T>) + Send + Sync + 'static) -> Self {
        self.on_delete = Some(Arc::new(f));
        self
    }

    pub fn on_remote_update(mut self, f: impl Fn(&str, &T) + Send + Sync + 'static) -> Self {
        self.on_remote_update = Some(Arc::new(f));
        self
    }

    pub fn on_remote_delete(
        mut self,
        f: impl Fn(&str, Option<&T>) + Send + Sync + 'static,
    ) -> Self {
        self.on_remote_delete = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Store<T, K> {
        let lock = match self.lock {
            LockMode::OwnBucket => Some(Arc::new(Lock::new(self.kv.clone()))),
            LockMode::Shared(lock) => Some(lock),
            LockMode::Disabled => None,
        };
        Store {
            inner: Arc::new(Inner {
                kv: self.kv,
                prefix: self.prefix,
                lock,
                cache: RwLock::new(Replica::default()),
                on_update: self.on_update,
                on_delete: self.on_delete,
                on_remote_update: self.on_remote_update,
                on_remote_delete: self.on_remote_delete,
            }),
        }
    }
}

struct Cached<T> {
    value: T,
    revision: u64,
}

struct Replica<T> {
    entries: BTreeMap<String, Cached<T>>,
    /// Locally deleted key → newest revision known before the delete. Watch
    /// puts at or below it are stale echoes.
    tombstones: HashMap<String, u64>,
}

impl<T> Default for Replica<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            tombstones: HashMap::new(),
        }
    }
}

struct Inner<T, K: KvBucket> {
    kv: K,
    prefix: String,
    lock: Option<Arc<Lock<K>>>,
    cache: RwLock<Replica<T>>,
    on_update: Option<UpdateFn<T>>,
    on_delete: Option<DeleteFn<T>>,
    on_remote_update: Option<UpdateFn<T>>,
    on_remote_delete: Option<DeleteFn<T>>,
}

/// Replicated object cache over a KV bucket.
///
/// Reads are served from the local cache and never block on the network.
/// Writes go to the bucket under a per-key [`Lock`] and are merged into the
/// cache; the watch started by [`Store::start`] merges everyone else's
/// writes. Each cached entry remembers the bucket revision it reflects, so
/// replayed or echoed events never roll it back.
///
/// Clones share the cache.
pub struct Store<T: Merge, K: KvBucket> {
    inner: Arc<Inner<T, K>>,
}

impl<T: Merge, K: KvBucket> Clone for Store<T, K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Merge, K: KvBucket> Store<T, K> {
    pub fn builder(kv: K) -> StoreBuilder<T, K> {
        StoreBuilder {
            kv,
            prefix: String::new(),
            lock: LockMode::OwnBucket,
            on_update: None,
            on_delete: None,
            on_remote_update: None,
            on_remote_delete: None,
        }
    }

    // ── reads ────────────────────────────────────────────────────────────────

    pub fn get(&self, key: &str) -> Option<T> {
        self.read_cache()
            .entries
            .get(key)
            .map(|cached| cached.value.clone())
    }

    /// All cached values, ordered by key.
    pub fn list(&self) -> Vec<T> {
        self.read_cache()
            .entries
            .values()
            .map(|cached| cached.value.clone())
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.read_cache().entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read_cache().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_cache().entries.is_empty()
    }

    /// Visit a snapshot of the cache in key order until `f` returns `false`.
    pub fn range(&self, mut f: impl FnMut(&str, &T) -> bool) {
        let snapshot: Vec<(String, T)> = self
            .read_cache()
            .entries
            .iter()
            .map(|(key, cached)| (key.clone(), cached.value.clone()))
            .collect();
        for (key, value) in &snapshot {
            if !f(key, value) {
                break;
            }
        }
    }

    /// The cached value, or the bucket's value merged into the cache.
    pub async fn get_or_load(&self, key: &str) -> Result<T, StoreError> {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let (value, revision) = self
            .fetch(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let (value, _) = self.merge_into_cache(key, value, revision);
        Ok(value)
    }

    // ── writes ───────────────────────────────────────────────────────────────

    pub async fn put(&self, key: &str, value: T) -> Result<(), StoreError> {
        self.locked(key, async {
            self.persist(key, value).await?;
            Ok::<(), StoreError>(())
        })
        .await
    }

    /// Read-modify-write of one key under its lock.
    ///
    /// `f` receives the current value (read fresh from the bucket when
    /// `load` is set, from the cache otherwise) and returns the new value and
    /// whether to persist it. Returns the value now held for `key`.
    pub async fn compute_update<F, E>(&self, key: &str, load: bool, f: F) -> Result<T, E>
    where
        F: FnOnce(&str, Option<T>) -> Result<(T, bool), E>,
        E: From<StoreError>,
    {
        self.locked(key, async {
            let existing = if load {
                self.fetch(key).await?.map(|(value, _)| value)
            } else {
                self.get(key)
            };
            let (updated, persist) = f(key, existing)?;
            if !persist {
                return Ok(updated);
            }
            let persisted = self.persist(key, updated).await?;
            Ok::<T, E>(persisted)
        })
        .await
    }

    /// Delete `key` from the bucket and the replica. Echoes of earlier
    /// writes still in flight on the watch do not bring it back.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.locked(key, async {
            let kv_key = self.kv_key(key);
            let latest = self.inner.kv.entry(&kv_key).await?.map(|entry| entry.revision);
            self.inner.kv.delete(&kv_key, None).await?;
            let removed = {
                let mut cache = self.write_cache();
                let removed = cache.entries.remove(key);
                if let Some(revision) = latest.max(removed.as_ref().map(|cached| cached.revision)) {
                    cache.tombstones.insert(key.to_string(), revision);
                }
                removed.map(|cached| cached.value)
            };
            if let Some(on_delete) = &self.inner.on_delete {
                on_delete(key, removed.as_ref());
            }
            Ok::<(), StoreError>(())
        })
        .await
    }

    /// Delete every key this replica holds. Keys the replica has not loaded
    /// (before [`Store::start`], or outside the prefix) are left alone.
    pub async fn clear(&self) -> Result<(), StoreError> {
        for key in self.keys() {
            self.delete(&key).await?;
        }
        Ok(())
    }

    // ── replication ──────────────────────────────────────────────────────────

    /// Watch the bucket and merge remote changes into the cache until
    /// `cancel` fires or the watch ends.
    ///
    /// With `replay_history` the existing keys are loaded before this
    /// returns. The returned task ends when the watch terminates so the
    /// caller can start it again.
    pub async fn start(
        &self,
        cancel: CancellationToken,
        replay_history: bool,
    ) -> Result<JoinHandle<()>, StoreError> {
        let mut watch = self.inner.kv.watch(">", replay_history).await?;

        if replay_history {
            let deadline = tokio::time::sleep(REPLAY_DEADLINE);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    entry = watch.next() => match entry {
                        Some(Ok(entry)) => {
                            let last = entry.delta == 0;
                            self.apply(entry);
                            if last {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(bucket = %self.inner.kv.bucket(), error = %e, "Store replay failed");
                            break;
                        }
                        None => break,
                    },
                    _ = &mut deadline => break,
                }
            }
            info!(bucket = %self.inner.kv.bucket(), entries = self.len(), "Store replayed");
        }

        let store = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    entry = watch.next() => match entry {
                        Some(Ok(entry)) => store.apply(entry),
                        Some(Err(e)) => {
                            warn!(bucket = %store.inner.kv.bucket(), error = %e, "Store watch error");
                        }
                        None => {
                            warn!(bucket = %store.inner.kv.bucket(), "Store watch ended");
                            break;
                        }
                    },
                }
            }
        }))
    }

    fn apply(&self, entry: KvEntry) {
        let Some(key) = self.store_key(&entry.key) else {
            return;
        };
        let key = key.to_string();

        if entry.is_removal() {
            let removed = {
                let mut cache = self.write_cache();
                if cache
                    .tombstones
                    .get(&key)
                    .is_some_and(|&tombstone| tombstone < entry.revision)
                {
                    cache.tombstones.remove(&key);
                }
                match cache.entries.get(&key) {
                    Some(cached) if cached.revision < entry.revision => {
                        cache.entries.remove(&key).map(|cached| cached.value)
                    }
                    _ => None,
                }
            };
            if let Some(value) = removed {
                debug!(key = %key, revision = entry.revision, "Remote delete");
                if let Some(on_remote_delete) = &self.inner.on_remote_delete {
                    on_remote_delete(&key, Some(&value));
                }
            }
            return;
        }

        let value: T = match serde_json::from_slice(&entry.value) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Skipping undecodable store entry");
                return;
            }
        };
        let (merged, changed) = self.merge_into_cache(&key, value, entry.revision);
        if !changed {
            return;
        }
        if let Some(on_remote_update) = &self.inner.on_remote_update {
            on_remote_update(&key, &merged);
        }
    }

    // ── internals ────────────────────────────────────────────────────────────

    async fn locked<R, E, Fut>(&self, key: &str, op: Fut) -> Result<R, E>
    where
        Fut: Future<Output = Result<R, E>>,
        E: From<StoreError>,
    {
        let Some(lock) = &self.inner.lock else {
            return op.await;
        };
        let name = self.kv_key(key);
        lock.lock(&name)
            .await
            .map_err(|e| E::from(StoreError::from(e)))?;
        let result = op.await;
        if let Err(e) = lock.unlock(&name).await {
            warn!(key = %key, error = %e, "Failed to release store lock");
        }
        result
    }

    async fn persist(&self, key: &str, value: T) -> Result<T, StoreError> {
        let bytes = serde_json::to_vec(&value).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;
        let revision = self.inner.kv.put(&self.kv_key(key), bytes.into()).await?;
        let (merged, _) = self.merge_into_cache(key, value, revision);
        if let Some(on_update) = &self.inner.on_update {
            on_update(key, &merged);
        }
        Ok(merged)
    }

    async fn fetch(&self, key: &str) -> Result<Option<(T, u64)>, StoreError> {
        let Some(entry) = self.inner.kv.entry(&self.kv_key(key)).await? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&entry.value).map_err(|source| StoreError::Decode {
            key: key.to_string(),
            source,
        })?;
        Ok(Some((value, entry.revision)))
    }

    /// Merge `value` at `revision` into the cache. Returns the value now
    /// cached and whether it changed; revisions the cache already reflects,
    /// or that predate a local delete, are ignored.
    fn merge_into_cache(&self, key: &str, value: T, revision: u64) -> (T, bool) {
        let mut cache = self.write_cache();
        match cache.tombstones.get(key).copied() {
            // Written before our delete; the key stays gone.
            Some(tombstone) if revision <= tombstone => return (value, false),
            Some(_) => {
                cache.tombstones.remove(key);
            }
            None => {}
        }
        match cache.entries.get_mut(key) {
            Some(cached) if cached.revision >= revision => (cached.value.clone(), false),
            Some(cached) => {
                cached.value.merge(value);
                cached.revision = revision;
                (cached.value.clone(), true)
            }
            None => {
                cache.entries.insert(
                    key.to_string(),
                    Cached {
                        value: value.clone(),
                        revision,
                    },
                );
                (value, true)
            }
        }
    }

    fn kv_key(&self, key: &str) -> String {
        format!("{}{key}", self.inner.prefix)
    }

    fn store_key<'a>(&self, kv_key: &'a str) -> Option<&'a str> {
        if kv_key.starts_with(LOCK_PREFIX) {
            return None;
        }
        kv_key.strip_prefix(self.inner.prefix.as_str())
    }

    fn read_cache(&self) -> RwLockReadGuard<'_, Replica<T>> {
        self.inner.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, Replica<T>> {
        self.inner.cache.write().unwrap_or_else(PoisonError::into_inner)
    }
}
