use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use rand::Rng;
use rpnet_nats::{KvBucket, KvEntry, KvError};
use tracing::{debug, warn};

use crate::error::LockError;

/// Key prefix of lock records.
pub const LOCK_PREFIX: &str = "LOCK.";

const DEFAULT_MAX_LOCK_AGE: Duration = Duration::from_secs(30);

/// Named mutual exclusion over a KV bucket.
///
/// A lock is the record `LOCK.<name>` holding its expiry as big-endian unix
/// milliseconds. Acquisition is a create-if-absent, so at most one contender
/// wins per record. A record older than `max_lock_age` is considered
/// abandoned and any contender may delete it.
///
/// `lock` is cancel-safe: dropping the future (for example through
/// `tokio::time::timeout`) abandons the wait. If the drop lands while a
/// create is in flight the record is left for `max_lock_age` reclamation.
pub struct Lock<K: KvBucket> {
    kv: K,
    max_lock_age: Duration,
    held: Mutex<HashMap<String, u64>>,
}

impl<K: KvBucket> Lock<K> {
    pub fn new(kv: K) -> Self {
        Self {
            kv,
            max_lock_age: DEFAULT_MAX_LOCK_AGE,
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_max_lock_age(mut self, max_lock_age: Duration) -> Self {
        self.max_lock_age = max_lock_age;
        self
    }

    pub fn max_lock_age(&self) -> Duration {
        self.max_lock_age
    }

    /// Wait until this process holds `name`.
    pub async fn lock(&self, name: &str) -> Result<(), LockError> {
        let key = lock_key(name);
        loop {
            let Some(entry) = self.kv.entry(&key).await? else {
                match self.kv.create(&key, self.expiry()).await {
                    Ok(revision) => {
                        self.held_revisions().insert(name.to_string(), revision);
                        debug!(lock = %name, revision, "Lock acquired");
                        return Ok(());
                    }
                    Err(e) if e.is_conflict() => {
                        tokio::time::sleep(backoff()).await;
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            };

            if self.is_abandoned(&entry) {
                warn!(lock = %name, revision = entry.revision, "Reclaiming abandoned lock");
                self.reclaim(&entry).await?;
                continue;
            }

            tokio::time::sleep(backoff()).await;
        }
    }

    /// Release `name`. Only the revision this process created is deleted; if
    /// the record was reclaimed in the meantime the release is a no-op.
    pub async fn unlock(&self, name: &str) -> Result<(), LockError> {
        let revision = self
            .held_revisions()
            .remove(name)
            .ok_or_else(|| LockError::NotHeld(name.to_string()))?;

        match self.kv.delete(&lock_key(name), Some(revision)).await {
            Ok(()) => {
                debug!(lock = %name, revision, "Lock released");
                Ok(())
            }
            Err(KvError::WrongRevision(_)) => {
                warn!(lock = %name, revision, "Lock was reclaimed before release");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether this process currently believes it holds `name`.
    pub fn is_held(&self, name: &str) -> bool {
        self.held_revisions().contains_key(name)
    }

    fn held_revisions(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expiry(&self) -> Bytes {
        let max_age = i64::try_from(self.max_lock_age.as_millis()).unwrap_or(i64::MAX);
        let expires_at = Utc::now().timestamp_millis().saturating_add(max_age);
        Bytes::copy_from_slice(&expires_at.to_be_bytes())
    }

    fn is_abandoned(&self, entry: &KvEntry) -> bool {
        let age = (Utc::now() - entry.created).to_std().unwrap_or_default();
        if age > self.max_lock_age {
            return true;
        }
        match <[u8; 8]>::try_from(entry.value.as_ref()) {
            Ok(raw) => i64::from_be_bytes(raw) < Utc::now().timestamp_millis(),
            Err(_) => true,
        }
    }

    async fn reclaim(&self, entry: &KvEntry) -> Result<(), LockError> {
        match self.kv.delete(&entry.key, Some(entry.revision)).await {
            Ok(()) => Ok(()),
            // Someone else already reclaimed or re-acquired it.
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub(crate) fn lock_key(name: &str) -> String {
    format!("{LOCK_PREFIX}{name}")
}

fn backoff() -> Duration {
    Duration::from_millis(rand::rng().random_range(50..=200))
}
