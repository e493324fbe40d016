use rpnet_nats::KvBucket;
use rpnet_std::time::Clock;
use rpnet_sync::Store;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{Cronjob, CronjobState, MAX_TIMEOUT};
use crate::error::CronError;
use crate::handlers::sanitize_name;
use crate::schedule;

/// Cronjob definitions, replicated across the fleet through a [`Store`].
pub struct Registry<K: KvBucket, C: Clock> {
    store: Store<Cronjob, K>,
    clock: C,
}

impl<K: KvBucket, C: Clock> Clone for Registry<K, C> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<K: KvBucket, C: Clock> Registry<K, C> {
    pub fn new(store: Store<Cronjob, K>, clock: C) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Store<Cronjob, K> {
        &self.store
    }

    /// Load the registered jobs and follow changes until `cancel` fires.
    pub async fn start(&self, cancel: CancellationToken) -> Result<JoinHandle<()>, CronError> {
        let task = self.store.start(cancel, true).await?;
        info!(cronjobs = self.store.len(), "Cron registry loaded");
        Ok(task)
    }

    /// Validate `job` and insert it, or merge it into the existing
    /// definition of the same name.
    ///
    /// Re-registering an unchanged definition writes nothing and keeps the
    /// job's schedule position; a changed schedule recomputes
    /// `next_schedule_time`.
    pub async fn register_cronjob(&self, job: Cronjob) -> Result<Cronjob, CronError> {
        let key = sanitize_name(&job.name);
        if key.is_empty() {
            return Err(CronError::InvalidName(job.name));
        }
        schedule::parse(&job.schedule)?;
        let timeout_sec = validate_timeout(&key, job.timeout_sec)?;
        let now = self.clock.now();

        self.store
            .compute_update(&key, true, |key, existing| match existing {
                None => {
                    let next = schedule::next_after(&job.schedule, now)?;
                    info!(job = %key, schedule = %job.schedule, next = %next, "Registering cronjob");
                    Ok((
                        Cronjob {
                            name: key.to_string(),
                            state: CronjobState::Waiting,
                            next_schedule_time: Some(next),
                            timeout_sec: Some(timeout_sec),
                            ..job
                        },
                        true,
                    ))
                }
                Some(mut current) => {
                    let mut changed = false;
                    if current.schedule != job.schedule || current.next_schedule_time.is_none() {
                        current.next_schedule_time = Some(schedule::next_after(&job.schedule, now)?);
                        current.schedule = job.schedule;
                        changed = true;
                    }
                    if current.timeout_sec != Some(timeout_sec) {
                        current.timeout_sec = Some(timeout_sec);
                        changed = true;
                    }
                    if job.data.payload.is_some() && current.data.payload != job.data.payload {
                        current.data.payload = job.data.payload;
                        current.data.updated_at = Some(now);
                        changed = true;
                    }
                    if current.state == CronjobState::Unspecified {
                        current.state = CronjobState::Waiting;
                        changed = true;
                    }
                    if changed {
                        info!(job = %key, schedule = %current.schedule, "Updating cronjob");
                    } else {
                        debug!(job = %key, "Cronjob already registered");
                    }
                    Ok((current, changed))
                }
            })
            .await
    }

    pub async fn unregister_cronjob(&self, name: &str) -> Result<(), CronError> {
        let key = sanitize_name(name);
        self.store.delete(&key).await?;
        info!(job = %key, "Unregistered cronjob");
        Ok(())
    }

    pub fn get_cronjob(&self, name: &str) -> Option<Cronjob> {
        self.store.get(&sanitize_name(name))
    }

    /// All jobs, ordered by name.
    pub fn list_cronjobs(&self) -> Vec<Cronjob> {
        self.store.list()
    }
}

fn validate_timeout(name: &str, timeout_sec: Option<u64>) -> Result<u64, CronError> {
    let invalid = |reason: String| CronError::InvalidTimeout {
        name: name.to_string(),
        reason,
    };
    match timeout_sec {
        None => Ok(crate::config::DEFAULT_TIMEOUT.as_secs()),
        Some(0) => Err(invalid("timeout must be positive".to_string())),
        Some(secs) if secs > MAX_TIMEOUT.as_secs() => Err(invalid(format!(
            "{secs}s exceeds the {}s maximum",
            MAX_TIMEOUT.as_secs()
        ))),
        Some(secs) => Ok(secs),
    }
}
