use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use rpnet_nats::{ConsumerConfig, JetStream, KvBucket, StreamMessage};
use rpnet_std::time::Clock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Cronjob, CronjobCompletedEvent, CronjobSchedulerEvent, CronjobState};
use crate::error::CronError;
use crate::kv::{COMPLETE_SUBJECT, SCHEDULE_SUBJECT, SCHEDULER_CONSUMER};
use crate::registry::Registry;
use crate::schedule;

const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Redelivery delay for completions that could not be recorded.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Dispatches due jobs and records their completions. Runs only on the
/// elected leader.
pub struct Scheduler<K: KvBucket, S: JetStream, C: Clock> {
    registry: Registry<K, C>,
    stream: S,
    clock: C,
    tick_interval: Duration,
}

impl<K: KvBucket, S: JetStream, C: Clock> Clone for Scheduler<K, S, C> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            stream: self.stream.clone(),
            clock: self.clock.clone(),
            tick_interval: self.tick_interval,
        }
    }
}

impl<K: KvBucket, S: JetStream, C: Clock> Scheduler<K, S, C> {
    pub fn new(registry: Registry<K, C>, stream: S, clock: C) -> Self {
        Self {
            registry,
            stream,
            clock,
            tick_interval: TICK_INTERVAL,
        }
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Tick and consume completions until `leadership` is cancelled.
    pub async fn run(&self, leadership: CancellationToken) -> Result<(), CronError> {
        let mut completions = self
            .stream
            .consume(ConsumerConfig::new(SCHEDULER_CONSUMER, COMPLETE_SUBJECT))
            .await?;
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Cron scheduler running");
        loop {
            tokio::select! {
                _ = leadership.cancelled() => break,

                _ = ticker.tick() => {
                    self.tick().await;
                }

                message = completions.next() => match message {
                    Some(Ok(message)) => self.handle_completion(message).await,
                    Some(Err(e)) => warn!(error = %e, "Completion consumer error"),
                    None => {
                        warn!("Completion consumer ended");
                        break;
                    }
                },
            }
        }
        info!("Cron scheduler stopped");
        Ok(())
    }

    /// Dispatch every due job once. Returns how many were dispatched.
    pub async fn tick(&self) -> usize {
        let now = self.clock.now();
        let mut dispatched = 0;
        for job in self.registry.list_cronjobs() {
            if job.next_schedule_time.is_none() {
                self.reschedule(&job.name, now).await;
                continue;
            }
            if !job.is_due(now) {
                continue;
            }
            match self.dispatch(job, now).await {
                Ok(()) => dispatched += 1,
                Err(e) => error!(error = %e, "Failed to dispatch cronjob"),
            }
        }
        dispatched
    }

    async fn dispatch(&self, job: Cronjob, now: DateTime<Utc>) -> Result<(), CronError> {
        let name = job.name.clone();
        let event = CronjobSchedulerEvent {
            cronjob: job,
            scheduled_at: now,
        };
        let payload = serde_json::to_vec(&event)?;
        self.stream
            .publish(SCHEDULE_SUBJECT.to_string(), payload.into())
            .await?;
        debug!(job = %name, "Dispatched cronjob");

        let result = self
            .registry
            .store()
            .compute_update(&name, true, |key, existing| {
                let mut job = existing.ok_or_else(|| CronError::NotFound(key.to_string()))?;
                job.state = CronjobState::Pending;
                job.next_schedule_time = Some(schedule::next_after(&job.schedule, now)?);
                Ok::<_, CronError>((job, true))
            })
            .await;
        match result {
            Ok(_) => Ok(()),
            // Unregistered while being dispatched.
            Err(CronError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn reschedule(&self, name: &str, now: DateTime<Utc>) {
        let result = self
            .registry
            .store()
            .compute_update(name, true, |key, existing| {
                let mut job = existing.ok_or_else(|| CronError::NotFound(key.to_string()))?;
                if job.next_schedule_time.is_some() {
                    return Ok((job, false));
                }
                job.next_schedule_time = Some(schedule::next_after(&job.schedule, now)?);
                if job.state == CronjobState::Unspecified {
                    job.state = CronjobState::Waiting;
                }
                Ok::<_, CronError>((job, true))
            })
            .await;
        if let Err(e) = result {
            warn!(job = %name, error = %e, "Failed to compute next schedule time");
        }
    }

    async fn handle_completion<M: StreamMessage>(&self, message: M) {
        let event: CronjobCompletedEvent = match serde_json::from_slice(message.payload()) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Undecodable completion event");
                if let Err(e) = message.nak(None).await {
                    warn!(error = %e, "Failed to nak completion event");
                }
                return;
            }
        };

        match self.record_completion(&event).await {
            Ok(()) | Err(CronError::NotFound(_)) => {
                if let Err(e) = message.ack().await {
                    warn!(job = %event.name, error = %e, "Failed to ack completion event");
                }
            }
            Err(e) => {
                warn!(job = %event.name, error = %e, "Failed to record completion");
                if let Err(e) = message.nak(Some(RETRY_DELAY)).await {
                    warn!(job = %event.name, error = %e, "Failed to nak completion event");
                }
            }
        }
    }

    /// Return the job to `WAITING`, stamp the attempt, advance its schedule
    /// and merge any data the handler returned.
    pub async fn record_completion(&self, event: &CronjobCompletedEvent) -> Result<(), CronError> {
        let now = self.clock.now();
        // Read from the bucket: the replica may not have seen an unregister yet.
        self.registry
            .store()
            .compute_update(&event.name, true, |key, existing| {
                let mut job = existing.ok_or_else(|| CronError::NotFound(key.to_string()))?;
                job.state = CronjobState::Waiting;
                job.last_attempt_time = Some(now);
                job.next_schedule_time = Some(schedule::next_after(&job.schedule, now)?);
                if let Some(data) = &event.data {
                    if data.updated_at >= job.data.updated_at {
                        job.data = data.clone();
                    }
                }
                job.last_completed_event = Some(event.clone());
                Ok::<_, CronError>((job, true))
            })
            .await?;

        if event.success {
            info!(job = %event.name, elapsed_ms = event.elapsed_ms, node = %event.node_name, "Cronjob completed");
        } else {
            warn!(
                job = %event.name,
                elapsed_ms = event.elapsed_ms,
                node = %event.node_name,
                error = event.error_message.as_deref().unwrap_or("unknown"),
                "Cronjob failed"
            );
        }
        Ok(())
    }
}
