//! Persisted layout of the cron subsystem and its provisioning.

use std::time::Duration;

use async_nats::jetstream;
use rpnet_nats::kv::{BucketConfig, get_or_create_bucket};
use rpnet_nats::stream::{StreamConfig, get_or_create_stream};
use rpnet_nats::{NatsKv, NatsStream};
use rpnet_sync::ElectionConfig;

use crate::error::CronError;

pub const CRONJOBS_BUCKET: &str = "cronjobs";
pub const CRONJOBS_LOCKS_BUCKET: &str = "cronjobs_locks";
pub const LEADER_BUCKET: &str = "cron_leader";
pub const LEADER_KEY: &str = "scheduler";

pub const STREAM: &str = "CRON";
const STREAM_SUBJECTS: &str = "cron.>";
/// Undelivered events older than this are dropped.
const STREAM_MAX_AGE: Duration = Duration::from_secs(3600);

pub const SCHEDULE_SUBJECT: &str = "cron.schedule";
pub const COMPLETE_SUBJECT: &str = "cron.complete";

pub const EXECUTOR_CONSUMER: &str = "cron_executor";
pub const SCHEDULER_CONSUMER: &str = "cron_scheduler";

/// Handles on everything the cron subsystem persists.
#[derive(Clone)]
pub struct CronBackend {
    pub jobs: NatsKv,
    pub locks: NatsKv,
    pub leader: NatsKv,
    pub stream: NatsStream,
}

/// Create the buckets and the stream, or bind to them if another node did.
pub async fn provision(
    js: &jetstream::Context,
    election: &ElectionConfig,
) -> Result<CronBackend, CronError> {
    let jobs = get_or_create_bucket(
        js,
        BucketConfig::new(CRONJOBS_BUCKET)
            .history(5)
            .description("cronjob definitions and state"),
    )
    .await?;
    let locks = get_or_create_bucket(
        js,
        BucketConfig::new(CRONJOBS_LOCKS_BUCKET).description("cronjob write locks"),
    )
    .await?;
    let leader = get_or_create_bucket(js, election.bucket_config(LEADER_BUCKET)).await?;
    let stream = get_or_create_stream(
        js,
        StreamConfig {
            name: STREAM.to_string(),
            subjects: vec![STREAM_SUBJECTS.to_string()],
            max_age: STREAM_MAX_AGE,
        },
    )
    .await?;

    tracing::info!(
        jobs = CRONJOBS_BUCKET,
        locks = CRONJOBS_LOCKS_BUCKET,
        leader = LEADER_BUCKET,
        stream = STREAM,
        "Cron buckets and stream ready"
    );

    Ok(CronBackend {
        jobs,
        locks,
        leader,
        stream,
    })
}
