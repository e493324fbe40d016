use std::time::Duration;

use rpnet_nats::NatsConfig;
use rpnet_std::env::ReadEnv;
use rpnet_sync::ElectionConfig;
use tracing::warn;

use crate::kv::LEADER_KEY;

const ENV_NODE_NAME: &str = "CRON_NODE_NAME";
const ENV_LEADER_TTL: &str = "CRON_LEADER_TTL_SEC";
const ENV_LEADER_HEARTBEAT: &str = "CRON_LEADER_HEARTBEAT_SEC";
const ENV_MAX_LOCK_AGE: &str = "CRON_MAX_LOCK_AGE_SEC";

const DEFAULT_LEADER_TTL: Duration = Duration::from_secs(15);
const DEFAULT_LEADER_HEARTBEAT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_LOCK_AGE: Duration = Duration::from_secs(30);

/// Runtime settings for a cron node, read from the environment.
#[derive(Debug, Clone)]
pub struct CronSettings {
    pub nats: NatsConfig,
    /// Reported in completion events. A random UUID when unset.
    pub node_name: String,
    pub leader_ttl: Duration,
    pub leader_heartbeat: Duration,
    pub max_lock_age: Duration,
}

impl CronSettings {
    /// Unparseable or zero durations fall back to their defaults with a
    /// warning; a heartbeat that is not shorter than the ttl is cut to a
    /// third of it.
    pub fn from_env<E: ReadEnv>(env: &E) -> Self {
        let node_name = env
            .var(ENV_NODE_NAME)
            .ok()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let leader_ttl = seconds(env, ENV_LEADER_TTL, DEFAULT_LEADER_TTL);
        let mut leader_heartbeat = seconds(env, ENV_LEADER_HEARTBEAT, DEFAULT_LEADER_HEARTBEAT);
        if leader_heartbeat >= leader_ttl {
            let adjusted = leader_ttl / 3;
            warn!(
                heartbeat_secs = leader_heartbeat.as_secs(),
                ttl_secs = leader_ttl.as_secs(),
                adjusted_ms = adjusted.as_millis() as u64,
                "Leader heartbeat must be shorter than the ttl, adjusting"
            );
            leader_heartbeat = adjusted;
        }

        Self {
            nats: NatsConfig::from_env(env),
            node_name,
            leader_ttl,
            leader_heartbeat,
            max_lock_age: seconds(env, ENV_MAX_LOCK_AGE, DEFAULT_MAX_LOCK_AGE),
        }
    }

    /// Election for the single scheduler.
    pub fn election(&self) -> ElectionConfig {
        ElectionConfig::new(LEADER_KEY, self.leader_ttl, self.leader_heartbeat)
    }
}

fn seconds<E: ReadEnv>(env: &E, key: &str, default: Duration) -> Duration {
    match env.parsed::<u64>(key) {
        None => default,
        Some(Ok(0)) => {
            warn!(var = key, default_secs = default.as_secs(), "Zero is not allowed, using default");
            default
        }
        Some(Ok(secs)) => Duration::from_secs(secs),
        Some(Err(raw)) => {
            warn!(var = key, value = %raw, default_secs = default.as_secs(), "Invalid value, using default");
            default
        }
    }
}
