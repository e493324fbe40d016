use std::time::Duration;

use async_nats::{Client, ConnectOptions, Event};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::auth::{NatsAuth, NatsConfig};

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to load NATS credentials file: {0}")]
    Credentials(#[source] std::io::Error),

    #[error("failed to connect to NATS servers {servers:?}: {source}")]
    Connect {
        servers: Vec<String>,
        #[source]
        source: async_nats::ConnectError,
    },
}

/// Exponential backoff starting at one second, capped at
/// [`MAX_RECONNECT_DELAY`].
fn reconnect_delay(attempts: usize) -> Duration {
    let exponent = u32::try_from(attempts).unwrap_or(u32::MAX);
    let secs = 2u64
        .checked_pow(exponent)
        .unwrap_or(u64::MAX)
        .min(MAX_RECONNECT_DELAY.as_secs());
    Duration::from_secs(secs)
}

fn log_event(event: &Event) {
    match event {
        Event::Connected => info!("NATS connected"),
        Event::Disconnected => warn!("NATS disconnected, reconnecting"),
        Event::Closed => info!("NATS connection closed"),
        Event::Draining => info!("NATS connection draining"),
        Event::LameDuckMode => warn!("NATS server entering lame duck mode"),
        Event::SlowConsumer(sid) => warn!(sid, "NATS slow consumer"),
        Event::ServerError(err) => warn!(error = %err, "NATS server error"),
        Event::ClientError(err) => warn!(error = %err, "NATS client error"),
    }
}

async fn options_for(auth: &NatsAuth) -> Result<ConnectOptions, ConnectError> {
    let options = match auth {
        NatsAuth::Credentials(path) => ConnectOptions::with_credentials_file(path.clone())
            .await
            .map_err(ConnectError::Credentials)?,
        NatsAuth::NKey(seed) => ConnectOptions::with_nkey(seed.clone()),
        NatsAuth::UserPassword { user, password } => {
            ConnectOptions::with_user_and_password(user.clone(), password.clone())
        }
        NatsAuth::Token(token) => ConnectOptions::with_token(token.clone()),
        NatsAuth::None => ConnectOptions::new(),
    };

    Ok(options
        .retry_on_initial_connect()
        .connection_timeout(CONNECTION_TIMEOUT)
        .reconnect_delay_callback(reconnect_delay)
        .event_callback(|event| async move { log_event(&event) }))
}

/// Connect with automatic reconnection and lifecycle logging.
#[instrument(name = "nats.connect", skip(config), fields(servers = ?config.servers, auth = config.auth.kind()))]
pub async fn connect(config: &NatsConfig) -> Result<Client, ConnectError> {
    let options = options_for(&config.auth).await?;

    match options.connect(&config.servers).await {
        Ok(client) => {
            info!("Connected to NATS");
            Ok(client)
        }
        Err(source) => {
            warn!(error = %source, "Failed to connect to NATS");
            Err(ConnectError::Connect {
                servers: config.servers.clone(),
                source,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_doubles_from_one_second() {
        let delays: Vec<u64> = (0..5).map(|n| reconnect_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn reconnect_delay_is_capped() {
        assert_eq!(reconnect_delay(5), MAX_RECONNECT_DELAY);
        assert_eq!(reconnect_delay(64), MAX_RECONNECT_DELAY);
        assert_eq!(reconnect_delay(usize::MAX), MAX_RECONNECT_DELAY);
    }

    #[test]
    fn every_event_is_logged_without_panicking() {
        use async_nats::{ClientError, ServerError};

        for event in [
            Event::Connected,
            Event::Disconnected,
            Event::Closed,
            Event::Draining,
            Event::LameDuckMode,
            Event::SlowConsumer(7),
            Event::ServerError(ServerError::Other("boom".to_string())),
            Event::ClientError(ClientError::Other("boom".to_string())),
        ] {
            log_event(&event);
        }
    }

    #[tokio::test]
    async fn missing_credentials_file_is_reported() {
        let auth = NatsAuth::Credentials("/nonexistent/rpnet.creds".into());
        let err = options_for(&auth).await.err().expect("should fail");
        assert!(matches!(err, ConnectError::Credentials(_)));
    }
}
