use std::path::PathBuf;

use rpnet_std::env::ReadEnv;

const ENV_URL: &str = "NATS_URL";
const ENV_CREDS: &str = "NATS_CREDS";
const ENV_NKEY: &str = "NATS_NKEY";
const ENV_USER: &str = "NATS_USER";
const ENV_PASSWORD: &str = "NATS_PASSWORD";
const ENV_TOKEN: &str = "NATS_TOKEN";

const DEFAULT_URL: &str = "localhost:4222";

/// How the node authenticates against NATS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatsAuth {
    Credentials(PathBuf),
    NKey(String),
    UserPassword { user: String, password: String },
    Token(String),
    None,
}

impl NatsAuth {
    /// Loggable name of the method; never includes the secret itself.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Credentials(_) => "credentials",
            Self::NKey(_) => "nkey",
            Self::UserPassword { .. } => "user_password",
            Self::Token(_) => "token",
            Self::None => "none",
        }
    }

    /// First configured method wins: credentials file, nkey, user + password,
    /// token. A user without a password is ignored.
    fn from_env<E: ReadEnv>(env: &E) -> Self {
        let set = |key: &str| env.var(key).ok().filter(|v| !v.trim().is_empty());

        if let Some(path) = set(ENV_CREDS) {
            Self::Credentials(PathBuf::from(path))
        } else if let Some(seed) = set(ENV_NKEY) {
            Self::NKey(seed)
        } else if let (Some(user), Some(password)) = (set(ENV_USER), set(ENV_PASSWORD)) {
            Self::UserPassword { user, password }
        } else if let Some(token) = set(ENV_TOKEN) {
            Self::Token(token)
        } else {
            Self::None
        }
    }
}

#[derive(Debug, Clone)]
pub struct NatsConfig {
    pub servers: Vec<String>,
    pub auth: NatsAuth,
}

impl NatsConfig {
    pub fn new(servers: Vec<String>, auth: NatsAuth) -> Self {
        Self { servers, auth }
    }

    /// Reads `NATS_URL` (comma-separated) and the `NATS_*` auth variables.
    pub fn from_env<E: ReadEnv>(env: &E) -> Self {
        let raw = env.var(ENV_URL).unwrap_or_default();
        let mut servers: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if servers.is_empty() {
            servers.push(DEFAULT_URL.to_string());
        }

        Self {
            servers,
            auth: NatsAuth::from_env(env),
        }
    }
}
