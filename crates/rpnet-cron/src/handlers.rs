use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::CronjobData;

/// What a handler returns: optionally a new data payload for the job.
pub type HandlerResult = anyhow::Result<Option<serde_json::Value>>;

pub type HandlerFn = Arc<dyn Fn(JobContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Passed to a handler for one run.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub name: String,
    /// Cancelled when the run deadline passes or the node shuts down.
    /// Handlers are expected to watch it; nothing forces them to stop.
    pub cancel: CancellationToken,
    pub data: CronjobData,
    pub scheduled_at: DateTime<Utc>,
}

/// Cronjob name → handler.
///
/// Names are sanitized on the way in and on lookup, so `Node Heartbeat`
/// and `node_heartbeat` are the same handler.
#[derive(Clone, Default)]
pub struct Handlers {
    inner: Arc<Mutex<HashMap<String, HandlerFn>>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous one.
    pub fn add<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let name = sanitize_name(name);
        let handler: HandlerFn = Arc::new(move |ctx| handler(ctx).boxed());
        if self.handlers().insert(name.clone(), handler).is_some() {
            warn!(handler = %name, "Handler registered twice, replacing the previous one");
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        self.handlers().remove(&sanitize_name(name)).is_some()
    }

    pub fn get(&self, name: &str) -> Option<HandlerFn> {
        self.handlers().get(&sanitize_name(name)).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers().contains_key(&sanitize_name(name))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers().keys().cloned().collect();
        names.sort();
        names
    }

    fn handlers(&self) -> MutexGuard<'_, HashMap<String, HandlerFn>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lowercase `name` and replace everything outside `[a-z0-9_-]` with `_`.
pub fn sanitize_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}
