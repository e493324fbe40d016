use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use rpnet_nats::kv::BucketConfig;
use rpnet_nats::{KvBucket, KvEntry, KvError, KvWatch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ElectionError;

type StartedFn = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;
type StoppedFn = Arc<dyn Fn() + Send + Sync>;

/// Election parameters.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Key of the leadership record inside the election bucket.
    pub key: String,
    /// Lifetime of an unrenewed leadership record. The bucket must be
    /// provisioned with this max age (see [`ElectionConfig::bucket_config`]).
    pub ttl: Duration,
    /// Heartbeat period of the leader and campaign period of followers.
    pub heartbeat_interval: Duration,
}

impl ElectionConfig {
    pub fn new(key: impl Into<String>, ttl: Duration, heartbeat_interval: Duration) -> Self {
        Self {
            key: key.into(),
            ttl,
            heartbeat_interval,
        }
    }

    pub fn validate(&self) -> Result<(), ElectionError> {
        if self.key.is_empty() {
            return Err(ElectionError::InvalidConfig("election key is empty".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ElectionError::InvalidConfig(
                "heartbeat interval must be non-zero".into(),
            ));
        }
        if self.heartbeat_interval >= self.ttl {
            return Err(ElectionError::InvalidConfig(format!(
                "heartbeat interval {:?} must be shorter than ttl {:?}",
                self.heartbeat_interval, self.ttl
            )));
        }
        Ok(())
    }

    /// Settings for a bucket that expires leadership records after `ttl`
    /// and keeps the expiry marker for twice that, so followers see it.
    pub fn bucket_config(&self, bucket: impl Into<String>) -> BucketConfig {
        BucketConfig::new(bucket)
            .max_age(self.ttl)
            .marker_ttl(self.ttl * 2)
            .description("leader election")
    }
}

/// Single-winner election over one key of a TTL'd KV bucket.
///
/// Leadership is acquired with an atomic create of the record and kept by
/// renewing it every heartbeat. It changes hands only when the record
/// disappears: TTL expiry, or the leader releasing it on stop. Followers
/// react to the removal on the watch and also retry on every heartbeat
/// period, so substrates that expire keys silently still fail over.
///
/// On winning, `on_started` is spawned with a token that is cancelled when
/// leadership ends; `on_stopped` runs after that.
pub struct LeaderElector<K: KvBucket> {
    inner: Arc<Inner<K>>,
}

struct Inner<K> {
    kv: K,
    config: ElectionConfig,
    instance_id: String,
    parent: CancellationToken,
    on_started: StartedFn,
    on_stopped: StoppedFn,
    leader: AtomicBool,
    session: Mutex<Session>,
}

#[derive(Default)]
struct Session {
    token: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

/// One held leadership.
struct Term {
    revision: u64,
    token: CancellationToken,
    renewed_at: Instant,
}

impl<K: KvBucket> LeaderElector<K> {
    pub fn new<S, Fut, T>(
        kv: K,
        config: ElectionConfig,
        parent: CancellationToken,
        on_started: S,
        on_stopped: T,
    ) -> Result<Self, ElectionError>
    where
        S: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        T: Fn() + Send + Sync + 'static,
    {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                kv,
                config,
                instance_id: Uuid::new_v4().to_string(),
                parent,
                on_started: Arc::new(move |token| on_started(token).boxed()),
                on_stopped: Arc::new(on_stopped),
                leader: AtomicBool::new(false),
                session: Mutex::new(Session::default()),
            }),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn is_leader(&self) -> bool {
        self.inner.leader.load(Ordering::SeqCst)
    }

    /// Join the election. Returns immediately; calling it while already
    /// running does nothing.
    pub fn start(&self) {
        let mut session = self.inner.session();
        if session.task.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let token = self.inner.parent.child_token();
        session.token = Some(token.clone());
        session.task = Some(tokio::spawn(Arc::clone(&self.inner).campaign(token)));
    }

    /// Leave the election, releasing leadership if held. Once this returns
    /// `on_stopped` has run. The elector can be started again.
    pub async fn stop(&self) {
        let (token, task) = {
            let mut session = self.inner.session();
            (session.token.take(), session.task.take())
        };
        if let Some(token) = token {
            token.cancel();
        }
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(key = %self.inner.config.key, error = %e, "Election task failed");
            }
        }
    }
}

impl<K: KvBucket> Inner<K> {
    fn session(&self) -> std::sync::MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn campaign(self: Arc<Self>, session: CancellationToken) {
        let period = self.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut watch = self.open_watch().await;
        let mut term = self.try_acquire(&session).await;

        loop {
            tokio::select! {
                _ = session.cancelled() => break,

                event = next_event(&mut watch) => match event {
                    // Removals older than the held term refer to a previous record.
                    Some(Ok(entry)) if entry.is_removal()
                        && term.as_ref().is_none_or(|held| entry.revision > held.revision) =>
                    {
                        debug!(key = %self.config.key, revision = entry.revision, "Leadership record removed");
                        if let Some(held) = term.take() {
                            self.step_down(held).await;
                        }
                        term = self.try_acquire(&session).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => warn!(key = %self.config.key, error = %e, "Election watch error"),
                    None => {
                        warn!(key = %self.config.key, "Election watch ended, reopening on next tick");
                        watch = None;
                    }
                },

                _ = ticker.tick() => {
                    if watch.is_none() {
                        watch = self.open_watch().await;
                    }
                    term = match term.take() {
                        Some(held) => self.heartbeat(held).await,
                        None => self.try_acquire(&session).await,
                    };
                }
            }
        }

        if let Some(held) = term.take() {
            self.step_down(held).await;
        }
    }

    async fn open_watch(&self) -> Option<KvWatch> {
        match self.kv.watch(&self.config.key, false).await {
            Ok(watch) => Some(watch),
            Err(e) => {
                warn!(key = %self.config.key, error = %e, "Failed to watch election key");
                None
            }
        }
    }

    async fn try_acquire(&self, session: &CancellationToken) -> Option<Term> {
        let value = Bytes::from(self.instance_id.clone());
        match self.kv.create(&self.config.key, value).await {
            Ok(revision) => {
                let token = session.child_token();
                self.leader.store(true, Ordering::SeqCst);
                info!(
                    key = %self.config.key,
                    instance_id = %self.instance_id,
                    "Became leader"
                );
                tokio::spawn((self.on_started)(token.clone()));
                Some(Term {
                    revision,
                    token,
                    renewed_at: Instant::now(),
                })
            }
            // Someone else holds the record; this is the normal follower path.
            Err(e) if e.is_conflict() => None,
            Err(e) => {
                warn!(key = %self.config.key, error = %e, "Leadership acquisition failed");
                None
            }
        }
    }

    async fn heartbeat(&self, mut term: Term) -> Option<Term> {
        let value = Bytes::from(self.instance_id.clone());
        match self.kv.update(&self.config.key, value, term.revision).await {
            Ok(revision) => {
                term.revision = revision;
                term.renewed_at = Instant::now();
                Some(term)
            }
            Err(KvError::WrongRevision(_)) => {
                warn!(key = %self.config.key, "Leadership record taken over");
                self.step_down(term).await;
                None
            }
            Err(e) => {
                // The record expires before the next tick could renew it.
                if term.renewed_at.elapsed() + self.config.heartbeat_interval >= self.config.ttl {
                    warn!(key = %self.config.key, error = %e, "Heartbeat failing past ttl");
                    self.step_down(term).await;
                    return None;
                }
                warn!(key = %self.config.key, error = %e, "Heartbeat failed");
                Some(term)
            }
        }
    }

    async fn step_down(&self, term: Term) {
        term.token.cancel();
        self.leader.store(false, Ordering::SeqCst);

        match self.kv.delete(&self.config.key, Some(term.revision)).await {
            Ok(()) => debug!(key = %self.config.key, "Leadership record released"),
            Err(e) if e.is_conflict() => {}
            Err(e) => warn!(key = %self.config.key, error = %e, "Failed to release leadership record"),
        }

        (self.on_stopped)();
        info!(key = %self.config.key, instance_id = %self.instance_id, "Stepped down");
    }
}

async fn next_event(watch: &mut Option<KvWatch>) -> Option<Result<KvEntry, KvError>> {
    match watch {
        Some(watch) => watch.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpnet_nats::MockKv;
    use std::sync::atomic::AtomicUsize;

    fn config() -> ElectionConfig {
        ElectionConfig::new("scheduler", Duration::from_secs(3), Duration::from_secs(1))
    }

    fn elector(kv: &MockKv) -> LeaderElector<MockKv> {
        LeaderElector::new(kv.handle(), config(), CancellationToken::new(), |_| async {}, || {})
            .unwrap()
    }

    #[test]
    fn heartbeat_must_be_shorter_than_ttl() {
        let equal = ElectionConfig::new("k", Duration::from_secs(5), Duration::from_secs(5));
        assert!(matches!(equal.validate(), Err(ElectionError::InvalidConfig(_))));
        let zero = ElectionConfig::new("k", Duration::from_secs(5), Duration::ZERO);
        assert!(zero.validate().is_err());
        let unnamed = ElectionConfig::new("", Duration::from_secs(5), Duration::from_secs(1));
        assert!(unnamed.validate().is_err());
        assert!(config().validate().is_ok());
    }

    #[test]
    fn bucket_config_expires_after_ttl() {
        let bucket = config().bucket_config("cron_leader");
        assert_eq!(bucket.name, "cron_leader");
        assert_eq!(bucket.max_age, Some(Duration::from_secs(3)));
        assert_eq!(bucket.marker_ttl, Some(Duration::from_secs(6)));
    }

    #[tokio::test(start_paused = true)]
    async fn lone_instance_becomes_leader_and_runs_callbacks() {
        let kv = MockKv::with_max_age("cron_leader", Duration::from_secs(3));
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicBool::new(false));

        let elector = {
            let started = Arc::clone(&started);
            let stopped = Arc::clone(&stopped);
            let cancelled = Arc::clone(&cancelled);
            LeaderElector::new(
                kv.clone(),
                config(),
                CancellationToken::new(),
                move |token: CancellationToken| {
                    started.fetch_add(1, Ordering::SeqCst);
                    let cancelled = Arc::clone(&cancelled);
                    async move {
                        token.cancelled().await;
                        cancelled.store(true, Ordering::SeqCst);
                    }
                },
                move || {
                    stopped.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap()
        };

        elector.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(elector.is_leader());
        assert_eq!(started.load(Ordering::SeqCst), 1);

        // Heartbeats keep the record alive well past the ttl.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(elector.is_leader());
        assert_eq!(kv.value("scheduler"), Some(Bytes::from(elector.instance_id().to_string())));

        elector.stop().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!elector.is_leader());
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert!(cancelled.load(Ordering::SeqCst));
        assert!(kv.value("scheduler").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let kv = MockKv::with_max_age("cron_leader", Duration::from_secs(3));
        let elector = elector(&kv);
        elector.start();
        elector.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(elector.is_leader());
        elector.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_elector_can_start_again() {
        let kv = MockKv::with_max_age("cron_leader", Duration::from_secs(3));
        let elector = elector(&kv);
        elector.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        elector.stop().await;
        assert!(!elector.is_leader());

        elector.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(elector.is_leader());
        elector.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_the_parent_ends_leadership() {
        let kv = MockKv::with_max_age("cron_leader", Duration::from_secs(3));
        let parent = CancellationToken::new();
        let elector =
            LeaderElector::new(kv.clone(), config(), parent.clone(), |_| async {}, || {}).unwrap();
        elector.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(elector.is_leader());

        parent.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!elector.is_leader());
        assert!(kv.value("scheduler").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_record_keeps_instance_a_follower() {
        let kv = MockKv::with_max_age("cron_leader", Duration::from_secs(3));
        kv.create("scheduler", Bytes::from_static(b"someone-else")).await.unwrap();

        let elector = elector(&kv);
        elector.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!elector.is_leader());

        // The foreign record is never renewed and expires.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(elector.is_leader());
        elector.stop().await;
    }
}
