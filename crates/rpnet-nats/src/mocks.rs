//! In-memory substrate for unit testing without a NATS server.
//!
//! Enabled with the `test-support` feature:
//!
//! ```toml
//! [dev-dependencies]
//! rpnet-nats = { path = "...", features = ["test-support"] }
//! ```
//!
//! [`MockKv`] mimics a JetStream KV bucket: a bucket-wide revision counter,
//! create/update/delete guarded by revisions, watches with history, and
//! per-bucket TTL. Expiry is evaluated lazily on every operation against
//! `tokio::time::Instant`, so tests may pause and advance tokio time; each
//! expired key is announced to watchers as a purge.
//!
//! [`MockStream`] mimics a JetStream stream with durable consumers:
//! consumers sharing a durable name compete for messages, naks redeliver
//! (after the requested delay) until `max_deliver` is reached and then the
//! message is dead-lettered.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::error::{KvError, StreamError};
use crate::kv::{KvBucket, KvEntry, KvOperation, KvWatch};
use crate::stream::{ConsumerConfig, JetStream, StreamMessage, StreamMessages};
use crate::subject_matches;

const WATCH_CAPACITY: usize = 4096;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── MockKv ────────────────────────────────────────────────────────────────────

struct StoredValue {
    entry: KvEntry,
    written: Instant,
}

#[derive(Default)]
struct KvState {
    revision: u64,
    values: BTreeMap<String, StoredValue>,
    /// Last revision of every key ever written, including removed keys.
    last_revisions: HashMap<String, u64>,
}

struct KvShared {
    bucket: String,
    max_age: Option<Duration>,
    state: Mutex<KvState>,
    events: broadcast::Sender<KvEntry>,
    writes: AtomicUsize,
}

/// In-memory [`KvBucket`].
///
/// Clones share the bucket and the partition flag; [`MockKv::handle`] gives
/// a new handle to the same bucket that can be partitioned on its own.
#[derive(Clone)]
pub struct MockKv {
    shared: Arc<KvShared>,
    partitioned: Arc<AtomicBool>,
}

impl MockKv {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self::build(bucket.into(), None)
    }

    /// A bucket whose values expire `max_age` after their last write.
    pub fn with_max_age(bucket: impl Into<String>, max_age: Duration) -> Self {
        Self::build(bucket.into(), Some(max_age))
    }

    fn build(bucket: String, max_age: Option<Duration>) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            shared: Arc::new(KvShared {
                bucket,
                max_age,
                state: Mutex::new(KvState::default()),
                events,
                writes: AtomicUsize::new(0),
            }),
            partitioned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Another handle on the same bucket with its own partition flag.
    pub fn handle(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            partitioned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// While partitioned, every write through this handle fails. Reads and
    /// watches keep working.
    pub fn set_partitioned(&self, partitioned: bool) {
        self.partitioned.store(partitioned, Ordering::SeqCst);
    }

    /// Successful writes (put, create, update, delete, purge) so far.
    pub fn write_count(&self) -> usize {
        self.shared.writes.load(Ordering::SeqCst)
    }

    /// Live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut state = lock(&self.shared.state);
        self.expire(&mut state);
        state.values.keys().cloned().collect()
    }

    /// Current live value of `key`, bypassing any partition.
    pub fn value(&self, key: &str) -> Option<Bytes> {
        let mut state = lock(&self.shared.state);
        self.expire(&mut state);
        state.values.get(key).map(|stored| stored.entry.value.clone())
    }

    fn check_partition(&self, key: &str) -> Result<(), KvError> {
        if self.partitioned.load(Ordering::SeqCst) {
            return Err(KvError::backend(key, "mock: partitioned"));
        }
        Ok(())
    }

    fn expire(&self, state: &mut KvState) {
        let Some(max_age) = self.shared.max_age else {
            return;
        };
        let now = Instant::now();
        let expired: Vec<String> = state
            .values
            .iter()
            .filter(|(_, stored)| now.duration_since(stored.written) >= max_age)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.remove(state, &key, KvOperation::Purge);
        }
    }

    fn write(&self, state: &mut KvState, key: &str, value: Bytes) -> u64 {
        state.revision += 1;
        let revision = state.revision;
        let entry = KvEntry {
            key: key.to_string(),
            value,
            revision,
            delta: 0,
            created: Utc::now(),
            operation: KvOperation::Put,
        };
        state.values.insert(
            key.to_string(),
            StoredValue {
                entry: entry.clone(),
                written: Instant::now(),
            },
        );
        state.last_revisions.insert(key.to_string(), revision);
        self.shared.writes.fetch_add(1, Ordering::SeqCst);
        let _ = self.shared.events.send(entry);
        revision
    }

    fn remove(&self, state: &mut KvState, key: &str, operation: KvOperation) {
        state.revision += 1;
        let revision = state.revision;
        state.values.remove(key);
        state.last_revisions.insert(key.to_string(), revision);
        self.shared.writes.fetch_add(1, Ordering::SeqCst);
        let _ = self.shared.events.send(KvEntry {
            key: key.to_string(),
            value: Bytes::new(),
            revision,
            delta: 0,
            created: Utc::now(),
            operation,
        });
    }
}

impl KvBucket for MockKv {
    fn bucket(&self) -> &str {
        &self.shared.bucket
    }

    async fn entry(&self, key: &str) -> Result<Option<KvEntry>, KvError> {
        let mut state = lock(&self.shared.state);
        self.expire(&mut state);
        Ok(state.values.get(key).map(|stored| stored.entry.clone()))
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<u64, KvError> {
        self.check_partition(key)?;
        let mut state = lock(&self.shared.state);
        self.expire(&mut state);
        Ok(self.write(&mut state, key, value))
    }

    async fn create(&self, key: &str, value: Bytes) -> Result<u64, KvError> {
        self.check_partition(key)?;
        let mut state = lock(&self.shared.state);
        self.expire(&mut state);
        if state.values.contains_key(key) {
            return Err(KvError::AlreadyExists(key.to_string()));
        }
        Ok(self.write(&mut state, key, value))
    }

    async fn update(&self, key: &str, value: Bytes, revision: u64) -> Result<u64, KvError> {
        self.check_partition(key)?;
        let mut state = lock(&self.shared.state);
        self.expire(&mut state);
        let current = state.values.get(key).map(|stored| stored.entry.revision);
        if current != Some(revision) {
            return Err(KvError::WrongRevision(key.to_string()));
        }
        Ok(self.write(&mut state, key, value))
    }

    async fn delete(&self, key: &str, revision: Option<u64>) -> Result<(), KvError> {
        self.check_partition(key)?;
        let mut state = lock(&self.shared.state);
        self.expire(&mut state);
        if let Some(expected) = revision {
            let last = state.last_revisions.get(key).copied().unwrap_or(0);
            if last != expected {
                return Err(KvError::WrongRevision(key.to_string()));
            }
        }
        self.remove(&mut state, key, KvOperation::Delete);
        Ok(())
    }

    async fn purge(&self, key: &str) -> Result<(), KvError> {
        self.check_partition(key)?;
        let mut state = lock(&self.shared.state);
        self.expire(&mut state);
        self.remove(&mut state, key, KvOperation::Purge);
        Ok(())
    }

    async fn watch(&self, pattern: &str, history: bool) -> Result<KvWatch, KvError> {
        let (receiver, snapshot) = {
            let mut state = lock(&self.shared.state);
            self.expire(&mut state);
            let receiver = self.shared.events.subscribe();
            let snapshot: Vec<KvEntry> = if history {
                state
                    .values
                    .values()
                    .filter(|stored| subject_matches(pattern, &stored.entry.key))
                    .map(|stored| stored.entry.clone())
                    .collect()
            } else {
                Vec::new()
            };
            (receiver, snapshot)
        };

        let total = snapshot.len() as u64;
        let replay = futures::stream::iter(snapshot.into_iter().enumerate().map(
            move |(index, mut entry)| {
                entry.delta = total - index as u64 - 1;
                Ok(entry)
            },
        ));

        let pattern = pattern.to_string();
        let live = futures::stream::unfold(receiver, move |mut receiver| {
            let pattern = pattern.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(entry) if subject_matches(&pattern, &entry.key) => {
                            return Some((Ok(entry), receiver));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            let err = KvError::Watch(format!("mock: lagged by {skipped} events"));
                            return Some((Err(err), receiver));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(replay.chain(live).boxed())
    }
}

// ── MockStream ────────────────────────────────────────────────────────────────

/// A message as it was published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub subject: String,
    pub payload: Bytes,
}

struct MockConsumer {
    filter: String,
    max_deliver: i64,
    sender: mpsc::UnboundedSender<MockMessage>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MockMessage>>>,
}

#[derive(Default)]
struct StreamState {
    published: Vec<PublishedMessage>,
    consumers: HashMap<String, MockConsumer>,
    dead_letters: Vec<PublishedMessage>,
    fail_publishes: u32,
}

#[derive(Default)]
struct StreamShared {
    state: Mutex<StreamState>,
    acks: AtomicUsize,
    naks: AtomicUsize,
}

/// In-memory [`JetStream`].
#[derive(Clone, Default)]
pub struct MockStream {
    shared: Arc<StreamShared>,
}

impl MockStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.shared.state).published.clone()
    }

    pub fn published_on(&self, subject: &str) -> Vec<PublishedMessage> {
        lock(&self.shared.state)
            .published
            .iter()
            .filter(|message| message.subject == subject)
            .cloned()
            .collect()
    }

    /// Messages dropped after exhausting `max_deliver`.
    pub fn dead_letters(&self) -> Vec<PublishedMessage> {
        lock(&self.shared.state).dead_letters.clone()
    }

    pub fn ack_count(&self) -> usize {
        self.shared.acks.load(Ordering::SeqCst)
    }

    pub fn nak_count(&self) -> usize {
        self.shared.naks.load(Ordering::SeqCst)
    }

    /// Fail the next `n` publishes.
    pub fn fail_publishes(&self, n: u32) {
        lock(&self.shared.state).fail_publishes = n;
    }
}

impl JetStream for MockStream {
    type Message = MockMessage;

    async fn publish(&self, subject: String, payload: Bytes) -> Result<(), StreamError> {
        let mut state = lock(&self.shared.state);
        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(StreamError::Publish {
                subject,
                reason: "mock: simulated publish failure".to_string(),
            });
        }

        let message = PublishedMessage { subject, payload };
        for (durable, consumer) in &state.consumers {
            if subject_matches(&consumer.filter, &message.subject) {
                let _ = consumer.sender.send(MockMessage::first_delivery(
                    &self.shared,
                    durable,
                    consumer,
                    &message,
                ));
            }
        }
        state.published.push(message);
        Ok(())
    }

    async fn consume(
        &self,
        config: ConsumerConfig,
    ) -> Result<StreamMessages<MockMessage>, StreamError> {
        let receiver = {
            let mut state = lock(&self.shared.state);
            if !state.consumers.contains_key(&config.durable) {
                let (sender, receiver) = mpsc::unbounded_channel();
                let consumer = MockConsumer {
                    filter: config.filter_subject.clone(),
                    max_deliver: config.max_deliver,
                    sender,
                    receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
                };
                // New durable consumers start from the beginning of the stream.
                for message in &state.published {
                    if subject_matches(&consumer.filter, &message.subject) {
                        let _ = consumer.sender.send(MockMessage::first_delivery(
                            &self.shared,
                            &config.durable,
                            &consumer,
                            message,
                        ));
                    }
                }
                state.consumers.insert(config.durable.clone(), consumer);
            }
            Arc::clone(&state.consumers[&config.durable].receiver)
        };

        Ok(futures::stream::unfold(receiver, |receiver| async move {
            let message = receiver.lock().await.recv().await?;
            Some((Ok(message), receiver))
        })
        .boxed())
    }
}

/// A delivery from a [`MockStream`] consumer.
pub struct MockMessage {
    subject: String,
    payload: Bytes,
    delivered: i64,
    max_deliver: i64,
    durable: String,
    shared: Arc<StreamShared>,
}

impl MockMessage {
    fn first_delivery(
        shared: &Arc<StreamShared>,
        durable: &str,
        consumer: &MockConsumer,
        message: &PublishedMessage,
    ) -> Self {
        Self {
            subject: message.subject.clone(),
            payload: message.payload.clone(),
            delivered: 1,
            max_deliver: consumer.max_deliver,
            durable: durable.to_string(),
            shared: Arc::clone(shared),
        }
    }

    fn redelivery(&self) -> Self {
        Self {
            subject: self.subject.clone(),
            payload: self.payload.clone(),
            delivered: self.delivered + 1,
            max_deliver: self.max_deliver,
            durable: self.durable.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl StreamMessage for MockMessage {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn delivered(&self) -> i64 {
        self.delivered
    }

    async fn ack(&self) -> Result<(), StreamError> {
        self.shared.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), StreamError> {
        self.shared.naks.fetch_add(1, Ordering::SeqCst);

        let mut state = lock(&self.shared.state);
        if self.max_deliver > 0 && self.delivered >= self.max_deliver {
            state.dead_letters.push(PublishedMessage {
                subject: self.subject.clone(),
                payload: self.payload.clone(),
            });
            return Ok(());
        }
        let Some(consumer) = state.consumers.get(&self.durable) else {
            return Ok(());
        };

        let sender = consumer.sender.clone();
        let next = self.redelivery();
        match delay {
            Some(delay) if !delay.is_zero() => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = sender.send(next);
                });
            }
            _ => {
                let _ = sender.send(next);
            }
        }
        Ok(())
    }

    async fn in_progress(&self) -> Result<(), StreamError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── MockKv ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn create_fails_when_key_is_live() {
        let kv = MockKv::new("test");
        kv.create("LOCK.a", Bytes::from_static(b"1")).await.unwrap();
        let err = kv.create("LOCK.a", Bytes::from_static(b"2")).await.unwrap_err();
        assert!(matches!(err, KvError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn create_succeeds_after_delete() {
        let kv = MockKv::new("test");
        kv.create("a", Bytes::from_static(b"1")).await.unwrap();
        kv.delete("a", None).await.unwrap();
        assert!(kv.entry("a").await.unwrap().is_none());
        kv.create("a", Bytes::from_static(b"2")).await.unwrap();
    }

    #[tokio::test]
    async fn update_requires_current_revision() {
        let kv = MockKv::new("test");
        let rev = kv.put("a", Bytes::from_static(b"1")).await.unwrap();
        let next = kv.update("a", Bytes::from_static(b"2"), rev).await.unwrap();
        assert!(next > rev);
        let err = kv.update("a", Bytes::from_static(b"3"), rev).await.unwrap_err();
        assert!(matches!(err, KvError::WrongRevision(_)));
    }

    #[tokio::test]
    async fn guarded_delete_rejects_stale_revision() {
        let kv = MockKv::new("test");
        let first = kv.put("a", Bytes::from_static(b"1")).await.unwrap();
        kv.put("a", Bytes::from_static(b"2")).await.unwrap();
        let err = kv.delete("a", Some(first)).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(kv.value("a"), Some(Bytes::from_static(b"2")));
    }

    #[tokio::test]
    async fn partitioned_handle_cannot_write_but_others_can() {
        let kv = MockKv::new("test");
        let isolated = kv.handle();
        isolated.set_partitioned(true);
        assert!(isolated.put("a", Bytes::from_static(b"1")).await.is_err());
        kv.put("a", Bytes::from_static(b"1")).await.unwrap();
        assert!(isolated.entry("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn watch_with_history_replays_then_streams() {
        let kv = MockKv::new("test");
        kv.put("jobs.a", Bytes::from_static(b"a")).await.unwrap();
        kv.put("jobs.b", Bytes::from_static(b"b")).await.unwrap();
        kv.put("other", Bytes::from_static(b"x")).await.unwrap();

        let mut watch = kv.watch("jobs.>", true).await.unwrap();
        let first = watch.next().await.unwrap().unwrap();
        let second = watch.next().await.unwrap().unwrap();
        assert_eq!((first.key.as_str(), first.delta), ("jobs.a", 1));
        assert_eq!((second.key.as_str(), second.delta), ("jobs.b", 0));

        kv.put("other", Bytes::from_static(b"y")).await.unwrap();
        kv.delete("jobs.a", None).await.unwrap();
        let live = watch.next().await.unwrap().unwrap();
        assert_eq!(live.key, "jobs.a");
        assert_eq!(live.operation, KvOperation::Delete);
    }

    #[tokio::test(start_paused = true)]
    async fn values_expire_after_max_age_and_watchers_see_a_purge() {
        let kv = MockKv::with_max_age("leader", Duration::from_secs(3));
        let mut watch = kv.watch("scheduler", false).await.unwrap();
        kv.create("scheduler", Bytes::from_static(b"node-a")).await.unwrap();
        assert_eq!(watch.next().await.unwrap().unwrap().operation, KvOperation::Put);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(kv.entry("scheduler").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(kv.entry("scheduler").await.unwrap().is_none());
        assert_eq!(watch.next().await.unwrap().unwrap().operation, KvOperation::Purge);
    }

    #[tokio::test(start_paused = true)]
    async fn update_renews_ttl() {
        let kv = MockKv::with_max_age("leader", Duration::from_secs(3));
        let mut rev = kv.create("k", Bytes::from_static(b"v")).await.unwrap();
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(2)).await;
            rev = kv.update("k", Bytes::from_static(b"v"), rev).await.unwrap();
        }
        assert!(kv.entry("k").await.unwrap().is_some());
    }

    // ── MockStream ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn consumer_receives_only_filtered_subjects() {
        let stream = MockStream::new();
        let mut messages = stream
            .consume(ConsumerConfig::new("exec", "cron.schedule"))
            .await
            .unwrap();
        stream.publish("cron.complete".into(), Bytes::from_static(b"c")).await.unwrap();
        stream.publish("cron.schedule".into(), Bytes::from_static(b"s")).await.unwrap();

        let message = messages.next().await.unwrap().unwrap();
        assert_eq!(message.subject(), "cron.schedule");
        assert_eq!(message.payload(), b"s");
        assert_eq!(message.delivered(), 1);
        assert_eq!(stream.published().len(), 2);
    }

    #[tokio::test]
    async fn new_consumer_replays_earlier_messages() {
        let stream = MockStream::new();
        stream.publish("cron.schedule".into(), Bytes::from_static(b"early")).await.unwrap();
        let mut messages = stream
            .consume(ConsumerConfig::new("exec", "cron.schedule"))
            .await
            .unwrap();
        assert_eq!(messages.next().await.unwrap().unwrap().payload(), b"early");
    }

    #[tokio::test]
    async fn nak_redelivers_until_max_deliver_then_dead_letters() {
        let stream = MockStream::new();
        let mut messages = stream
            .consume(ConsumerConfig::new("exec", "cron.schedule").max_deliver(3))
            .await
            .unwrap();
        stream.publish("cron.schedule".into(), Bytes::from_static(b"x")).await.unwrap();

        for expected in 1..=3 {
            let message = messages.next().await.unwrap().unwrap();
            assert_eq!(message.delivered(), expected);
            message.nak(None).await.unwrap();
        }
        assert_eq!(stream.nak_count(), 3);
        assert_eq!(stream.dead_letters().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn nak_with_delay_waits_before_redelivery() {
        let stream = MockStream::new();
        let mut messages = stream
            .consume(ConsumerConfig::new("exec", "cron.schedule"))
            .await
            .unwrap();
        stream.publish("cron.schedule".into(), Bytes::from_static(b"x")).await.unwrap();

        let first = messages.next().await.unwrap().unwrap();
        let naked_at = Instant::now();
        first.nak(Some(Duration::from_secs(5))).await.unwrap();
        let second = messages.next().await.unwrap().unwrap();
        assert_eq!(second.delivered(), 2);
        assert!(naked_at.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn shared_durable_delivers_each_message_once() {
        let stream = MockStream::new();
        let config = ConsumerConfig::new("exec", "cron.schedule");
        let mut a = stream.consume(config.clone()).await.unwrap();
        let mut b = stream.consume(config).await.unwrap();
        stream.publish("cron.schedule".into(), Bytes::from_static(b"1")).await.unwrap();
        stream.publish("cron.schedule".into(), Bytes::from_static(b"2")).await.unwrap();

        let first = a.next().await.unwrap().unwrap();
        let second = b.next().await.unwrap().unwrap();
        let mut payloads = vec![first.payload().to_vec(), second.payload().to_vec()];
        payloads.sort();
        assert_eq!(payloads, vec![b"1".to_vec(), b"2".to_vec()]);
    }

    #[tokio::test]
    async fn failed_publish_is_not_recorded() {
        let stream = MockStream::new();
        stream.fail_publishes(1);
        assert!(stream.publish("cron.schedule".into(), Bytes::new()).await.is_err());
        assert!(stream.published().is_empty());
        stream.publish("cron.schedule".into(), Bytes::new()).await.unwrap();
        assert_eq!(stream.published_on("cron.schedule").len(), 1);
    }
}
