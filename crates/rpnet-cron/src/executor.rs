use std::any::Any;
use std::time::Duration;

use futures::StreamExt;
use rpnet_nats::{ConsumerConfig, JetStream, StreamMessage};
use rpnet_std::time::Clock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{CronjobCompletedEvent, CronjobData, CronjobSchedulerEvent};
use crate::error::CronError;
use crate::handlers::{Handlers, JobContext};
use crate::kv::{COMPLETE_SUBJECT, EXECUTOR_CONSUMER, SCHEDULE_SUBJECT};

/// Deliveries of one scheduled event before the stream drops it.
const MAX_DELIVER: i64 = 3;
/// Redelivery delay for events this node cannot run.
const NAK_DELAY: Duration = Duration::from_secs(5);

/// Runs scheduled jobs on every node.
///
/// Events are acked as soon as a handler is found, before it runs, so a job
/// runs at most once per dispatch even if the node dies mid-run.
pub struct Executor<S: JetStream, C: Clock> {
    stream: S,
    handlers: Handlers,
    clock: C,
    node_name: String,
}

impl<S: JetStream, C: Clock> Clone for Executor<S, C> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
            handlers: self.handlers.clone(),
            clock: self.clock.clone(),
            node_name: self.node_name.clone(),
        }
    }
}

impl<S: JetStream, C: Clock> Executor<S, C> {
    pub fn new(stream: S, handlers: Handlers, clock: C, node_name: impl Into<String>) -> Self {
        Self {
            stream,
            handlers,
            clock,
            node_name: node_name.into(),
        }
    }

    /// Consume scheduled events until `cancel` fires, running each on its
    /// own task. Runs still in flight get their token cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), CronError> {
        let mut messages = self
            .stream
            .consume(ConsumerConfig::new(EXECUTOR_CONSUMER, SCHEDULE_SUBJECT).max_deliver(MAX_DELIVER))
            .await?;

        info!(node = %self.node_name, "Cron executor running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = messages.next() => match message {
                    Some(Ok(message)) => {
                        let executor = self.clone();
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            executor.handle(message, cancel).await;
                        });
                    }
                    Some(Err(e)) => warn!(error = %e, "Schedule consumer error"),
                    None => {
                        warn!("Schedule consumer ended");
                        break;
                    }
                },
            }
        }
        info!(node = %self.node_name, "Cron executor stopped");
        Ok(())
    }

    /// Run one scheduled event and publish its completion. Returns the
    /// completion, or `None` when the event was handed back to the stream.
    pub async fn handle<M: StreamMessage>(
        &self,
        message: M,
        cancel: CancellationToken,
    ) -> Option<CronjobCompletedEvent> {
        let event: CronjobSchedulerEvent = match serde_json::from_slice(message.payload()) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, delivered = message.delivered(), "Undecodable schedule event");
                nak(&message).await;
                return None;
            }
        };
        let name = event.cronjob.name.clone();

        let Some(handler) = self.handlers.get(&name) else {
            warn!(job = %name, delivered = message.delivered(), "No handler registered for cronjob");
            nak(&message).await;
            return None;
        };

        if let Err(e) = message.ack().await {
            warn!(job = %name, error = %e, "Failed to ack schedule event");
        }

        let timeout = event.cronjob.timeout();
        let deadline = cancel.child_token();
        let ctx = JobContext {
            name: name.clone(),
            cancel: deadline.clone(),
            data: event.cronjob.data.clone(),
            scheduled_at: event.scheduled_at,
        };

        let started_at = self.clock.now();
        let started = Instant::now();
        let mut run = tokio::spawn(handler(ctx));
        let mut timed_out = false;
        let joined = tokio::select! {
            joined = &mut run => joined,
            _ = tokio::time::sleep(timeout) => {
                timed_out = true;
                deadline.cancel();
                warn!(job = %name, timeout_sec = timeout.as_secs(), "Cronjob deadline exceeded, waiting for handler");
                run.await
            }
        };
        let elapsed = started.elapsed();
        let end_date = self.clock.now();

        let outcome = match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(anyhow::anyhow!(
                "handler panicked: {}",
                panic_message(e.into_panic())
            )),
            Err(e) => Err(anyhow::anyhow!("handler task failed: {e}")),
        };
        let (success, error_message, data) = match outcome {
            Ok(payload) => {
                let data = payload.map(|payload| CronjobData::new(payload, end_date));
                if timed_out {
                    let message = format!("deadline exceeded after {}s", timeout.as_secs());
                    (false, Some(message), data)
                } else {
                    (true, None, data)
                }
            }
            Err(e) => (false, Some(format!("{e:#}")), None),
        };

        let completed = CronjobCompletedEvent {
            name,
            success,
            started_at,
            end_date,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            error_message,
            node_name: self.node_name.clone(),
            data,
        };
        self.publish_completion(&completed).await;
        Some(completed)
    }

    async fn publish_completion(&self, event: &CronjobCompletedEvent) {
        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(job = %event.name, error = %e, "Failed to serialize completion event");
                return;
            }
        };
        if let Err(e) = self
            .stream
            .publish(COMPLETE_SUBJECT.to_string(), payload.into())
            .await
        {
            error!(job = %event.name, error = %e, "Failed to publish completion event");
        }
    }
}

async fn nak<M: StreamMessage>(message: &M) {
    if let Err(e) = message.nak(Some(NAK_DELAY)).await {
        warn!(error = %e, "Failed to nak schedule event");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Cronjob;
    use chrono::{DateTime, Utc};
    use rpnet_nats::MockStream;
    use rpnet_std::time::MockClock;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn t(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn executor(stream: &MockStream, handlers: &Handlers) -> Executor<MockStream, MockClock> {
        Executor::new(
            stream.clone(),
            handlers.clone(),
            MockClock::at(t("2026-01-01T00:01:00Z")),
            "node-a",
        )
    }

    async fn schedule(stream: &MockStream, job: Cronjob) {
        let event = CronjobSchedulerEvent {
            cronjob: job,
            scheduled_at: t("2026-01-01T00:01:00Z"),
        };
        stream
            .publish(SCHEDULE_SUBJECT.to_string(), serde_json::to_vec(&event).unwrap().into())
            .await
            .unwrap();
    }

    async fn next_message(stream: &MockStream) -> rpnet_nats::MockMessage {
        let mut messages = stream
            .consume(ConsumerConfig::new(EXECUTOR_CONSUMER, SCHEDULE_SUBJECT).max_deliver(MAX_DELIVER))
            .await
            .unwrap();
        messages.next().await.unwrap().unwrap()
    }

    fn completions(stream: &MockStream) -> Vec<CronjobCompletedEvent> {
        stream
            .published_on(COMPLETE_SUBJECT)
            .iter()
            .map(|m| serde_json::from_slice(&m.payload).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn acks_before_the_handler_runs() {
        let stream = MockStream::new();
        let handlers = Handlers::new();
        let acked_before_run = Arc::new(AtomicBool::new(false));
        {
            let stream = stream.clone();
            let acked_before_run = Arc::clone(&acked_before_run);
            handlers.add("demo", move |_| {
                acked_before_run.store(stream.ack_count() == 1, Ordering::SeqCst);
                async { Ok(None) }
            });
        }
        schedule(&stream, Cronjob::new("demo", "@always")).await;

        let message = next_message(&stream).await;
        let completed = executor(&stream, &handlers)
            .handle(message, CancellationToken::new())
            .await
            .unwrap();

        assert!(acked_before_run.load(Ordering::SeqCst));
        assert!(completed.success);
        assert_eq!(completed.node_name, "node-a");
        assert_eq!(completions(&stream), vec![completed]);
    }

    #[tokio::test]
    async fn returned_payload_becomes_job_data() {
        let stream = MockStream::new();
        let handlers = Handlers::new();
        handlers.add("demo", |ctx: JobContext| async move {
            let runs = ctx
                .data
                .payload
                .and_then(|p| p["runs"].as_u64())
                .unwrap_or(0);
            Ok(Some(serde_json::json!({ "runs": runs + 1 })))
        });
        schedule(
            &stream,
            Cronjob::new("demo", "@always").with_payload(serde_json::json!({"runs": 4})),
        )
        .await;

        let completed = executor(&stream, &handlers)
            .handle(next_message(&stream).await, CancellationToken::new())
            .await
            .unwrap();
        let data = completed.data.unwrap();
        assert_eq!(data.payload, Some(serde_json::json!({"runs": 5})));
        assert_eq!(data.updated_at, Some(t("2026-01-01T00:01:00Z")));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_handler_naks_until_dropped() {
        let stream = MockStream::new();
        let executor = executor(&stream, &Handlers::new());
        schedule(&stream, Cronjob::new("nobody", "@always")).await;

        let mut messages = stream
            .consume(ConsumerConfig::new(EXECUTOR_CONSUMER, SCHEDULE_SUBJECT).max_deliver(MAX_DELIVER))
            .await
            .unwrap();
        for _ in 0..MAX_DELIVER {
            let message = messages.next().await.unwrap().unwrap();
            assert!(executor.handle(message, CancellationToken::new()).await.is_none());
        }

        assert_eq!(stream.ack_count(), 0);
        assert_eq!(stream.dead_letters().len(), 1);
        assert!(completions(&stream).is_empty());
    }

    #[tokio::test]
    async fn undecodable_event_is_naked() {
        let stream = MockStream::new();
        stream
            .publish(SCHEDULE_SUBJECT.to_string(), bytes::Bytes::from_static(b"not json"))
            .await
            .unwrap();
        let message = next_message(&stream).await;
        assert!(
            executor(&stream, &Handlers::new())
                .handle(message, CancellationToken::new())
                .await
                .is_none()
        );
        assert_eq!(stream.nak_count(), 1);
    }

    #[tokio::test]
    async fn handler_error_is_reported() {
        let stream = MockStream::new();
        let handlers = Handlers::new();
        handlers.add("demo", |_| async { Err(anyhow::anyhow!("database unreachable")) });
        schedule(&stream, Cronjob::new("demo", "@always")).await;

        let completed = executor(&stream, &handlers)
            .handle(next_message(&stream).await, CancellationToken::new())
            .await
            .unwrap();
        assert!(!completed.success);
        assert_eq!(completed.error_message.as_deref(), Some("database unreachable"));
    }

    fn explode() -> crate::handlers::HandlerResult {
        panic!("boom")
    }

    #[tokio::test]
    async fn panicking_handler_is_recovered() {
        let stream = MockStream::new();
        let handlers = Handlers::new();
        handlers.add("demo", |_| async { explode() });
        schedule(&stream, Cronjob::new("demo", "@always")).await;

        let completed = executor(&stream, &handlers)
            .handle(next_message(&stream).await, CancellationToken::new())
            .await
            .unwrap();
        assert!(!completed.success);
        assert_eq!(completed.error_message.as_deref(), Some("handler panicked: boom"));
        assert_eq!(completions(&stream).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn uncooperative_handler_still_completes_after_timeout() {
        let stream = MockStream::new();
        let handlers = Handlers::new();
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let cancelled = Arc::clone(&cancelled);
            handlers.add("demo", move |ctx: JobContext| {
                let cancelled = Arc::clone(&cancelled);
                async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    cancelled.store(ctx.cancel.is_cancelled(), Ordering::SeqCst);
                    Ok(None)
                }
            });
        }
        schedule(
            &stream,
            Cronjob::new("demo", "@always").with_timeout(Duration::from_secs(1)),
        )
        .await;

        let completed = executor(&stream, &handlers)
            .handle(next_message(&stream).await, CancellationToken::new())
            .await
            .unwrap();

        assert!(cancelled.load(Ordering::SeqCst));
        assert!(!completed.success);
        assert_eq!(completed.error_message.as_deref(), Some("deadline exceeded after 1s"));
        assert!((5000..5100).contains(&completed.elapsed_ms), "{}", completed.elapsed_ms);
        assert_eq!(completions(&stream).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cooperative_handler_stops_at_the_deadline() {
        let stream = MockStream::new();
        let handlers = Handlers::new();
        handlers.add("demo", |ctx: JobContext| async move {
            ctx.cancel.cancelled().await;
            Err(anyhow::anyhow!("cancelled"))
        });
        schedule(
            &stream,
            Cronjob::new("demo", "@always").with_timeout(Duration::from_secs(2)),
        )
        .await;

        let completed = executor(&stream, &handlers)
            .handle(next_message(&stream).await, CancellationToken::new())
            .await
            .unwrap();
        assert!(!completed.success);
        assert!((2000..2100).contains(&completed.elapsed_ms));
    }

    #[tokio::test]
    async fn run_spawns_each_event_on_its_own_task() {
        let stream = MockStream::new();
        let handlers = Handlers::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handlers.add("slow", move |_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(None)
                }
            });
        }

        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let executor = executor(&stream, &handlers);
            let cancel = cancel.clone();
            async move { executor.run(cancel).await }
        });
        for _ in 0..3 {
            schedule(&stream, Cronjob::new("slow", "@always")).await;
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while completions(&stream).len() < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 3);

        cancel.cancel();
        run.await.unwrap().unwrap();
    }
}
