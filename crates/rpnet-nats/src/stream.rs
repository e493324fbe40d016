use std::future::Future;
use std::time::Duration;

use async_nats::jetstream::{self, AckKind, consumer, stream};
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::error::StreamError;

/// Messages delivered to a durable consumer.
pub type StreamMessages<M> = BoxStream<'static, Result<M, StreamError>>;

/// Durable pull consumer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub durable: String,
    pub filter_subject: String,
    /// Deliveries before the substrate gives up on a message.
    pub max_deliver: i64,
    pub ack_wait: Duration,
}

impl ConsumerConfig {
    pub fn new(durable: impl Into<String>, filter_subject: impl Into<String>) -> Self {
        Self {
            durable: durable.into(),
            filter_subject: filter_subject.into(),
            max_deliver: 3,
            ack_wait: Duration::from_secs(30),
        }
    }

    pub fn max_deliver(mut self, max_deliver: i64) -> Self {
        self.max_deliver = max_deliver;
        self
    }

    pub fn ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }
}

/// A message that must be explicitly acknowledged.
pub trait StreamMessage: Send + Sync + 'static {
    fn subject(&self) -> &str;

    fn payload(&self) -> &[u8];

    /// 1 on first delivery, incremented on every redelivery.
    fn delivered(&self) -> i64;

    fn ack(&self) -> impl Future<Output = Result<(), StreamError>> + Send;

    /// Ask for redelivery, optionally after `delay`.
    fn nak(&self, delay: Option<Duration>) -> impl Future<Output = Result<(), StreamError>> + Send;

    /// Extend the ack deadline of a message still being worked on.
    fn in_progress(&self) -> impl Future<Output = Result<(), StreamError>> + Send;
}

/// Publish into a stream and consume it through durable consumers.
///
/// Consumers sharing a durable name share one cursor: each message goes to
/// exactly one of them.
pub trait JetStream: Send + Sync + Clone + 'static {
    type Message: StreamMessage;

    /// Returns once the stream has persisted the message.
    fn publish(
        &self,
        subject: String,
        payload: Bytes,
    ) -> impl Future<Output = Result<(), StreamError>> + Send;

    fn consume(
        &self,
        config: ConsumerConfig,
    ) -> impl Future<Output = Result<StreamMessages<Self::Message>, StreamError>> + Send;
}

impl StreamMessage for jetstream::Message {
    fn subject(&self) -> &str {
        self.message.subject.as_str()
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn delivered(&self) -> i64 {
        self.info().map(|info| info.delivered).unwrap_or(1)
    }

    async fn ack(&self) -> Result<(), StreamError> {
        jetstream::Message::ack(self)
            .await
            .map_err(|e| StreamError::Ack(e.to_string()))
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), StreamError> {
        self.ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| StreamError::Ack(e.to_string()))
    }

    async fn in_progress(&self) -> Result<(), StreamError> {
        self.ack_with(AckKind::Progress)
            .await
            .map_err(|e| StreamError::Ack(e.to_string()))
    }
}

/// [`JetStream`] bound to one JetStream stream.
#[derive(Clone)]
pub struct NatsStream {
    js: jetstream::Context,
    stream: String,
}

impl NatsStream {
    pub fn new(js: jetstream::Context, stream: impl Into<String>) -> Self {
        Self {
            js,
            stream: stream.into(),
        }
    }
}

impl JetStream for NatsStream {
    type Message = jetstream::Message;

    async fn publish(&self, subject: String, payload: Bytes) -> Result<(), StreamError> {
        let failed = |reason: String| StreamError::Publish {
            subject: subject.clone(),
            reason,
        };
        let ack = self
            .js
            .publish(subject.clone(), payload)
            .await
            .map_err(|e| failed(e.to_string()))?;
        ack.await.map_err(|e| failed(e.to_string()))?;
        Ok(())
    }

    async fn consume(
        &self,
        config: ConsumerConfig,
    ) -> Result<StreamMessages<jetstream::Message>, StreamError> {
        let failed = |reason: String| StreamError::Consumer {
            consumer: config.durable.clone(),
            reason,
        };

        let stream = self
            .js
            .get_stream(&self.stream)
            .await
            .map_err(|e| failed(e.to_string()))?;

        let consumer: consumer::Consumer<consumer::pull::Config> = stream
            .get_or_create_consumer(
                &config.durable,
                consumer::pull::Config {
                    durable_name: Some(config.durable.clone()),
                    filter_subject: config.filter_subject.clone(),
                    ack_policy: consumer::AckPolicy::Explicit,
                    deliver_policy: consumer::DeliverPolicy::All,
                    max_deliver: config.max_deliver,
                    ack_wait: config.ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| failed(e.to_string()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let durable = config.durable.clone();
        Ok(messages
            .map(move |message| {
                message.map_err(|e| StreamError::Consumer {
                    consumer: durable.clone(),
                    reason: e.to_string(),
                })
            })
            .boxed())
    }
}

/// Stream settings the cron subsystem cares about.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    /// Messages older than this are discarded.
    pub max_age: Duration,
}

/// Create the stream, or bind to it if another node already did.
pub async fn get_or_create_stream(
    js: &jetstream::Context,
    config: StreamConfig,
) -> Result<NatsStream, StreamError> {
    let name = config.name.clone();
    let created = js
        .create_stream(stream::Config {
            name: config.name,
            subjects: config.subjects,
            max_age: config.max_age,
            ..Default::default()
        })
        .await;

    if created.is_err() {
        js.get_stream(&name)
            .await
            .map_err(|e| StreamError::Setup {
                stream: name.clone(),
                reason: e.to_string(),
            })?;
    }
    Ok(NatsStream::new(js.clone(), name))
}
