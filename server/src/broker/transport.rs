//! Broker Transport
//!
//! The client drives the broker only through these traits, so the
//! connection state machine can run against a real AMQP server or an
//! in-process fake.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use super::topology::{ExchangeSpec, QueueSpec};
use super::BrokerError;

/// Message headers. Values are limited to what AMQP field tables carry.
pub type Headers = BTreeMap<String, serde_json::Value>;

/// Stream of deliveries for one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// A message ready for publishing.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub content_type: String,
    pub persistent: bool,
    pub headers: Headers,
}

/// A message received from a queue.
///
/// Clones share the settlement flag, so a delivery is acknowledged or
/// rejected at most once no matter which clone settles it.
#[derive(Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub queue: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: Headers,
    pub body: Vec<u8>,
    settled: Arc<AtomicBool>,
    /// Channel the delivery arrived on; tags are only valid there.
    channel: Option<Arc<dyn BrokerChannel>>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        redelivered: bool,
        headers: Headers,
        body: Vec<u8>,
    ) -> Self {
        Self {
            delivery_tag,
            queue: queue.into(),
            routing_key: routing_key.into(),
            redelivered,
            headers,
            body,
            settled: Arc::new(AtomicBool::new(false)),
            channel: None,
        }
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Whether the delivery has been acknowledged or rejected.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// Mark settled; returns `false` if it already was.
    pub(crate) fn mark_settled(&self) -> bool {
        !self.settled.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn bind_channel(mut self, channel: Arc<dyn BrokerChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub(crate) fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.channel.clone()
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("queue", &self.queue)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .field("settled", &self.is_settled())
            .finish_non_exhaustive()
    }
}

/// One open channel on a broker connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Limit unacknowledged deliveries in flight.
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Idempotent exchange declaration.
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    /// Idempotent queue declaration.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError>;

    /// Fire-and-forget publish; confirms are not awaited.
    async fn publish(&self, exchange: &str, routing_key: &str, message: OutboundMessage) -> Result<(), BrokerError>;

    /// Start consuming a queue.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Close the channel and its connection.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// An established connection.
pub struct BrokerSession {
    pub channel: Arc<dyn BrokerChannel>,
    /// Resolves with a reason once the connection is lost. A dropped sender
    /// also counts as lost.
    pub closed: oneshot::Receiver<String>,
}

/// Opens broker connections.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<BrokerSession, BrokerError>;
}
