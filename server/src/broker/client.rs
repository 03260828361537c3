//! Broker Client
//!
//! Owns the single connection and channel of the process. On connection loss
//! the channel is dropped, the state flips to `Disconnected`, and one
//! reconnect loop retries every `reconnect_delay` until it succeeds. A
//! successful reconnect re-declares the topology and re-attaches consumers
//! before the new channel is installed, so publishes never reach a channel
//! whose queues are missing.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use futures::StreamExt;
use lane_common::{lane_routing_key, normalize_lane};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::topology::{self, QueueBinding, TopologyStep, EXCHANGE_NAME};
use super::transport::{BrokerChannel, BrokerConnector, Delivery, Headers, OutboundMessage};
use super::BrokerError;
use crate::config::Config;

/// Default unacknowledged deliveries in flight per channel.
pub const DEFAULT_PREFETCH: u16 = 10;

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

const CONTENT_TYPE_JSON: &str = "application/json";
const DELAY_HEADER: &str = "x-delay";

/// Connection lifecycle as observed by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Broker client settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker URL; `None` disables the broker.
    pub url: Option<String>,
    /// Process lane (`None` = production).
    pub lane: Option<String>,
    pub prefetch: u16,
    pub reconnect_delay: Duration,
    /// Logical queues to declare and bind.
    pub queues: Vec<QueueBinding>,
}

impl BrokerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: config.rabbitmq_url.clone(),
            lane: config.lane.clone(),
            prefetch: config.broker_prefetch,
            reconnect_delay: config.broker_reconnect_delay(),
            queues: topology::default_bindings(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: None,
            lane: None,
            prefetch: DEFAULT_PREFETCH,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            queues: topology::default_bindings(),
        }
    }
}

/// Per-message publish options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Delivery delay, sent as the `x-delay` header in milliseconds.
    pub delay: Option<Duration>,
    /// Extra headers. `x-delay` is always taken from `delay`.
    pub headers: Headers,
    /// Target lane instead of the process lane. `"prod"` targets production.
    pub lane: Option<String>,
}

/// Processes one delivery.
///
/// Returning `Ok` acknowledges the delivery unless the handler already
/// settled it. Returning `Err` (or panicking) rejects it without requeue so
/// the broker dead-letters it.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()>;
}

struct ChannelHandle {
    channel: Arc<dyn BrokerChannel>,
    generation: u64,
}

#[derive(Clone)]
struct ConsumerRegistration {
    queue: String,
    handler: Arc<dyn MessageHandler>,
}

struct ClientInner {
    config: BrokerConfig,
    connector: Arc<dyn BrokerConnector>,
    channel: ArcSwapOption<ChannelHandle>,
    state: watch::Sender<ConnectionState>,
    /// Serializes `connect()` with reconnect attempts.
    connect_lock: tokio::sync::Mutex<()>,
    /// Generation of the most recently opened session.
    generation: AtomicU64,
    ever_connected: AtomicBool,
    reconnecting: AtomicBool,
    shutdown: AtomicBool,
    consumers: Mutex<Vec<ConsumerRegistration>>,
}

/// Lane-aware AMQP client.
///
/// Cloning is cheap; all clones share one connection.
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<ClientInner>,
}

impl BrokerClient {
    pub fn new(config: BrokerConfig, connector: Arc<dyn BrokerConnector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ClientInner {
                config,
                connector,
                channel: ArcSwapOption::empty(),
                state,
                connect_lock: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
                ever_connected: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                consumers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Process lane used for topology and default publish routing.
    pub fn lane(&self) -> Option<&str> {
        normalize_lane(self.inner.config.lane.as_deref())
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Open the connection and channel. Idempotent while connected.
    ///
    /// # Errors
    /// [`BrokerError::NotConfigured`] without a URL; transport errors when
    /// the broker is unreachable.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.inner.channel.load().is_some() {
            return Ok(());
        }

        let url = self
            .inner
            .config
            .url
            .as_deref()
            .ok_or(BrokerError::NotConfigured)?;
        self.inner.shutdown.store(false, Ordering::SeqCst);

        // After an outage this is a recovery, not a first connect
        let recovering = self.inner.ever_connected.load(Ordering::SeqCst);
        self.establish(url, recovering).await?;

        info!(
            lane = self.lane().unwrap_or("prod"),
            recovered = recovering,
            "Broker connected"
        );
        Ok(())
    }

    /// Declare exchanges, queues and bindings for the process lane.
    pub async fn declare_topology(&self) -> Result<(), BrokerError> {
        let channel = self.channel()?;
        self.apply_topology(channel.as_ref()).await
    }

    /// Publish a JSON message to `{routing_key_base}[.{lane}]` on the main
    /// exchange. Persistent; delivery is not confirmed.
    pub async fn publish<T>(
        &self,
        routing_key_base: &str,
        body: &T,
        options: PublishOptions,
    ) -> Result<(), BrokerError>
    where
        T: Serialize + ?Sized,
    {
        let channel = self.channel()?;

        let lane = match options.lane.as_deref() {
            Some(lane) => normalize_lane(Some(lane)),
            None => self.lane(),
        };
        let routing_key = lane_routing_key(routing_key_base, lane);

        let mut headers = options.headers;
        if let Some(delay) = options.delay {
            let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            headers.insert(DELAY_HEADER.to_string(), serde_json::Value::from(millis));
        }

        let message = OutboundMessage {
            body: serde_json::to_vec(body)?,
            content_type: CONTENT_TYPE_JSON.to_string(),
            persistent: true,
            headers,
        };

        channel.publish(EXCHANGE_NAME, &routing_key, message).await?;
        debug!(routing_key = %routing_key, "Message published");
        Ok(())
    }

    /// Start consuming `queue` with `handler`.
    ///
    /// The registration survives reconnects: after the connection recovers
    /// the consumer is re-attached on the new channel.
    pub async fn consume<H>(&self, queue: &str, handler: H) -> Result<(), BrokerError>
    where
        H: MessageHandler,
    {
        let handler: Arc<dyn MessageHandler> = Arc::new(handler);
        let channel = self.channel()?;

        self.start_consumer(&channel, queue, Arc::clone(&handler))
            .await?;

        self.registrations().push(ConsumerRegistration {
            queue: queue.to_string(),
            handler,
        });
        info!(queue, "Consumer started");
        Ok(())
    }

    /// Acknowledge a delivery.
    pub async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let channel = self.settle_channel(delivery)?;
        if !delivery.mark_settled() {
            return Err(BrokerError::AlreadySettled(delivery.delivery_tag));
        }
        channel.ack(delivery.delivery_tag).await
    }

    /// Reject a delivery. Without requeue the broker dead-letters it.
    pub async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        let channel = self.settle_channel(delivery)?;
        if !delivery.mark_settled() {
            return Err(BrokerError::AlreadySettled(delivery.delivery_tag));
        }
        channel.nack(delivery.delivery_tag, requeue).await
    }

    /// Close the connection and stop reconnecting.
    pub async fn close(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.ever_connected.store(false, Ordering::SeqCst);
        self.registrations().clear();

        if let Some(handle) = self.inner.channel.swap(None) {
            if let Err(e) = handle.channel.close().await {
                debug!(error = %e, "Ignoring error while closing broker connection");
            }
        }
        self.set_state(ConnectionState::Disconnected);
        info!("Broker connection closed");
    }

    fn channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        match self.inner.channel.load_full() {
            Some(handle) => Ok(Arc::clone(&handle.channel)),
            None if self.inner.ever_connected.load(Ordering::SeqCst) => Err(BrokerError::Disconnected),
            None => Err(BrokerError::NotConnected),
        }
    }

    fn settle_channel(&self, delivery: &Delivery) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        delivery.channel().map_or_else(|| self.channel(), Ok)
    }

    fn registrations(&self) -> MutexGuard<'_, Vec<ConsumerRegistration>> {
        self.inner
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state.send_replace(state);
    }

    fn install(&self, handle: Arc<ChannelHandle>) {
        self.inner.channel.store(Some(handle));
        self.inner.ever_connected.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
    }

    /// Connect, apply prefetch and start watching for connection loss.
    async fn open_session(&self, url: &str) -> Result<Arc<ChannelHandle>, BrokerError> {
        let session = self.inner.connector.connect(url).await?;

        if let Err(e) = session.channel.set_prefetch(self.inner.config.prefetch).await {
            let _ = session.channel.close().await;
            return Err(e);
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.watch_session(generation, session.closed);

        Ok(Arc::new(ChannelHandle {
            channel: session.channel,
            generation,
        }))
    }

    fn watch_session(&self, generation: u64, closed: oneshot::Receiver<String>) {
        let client = self.clone();
        tokio::spawn(async move {
            let reason = closed
                .await
                .unwrap_or_else(|_| "connection dropped".to_string());
            client.handle_connection_lost(generation, &reason);
        });
    }

    fn handle_connection_lost(&self, generation: u64, reason: &str) {
        if self.inner.shutdown.load(Ordering::SeqCst)
            || generation != self.inner.generation.load(Ordering::SeqCst)
        {
            return;
        }

        warn!(
            reason,
            retry_in_secs = self.inner.config.reconnect_delay.as_secs(),
            "Broker connection lost"
        );
        if let Some(current) = self.inner.channel.load_full() {
            if current.generation == generation {
                self.inner.channel.store(None);
            }
        }
        self.set_state(ConnectionState::Disconnected);
        self.schedule_reconnect();
    }

    /// Start the reconnect loop unless one is already running.
    fn schedule_reconnect(&self) {
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let client = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(client.inner.config.reconnect_delay).await;
                if client.inner.shutdown.load(Ordering::SeqCst) {
                    break;
                }

                match client.reconnect_once().await {
                    Ok(()) => {
                        info!("Broker reconnected");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Broker reconnect failed");
                    }
                }
            }
            client.inner.reconnecting.store(false, Ordering::SeqCst);

            // Lost again between install and the flag reset
            if client.inner.channel.load().is_none() && !client.inner.shutdown.load(Ordering::SeqCst) {
                client.schedule_reconnect();
            }
        });
    }

    async fn reconnect_once(&self) -> Result<(), BrokerError> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.inner.channel.load().is_some() {
            return Ok(());
        }
        let url = self
            .inner
            .config
            .url
            .as_deref()
            .ok_or(BrokerError::NotConfigured)?;
        self.establish(url, true).await
    }

    /// Open a session and install it. With `restore`, topology and
    /// registered consumers are brought back before the channel is visible.
    /// Callers hold `connect_lock`.
    async fn establish(&self, url: &str, restore: bool) -> Result<(), BrokerError> {
        self.set_state(ConnectionState::Connecting);
        let handle = match self.open_session(url).await {
            Ok(handle) => handle,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        if restore {
            if let Err(e) = self.restore(&handle.channel).await {
                let _ = handle.channel.close().await;
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        }

        self.install(handle);
        Ok(())
    }

    /// Re-declare topology and re-attach registered consumers.
    async fn restore(&self, channel: &Arc<dyn BrokerChannel>) -> Result<(), BrokerError> {
        self.apply_topology(channel.as_ref()).await?;

        let consumers = self.registrations().clone();
        for registration in consumers {
            self.start_consumer(channel, &registration.queue, registration.handler)
                .await?;
        }
        Ok(())
    }

    async fn apply_topology(&self, channel: &dyn BrokerChannel) -> Result<(), BrokerError> {
        let lane = self.lane();
        for step in topology::plan(lane, &self.inner.config.queues) {
            match &step {
                TopologyStep::Exchange(spec) => channel.declare_exchange(spec).await?,
                TopologyStep::Queue(spec) => channel.declare_queue(spec).await?,
                TopologyStep::Bind {
                    queue,
                    exchange,
                    routing_key,
                } => channel.bind_queue(queue, exchange, routing_key).await?,
            }
        }
        info!(lane = lane.unwrap_or("prod"), "Broker topology declared");
        Ok(())
    }

    async fn start_consumer(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        let consumer_tag = format!("{queue}-{}", Uuid::new_v4().simple());
        let mut stream = channel.consume(queue, &consumer_tag).await?;

        let client = self.clone();
        let channel = Arc::clone(channel);
        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(next) = stream.next().await {
                match next {
                    Ok(delivery) => {
                        let delivery = delivery.bind_channel(Arc::clone(&channel));
                        let client = client.clone();
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move { client.dispatch(handler, delivery).await });
                    }
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "Consumer stream failed");
                        break;
                    }
                }
            }
            debug!(queue = %queue, consumer_tag = %consumer_tag, "Consumer stream ended");
        });
        Ok(())
    }

    /// Run the handler, then settle the delivery by its outcome.
    async fn dispatch(&self, handler: Arc<dyn MessageHandler>, delivery: Delivery) {
        let task_delivery = delivery.clone();
        let outcome = tokio::spawn(async move { handler.handle(&task_delivery).await }).await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(join_err) => Some(format!("handler panicked: {join_err}")),
        };

        match failure {
            None => {
                if delivery.is_settled() {
                    return;
                }
                if let Err(e) = self.ack(&delivery).await {
                    warn!(queue = %delivery.queue, delivery_tag = delivery.delivery_tag, error = %e, "Failed to ack delivery");
                }
            }
            Some(reason) => {
                error!(
                    queue = %delivery.queue,
                    delivery_tag = delivery.delivery_tag,
                    error = %reason,
                    "Message handler failed, dead-lettering"
                );
                match self.nack(&delivery, false).await {
                    Ok(()) | Err(BrokerError::AlreadySettled(_)) => {}
                    Err(e) => {
                        warn!(queue = %delivery.queue, delivery_tag = delivery.delivery_tag, error = %e, "Failed to reject delivery");
                    }
                }
            }
        }
    }
}
