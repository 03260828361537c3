//! AMQP Transport
//!
//! `lapin` implementation of the broker transport traits.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::oneshot;
use tracing::error;

use super::topology::{ExchangeKind, ExchangeSpec, QueueSpec};
use super::transport::{
    BrokerChannel, BrokerConnector, BrokerSession, Delivery, DeliveryStream, Headers, OutboundMessage,
};
use super::BrokerError;

const DELAYED_EXCHANGE_TYPE: &str = "x-delayed-message";

impl From<lapin::Error> for BrokerError {
    fn from(e: lapin::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Connects to a RabbitMQ server.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpConnector;

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self, url: &str) -> Result<BrokerSession, BrokerError> {
        let connection = Connection::connect(url, connection_properties()).await?;

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        connection.on_error(move |err| {
            error!(error = %err, "Broker connection error");
            if let Some(tx) = tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = tx.send(err.to_string());
            }
        });

        let channel = connection.create_channel().await?;

        Ok(BrokerSession {
            channel: Arc::new(AmqpChannel { connection, channel }),
            closed: rx,
        })
    }
}

/// A `lapin` channel and the connection that owns it.
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel.basic_qos(count, BasicQosOptions::default()).await?;
        Ok(())
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        let mut arguments = FieldTable::default();
        let kind = match spec.kind {
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::DelayedTopic => {
                arguments.insert(
                    ShortString::from("x-delayed-type"),
                    AMQPValue::LongString("topic".into()),
                );
                lapin::ExchangeKind::Custom(DELAYED_EXCHANGE_TYPE.to_string())
            }
        };

        let options = ExchangeDeclareOptions {
            durable: spec.durable,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(&spec.name, kind, options, arguments)
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        let mut arguments = FieldTable::default();
        if let Some(dlx) = &spec.dead_letter_exchange {
            arguments.insert(
                ShortString::from("x-dead-letter-exchange"),
                AMQPValue::LongString(dlx.as_str().into()),
            );
        }
        if let Some(expires) = spec.expires {
            let millis = i64::try_from(expires.as_millis()).unwrap_or(i64::MAX);
            arguments.insert(ShortString::from("x-expires"), AMQPValue::LongLongInt(millis));
        }

        let options = QueueDeclareOptions {
            durable: spec.durable,
            ..QueueDeclareOptions::default()
        };
        self.channel.queue_declare(&spec.name, options, arguments).await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: OutboundMessage) -> Result<(), BrokerError> {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(message.content_type))
            .with_delivery_mode(if message.persistent { 2 } else { 1 });
        if !message.headers.is_empty() {
            properties = properties.with_headers(to_field_table(&message.headers));
        }

        // The returned confirm is dropped; publishing does not wait on it.
        let _confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let queue = queue.to_string();
        let stream = consumer.map(move |item| -> Result<Delivery, BrokerError> {
            let delivery = item?;
            let headers = delivery
                .properties
                .headers()
                .as_ref()
                .map(from_field_table)
                .unwrap_or_default();
            Ok(Delivery::new(
                delivery.delivery_tag,
                queue.clone(),
                delivery.routing_key.as_str(),
                delivery.redelivered,
                headers,
                delivery.data,
            ))
        });

        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let options = BasicNackOptions {
            multiple: false,
            requeue,
        };
        self.channel.basic_nack(delivery_tag, options).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.channel.close(200, "closing").await?;
        self.connection.close(200, "closing").await?;
        Ok(())
    }
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(ShortString::from(key.as_str()), to_amqp_value(value));
    }
    table
}

fn to_amqp_value(value: &serde_json::Value) -> AMQPValue {
    use serde_json::Value;

    match value {
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                AMQPValue::LongLongInt(i)
            } else {
                AMQPValue::Double(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => AMQPValue::LongString(s.as_str().into()),
        Value::Null => AMQPValue::Void,
        other => AMQPValue::LongString(other.to_string().as_str().into()),
    }
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), from_amqp_value(value)))
        .collect()
}

fn from_amqp_value(value: &AMQPValue) -> serde_json::Value {
    use serde_json::Value;

    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(i) => Value::from(*i),
        AMQPValue::ShortShortUInt(i) => Value::from(*i),
        AMQPValue::ShortInt(i) => Value::from(*i),
        AMQPValue::ShortUInt(i) => Value::from(*i),
        AMQPValue::LongInt(i) => Value::from(*i),
        AMQPValue::LongUInt(i) => Value::from(*i),
        AMQPValue::LongLongInt(i) => Value::from(*i),
        AMQPValue::Float(f) => Value::from(f64::from(*f)),
        AMQPValue::Double(f) => Value::from(*f),
        AMQPValue::ShortString(s) => Value::String(s.as_str().to_string()),
        AMQPValue::LongString(s) => Value::String(s.to_string()),
        _ => Value::Null,
    }
}

/// Runs lapin's IO and internal tasks on the current tokio runtime.
fn connection_properties() -> ConnectionProperties {
    ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current())
        .with_reactor(tokio_reactor_trait::Tokio)
}
