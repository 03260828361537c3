//! Message Broker
//!
//! One AMQP connection and channel per process, lane-scoped queue topology
//! with dead-lettering, and reconnect-forever recovery.
//!
//! Architecture:
//! - [`topology`] derives the ordered declaration plan from the process lane.
//! - [`transport`] is the seam between the client and the wire protocol.
//! - [`amqp`] implements the seam with `lapin`.
//! - [`client`] owns the connection lifecycle, publishing and consuming.

pub mod amqp;
pub mod client;
pub mod topology;
pub mod transport;

use thiserror::Error;

pub use amqp::AmqpConnector;
pub use client::{BrokerClient, BrokerConfig, ConnectionState, MessageHandler, PublishOptions};
pub use topology::{QueueBinding, TopologyStep};
pub use transport::{BrokerChannel, BrokerConnector, BrokerSession, Delivery, OutboundMessage};

/// Errors raised by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// No broker URL configured. Fatal at startup.
    #[error("RABBITMQ_URL is not configured")]
    NotConfigured,

    /// A channel operation was attempted before `connect()` succeeded.
    #[error("Broker channel not available; call connect() first")]
    NotConnected,

    /// The connection was lost; a reconnect is pending.
    #[error("Broker connection lost; reconnect pending")]
    Disconnected,

    /// The delivery was already acknowledged or rejected.
    #[error("Delivery {0} already settled")]
    AlreadySettled(u64),

    /// Wire-level failure.
    #[error("Broker transport error: {0}")]
    Transport(String),

    /// Message body could not be encoded.
    #[error("Failed to encode message body: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    /// Whether the failure is expected to clear once the connection recovers.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Transport(_))
    }
}
