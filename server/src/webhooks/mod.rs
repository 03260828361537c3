//! Bot Webhooks
//!
//! Inbound bot event and card callbacks, relayed fire-and-forget to the lane
//! that owns the bot.

pub mod bots;
pub mod events;
pub mod forwarder;
pub mod handlers;

use thiserror::Error;

pub use bots::{BotConfig, BotRegistry};
pub use forwarder::{EventForwarder, ForwardTarget};

/// Errors from a single forward attempt. Logged, never returned to the
/// webhook caller.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Network or protocol failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Target answered with a non-success status.
    #[error("Target responded {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body text.
        body: String,
    },
}
