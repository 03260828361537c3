//! Lane-Aware Service Routing
//!
//! Polls the service registry into an immutable topology snapshot and
//! resolves logical service names to lane-scoped URLs.

pub mod client;
pub mod registry;
pub mod router;

use thiserror::Error;

pub use client::ServiceClient;
pub use registry::{RegistryClient, ServiceInfo, Topology};
pub use router::{FetchOptions, ServiceRouter, DEFAULT_POLL_INTERVAL};

/// Errors raised while talking to the registry or a routed service.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// Transport or decoding failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Registry answered with a non-success status.
    #[error("Registry responded {0}")]
    RegistryStatus(u16),
}
