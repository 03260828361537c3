//! Service Registry Client
//!
//! Fetches `GET {registry}/v1/routes`. Both the wrapped form
//! `{"services": {...}}` and a bare service map are accepted.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::RoutingError;

/// Deployment info for one logical service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Lanes the service is deployed in.
    #[serde(default)]
    pub lanes: HashSet<String>,
    /// Service port (`0` when unknown).
    #[serde(default)]
    pub port: u16,
}

/// Service name to deployment info, replaced whole on every refresh.
pub type Topology = HashMap<String, ServiceInfo>;

#[derive(Deserialize)]
#[serde(untagged)]
enum RoutesPayload {
    Wrapped { services: Topology },
    Bare(Topology),
}

impl RoutesPayload {
    fn into_topology(self) -> Topology {
        match self {
            Self::Wrapped { services } | Self::Bare(services) => services,
        }
    }
}

/// Parse a registry response body.
pub fn parse_routes(body: &[u8]) -> Result<Topology, serde_json::Error> {
    serde_json::from_slice::<RoutesPayload>(body).map(RoutesPayload::into_topology)
}

/// HTTP client for the service registry.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    base_url: String,
    http: reqwest::Client,
}

impl RegistryClient {
    /// Create a client; trailing slashes on `base_url` are trimmed.
    pub fn new(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    /// Registry base URL without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the full routing table.
    pub async fn fetch_routes(&self) -> Result<Topology, RoutingError> {
        let resp = self
            .http
            .get(format!("{}/v1/routes", self.base_url))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(RoutingError::RegistryStatus(resp.status().as_u16()));
        }

        let payload: RoutesPayload = resp.json().await?;
        Ok(payload.into_topology())
    }
}
