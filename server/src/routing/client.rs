//! Per-Service Client
//!
//! Long-lived handle bound to one logical service. Nothing is fixed at
//! creation: every request re-resolves the base URL against the current
//! topology and re-reads the request context.

use std::time::Duration;

use reqwest::{Method, RequestBuilder};

use super::router::ServiceRouter;
use crate::context::RequestContext;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client bound to one logical service.
#[derive(Clone)]
pub struct ServiceClient {
    router: ServiceRouter,
    service: String,
    timeout: Duration,
}

impl ServiceClient {
    pub(crate) fn new(router: ServiceRouter, service: &str) -> Self {
        Self {
            router,
            service: service.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the per-request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Logical service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Base URL for the given request context.
    pub fn base_url(&self, ctx: &RequestContext) -> String {
        self.router.base_url(ctx, &self.service, None)
    }

    /// Build a request with context headers injected.
    pub fn request(&self, ctx: &RequestContext, method: Method, path: &str) -> RequestBuilder {
        self.router
            .request(ctx, method, &self.service, path, None)
            .timeout(self.timeout)
    }

    /// Build a GET request.
    pub fn get(&self, ctx: &RequestContext, path: &str) -> RequestBuilder {
        self.request(ctx, Method::GET, path)
    }

    /// Build a POST request.
    pub fn post(&self, ctx: &RequestContext, path: &str) -> RequestBuilder {
        self.request(ctx, Method::POST, path)
    }
}
