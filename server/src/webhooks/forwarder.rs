//! Event Forwarder
//!
//! Relays an inbound bot event to the target service in the lane bound to
//! the bot. Each relay runs as a detached task on a [`TaskTracker`] so
//! shutdown can wait for in-flight relays with a bound.

use std::sync::Arc;
use std::time::Duration;

use lane_common::{headers, RouteType};
use reqwest::Method;
use serde::Serialize;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::ForwardError;
use crate::config::Config;
use crate::context::RequestContext;
use crate::lane::LaneResolver;
use crate::routing::ServiceRouter;

/// Destination of forwarded events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub service: String,
    pub path: String,
}

impl ForwardTarget {
    pub fn from_config(config: &Config) -> Self {
        Self {
            service: config.forward_target_service.clone(),
            path: config.forward_target_path.clone(),
        }
    }
}

impl Default for ForwardTarget {
    fn default() -> Self {
        Self {
            service: "lark-server".into(),
            path: "/api/internal/lark-event".into(),
        }
    }
}

#[derive(Serialize)]
struct ForwardBody<'a> {
    event_type: &'a str,
    params: &'a serde_json::Value,
}

struct ForwarderInner {
    resolver: Arc<LaneResolver>,
    router: ServiceRouter,
    secret: String,
    target: ForwardTarget,
    tracker: TaskTracker,
}

/// Fire-and-forget relay of bot events.
#[derive(Clone)]
pub struct EventForwarder {
    inner: Arc<ForwarderInner>,
}

impl EventForwarder {
    pub fn new(
        resolver: Arc<LaneResolver>,
        router: ServiceRouter,
        secret: impl Into<String>,
        target: ForwardTarget,
    ) -> Self {
        let secret = secret.into();
        if secret.is_empty() {
            warn!("INNER_HTTP_SECRET not set, forwarded events will fail auth");
        }

        Self {
            inner: Arc::new(ForwarderInner {
                resolver,
                router,
                secret,
                target,
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Relay an event in the background. Never fails; errors are logged.
    pub fn forward(&self, event_type: &str, bot_name: &str, params: serde_json::Value) {
        let this = self.clone();
        let event_type = event_type.to_string();
        let bot_name = bot_name.to_string();

        self.inner.tracker.spawn(async move {
            if let Err(e) = this.deliver(&event_type, &bot_name, &params).await {
                error!(
                    event_type = %event_type,
                    bot = %bot_name,
                    error = %e,
                    "Failed to forward event"
                );
            }
        });
    }

    /// Relay an event and wait for the response.
    ///
    /// The lane is resolved from the bot binding only; the caller's request
    /// context is never consulted.
    #[tracing::instrument(skip(self, params))]
    pub async fn deliver(
        &self,
        event_type: &str,
        bot_name: &str,
        params: &serde_json::Value,
    ) -> Result<(), ForwardError> {
        let inner = &self.inner;
        let lane = inner.resolver.resolve(RouteType::Bot, bot_name).await;
        let trace_id = Uuid::new_v4().to_string();

        info!(
            lane = lane.as_deref().unwrap_or("default"),
            trace_id = %trace_id,
            target = %inner.target.service,
            "Forwarding event"
        );

        let response = inner
            .router
            .request(
                &RequestContext::default(),
                Method::POST,
                &inner.target.service,
                &inner.target.path,
                lane.as_deref(),
            )
            .header(headers::APP_NAME, bot_name)
            .header(headers::TRACE_ID, &trace_id)
            .bearer_auth(&inner.secret)
            .json(&ForwardBody { event_type, params })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ForwardError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    /// Number of relays still running.
    pub fn in_flight(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Wait up to `timeout` for running relays. Returns `false` if some
    /// were still running when the bound elapsed.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.inner.tracker.close();
        let pending = self.inner.tracker.len();
        if pending > 0 {
            info!(pending, "Waiting for in-flight forwards");
        }

        let drained = tokio::time::timeout(timeout, self.inner.tracker.wait())
            .await
            .is_ok();
        if !drained {
            warn!(
                pending = self.inner.tracker.len(),
                timeout_secs = timeout.as_secs(),
                "Forward drain timed out"
            );
        }
        drained
    }
}
