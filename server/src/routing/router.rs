//! Service Router
//!
//! Holds the current topology as an [`ArcSwap`] snapshot. The poll loop is
//! the only writer and replaces the whole table on each successful fetch;
//! readers load the snapshot without locking. A failed poll keeps the
//! previous table.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use lane_common::{headers, lane_host, normalize_lane};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::ServiceClient;
use super::registry::{RegistryClient, ServiceInfo, Topology};
use super::RoutingError;
use crate::context::RequestContext;

/// Default registry poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Port omitted from generated URLs.
const DEFAULT_HTTP_PORT: u16 = 80;

/// Options for [`ServiceRouter::fetch`].
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// HTTP method.
    pub method: Method,
    /// Caller headers; these win over injected context headers.
    pub headers: HeaderMap,
    /// Optional JSON body.
    pub json: Option<serde_json::Value>,
    /// Optional per-request timeout.
    pub timeout: Option<Duration>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: HeaderMap::new(),
            json: None,
            timeout: None,
        }
    }
}

struct RouterInner {
    registry: Option<RegistryClient>,
    http: reqwest::Client,
    topology: ArcSwap<Topology>,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl RouterInner {
    /// Fetch the registry once and swap in the new table on success.
    async fn refresh(&self) -> bool {
        let Some(registry) = &self.registry else {
            return false;
        };

        match registry.fetch_routes().await {
            Ok(topology) => {
                debug!(services = topology.len(), "Service topology refreshed");
                self.topology.store(Arc::new(topology));
                true
            }
            Err(RoutingError::RegistryStatus(status)) => {
                warn!(status, "Registry responded with non-success status, keeping previous topology");
                false
            }
            Err(e) => {
                warn!(error = %e, "Failed to poll registry, keeping previous topology");
                false
            }
        }
    }
}

/// Lane-aware resolver from logical service names to URLs.
///
/// Cloning is cheap; all clones share one topology table and one poll loop.
#[derive(Clone)]
pub struct ServiceRouter {
    inner: Arc<RouterInner>,
}

impl ServiceRouter {
    /// Fetch the registry once, then keep polling every `poll_interval`
    /// until [`stop`](Self::stop) is called.
    ///
    /// An unreachable registry at startup is not fatal: the router starts
    /// with an empty table and every service resolves to its production host.
    pub async fn start(registry_url: &str, poll_interval: Duration, http: reqwest::Client) -> Self {
        let poll_interval = if poll_interval.is_zero() {
            warn!(
                default_secs = DEFAULT_POLL_INTERVAL.as_secs(),
                "Zero registry poll interval, using default"
            );
            DEFAULT_POLL_INTERVAL
        } else {
            poll_interval
        };

        let router = Self {
            inner: Arc::new(RouterInner {
                registry: Some(RegistryClient::new(registry_url, http.clone())),
                http,
                topology: ArcSwap::from_pointee(Topology::new()),
                poll_interval,
                shutdown: CancellationToken::new(),
            }),
        };

        if router.inner.refresh().await {
            info!(registry = %registry_url, "Initial service topology loaded");
        }
        router.spawn_poll_loop();
        router
    }

    /// Router over a fixed table that never polls.
    pub fn with_topology(topology: Topology, http: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                registry: None,
                http,
                topology: ArcSwap::from_pointee(topology),
                poll_interval: DEFAULT_POLL_INTERVAL,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn spawn_poll_loop(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(Instant::now() + inner.poll_interval, inner.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = inner.shutdown.cancelled() => {
                        debug!("Registry polling stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        inner.refresh().await;
                    }
                }
            }
        });
    }

    /// Interval between registry polls.
    pub fn poll_interval(&self) -> Duration {
        self.inner.poll_interval
    }

    /// Poll the registry immediately, outside the regular schedule.
    pub async fn refresh(&self) -> bool {
        self.inner.refresh().await
    }

    /// Stop background polling. The last topology stays readable.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
    }

    /// Whether polling has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Current topology table.
    pub fn snapshot(&self) -> Arc<Topology> {
        self.inner.topology.load_full()
    }

    /// Current deployment info for one service.
    pub fn service(&self, name: &str) -> Option<ServiceInfo> {
        self.inner.topology.load().get(name).cloned()
    }

    /// Resolve `http://host[:port]{path}` for a service.
    ///
    /// The effective lane is `lane_override` when given, otherwise the
    /// request context lane. The lane host `{service}-{lane}` is used only
    /// when that lane is a feature lane listed for the service.
    pub fn resolve_url(
        &self,
        ctx: &RequestContext,
        service: &str,
        path: &str,
        lane_override: Option<&str>,
    ) -> String {
        let effective = lane_override.or(ctx.lane.as_deref());
        let topology = self.inner.topology.load();
        let info = topology.get(service);

        let lane = normalize_lane(effective)
            .filter(|lane| info.is_some_and(|i| i.lanes.contains(*lane)));
        let host = lane_host(service, lane);
        let port = info.map_or(0, |i| i.port);

        if port != 0 && port != DEFAULT_HTTP_PORT {
            format!("http://{host}:{port}{path}")
        } else {
            format!("http://{host}{path}")
        }
    }

    /// Resolve the base URL (no path) for a service.
    pub fn base_url(&self, ctx: &RequestContext, service: &str, lane_override: Option<&str>) -> String {
        self.resolve_url(ctx, service, "", lane_override)
    }

    /// Headers injected on an outbound call.
    ///
    /// An explicit lane override injects only the lane header; otherwise the
    /// lane, trace id and app name from the request context are injected.
    pub fn context_headers(ctx: &RequestContext, lane_override: Option<&str>) -> HeaderMap {
        let pairs = match lane_override.filter(|l| !l.is_empty()) {
            Some(lane) => vec![(headers::LANE, lane.to_string())],
            None => ctx.outbound_headers(),
        };

        let mut map = HeaderMap::with_capacity(pairs.len());
        for (name, value) in pairs {
            match HeaderValue::from_str(&value) {
                Ok(v) => {
                    map.insert(HeaderName::from_static(name), v);
                }
                Err(_) => warn!(header = name, "Skipping context header with invalid value"),
            }
        }
        map
    }

    /// Build a request to a routed service with context headers injected.
    pub fn request(
        &self,
        ctx: &RequestContext,
        method: Method,
        service: &str,
        path: &str,
        lane_override: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let url = self.resolve_url(ctx, service, path, lane_override);
        self.inner
            .http
            .request(method, url)
            .headers(Self::context_headers(ctx, lane_override))
    }

    /// Send a request to a routed service.
    #[tracing::instrument(skip(self, ctx, options), fields(method = %options.method))]
    pub async fn fetch(
        &self,
        ctx: &RequestContext,
        service: &str,
        path: &str,
        options: FetchOptions,
        lane_override: Option<&str>,
    ) -> Result<reqwest::Response, RoutingError> {
        let mut builder = self
            .request(ctx, options.method, service, path, lane_override)
            .headers(options.headers);
        if let Some(body) = &options.json {
            builder = builder.json(body);
        }
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        Ok(builder.send().await?)
    }

    /// Client bound to one service; URL and headers are recomputed per call.
    pub fn client(&self, service: &str) -> ServiceClient {
        ServiceClient::new(self.clone(), service)
    }
}
