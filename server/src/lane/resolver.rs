//! Lane Resolver
//!
//! TTL cache in front of a [`LaneBindingStore`]. Entries are replaced whole,
//! so readers never observe a half-written binding. An empty lookup result is
//! cached as `None` until it expires; a failed lookup is not cached.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use lane_common::RouteType;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::store::LaneBindingStore;

/// Default lifetime of a cached binding.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct CacheEntry {
    lane: Option<String>,
    expires_at: Instant,
}

/// Cached lane lookups keyed by `(route_type, route_key)`.
pub struct LaneResolver {
    store: Arc<dyn LaneBindingStore>,
    cache: DashMap<(RouteType, String), CacheEntry>,
    ttl: Duration,
}

impl LaneResolver {
    /// Create a resolver with the default 30s TTL.
    pub fn new(store: Arc<dyn LaneBindingStore>) -> Self {
        Self::with_ttl(store, DEFAULT_TTL)
    }

    /// Create a resolver with a custom TTL.
    pub fn with_ttl(store: Arc<dyn LaneBindingStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Resolve the lane bound to a bot or chat.
    ///
    /// Returns `None` when no active binding exists or when the store lookup
    /// fails. Concurrent misses for the same key each query the store.
    #[tracing::instrument(skip(self))]
    pub async fn resolve(&self, route_type: RouteType, route_key: &str) -> Option<String> {
        let key = (route_type, route_key.to_string());
        let now = Instant::now();

        if let Some(entry) = self.cache.get(&key) {
            if entry.expires_at > now {
                return entry.lane.clone();
            }
        }

        match self.store.find_active_lane(route_type, route_key).await {
            Ok(lane) => {
                debug!(lane = ?lane, "Lane binding refreshed");
                self.cache.insert(
                    key,
                    CacheEntry {
                        lane: lane.clone(),
                        expires_at: Instant::now() + self.ttl,
                    },
                );
                lane
            }
            Err(e) => {
                warn!(error = %e, "Lane binding lookup failed, routing to production");
                None
            }
        }
    }

    /// Drop a single cached binding.
    pub fn invalidate(&self, route_type: RouteType, route_key: &str) {
        self.cache.remove(&(route_type, route_key.to_string()));
    }

    /// Drop every cached binding.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}
