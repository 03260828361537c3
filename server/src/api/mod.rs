//! API Router and Application State
//!
//! Central routing configuration and shared state.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use lane_common::RouteType;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::{
    config::Config,
    context::RequestContext,
    lane::LaneResolver,
    routing::{ServiceInfo, ServiceRouter, Topology},
    webhooks::{self, BotRegistry, EventForwarder},
};

/// Service name reported by the health endpoint.
const SERVICE_NAME: &str = "lark-proxy";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration
    pub config: Arc<Config>,
    /// Lane-aware service router
    pub router: ServiceRouter,
    /// Lane binding resolver
    pub resolver: Arc<LaneResolver>,
    /// Outbound event relay
    pub forwarder: EventForwarder,
    /// Bots with webhook routes
    pub bots: Arc<BotRegistry>,
}

impl AppState {
    /// Create new application state.
    #[must_use]
    pub fn new(
        config: Config,
        router: ServiceRouter,
        resolver: Arc<LaneResolver>,
        forwarder: EventForwarder,
        bots: BotRegistry,
    ) -> Self {
        Self {
            config: Arc::new(config),
            router,
            resolver,
            forwarder,
            bots: Arc::new(bots),
        }
    }
}

/// Create the main application router.
pub fn create_router(state: AppState) -> Router {
    let internal_routes = Router::new()
        .route("/routes", get(list_routes))
        .route("/routes/{service}", get(resolve_route))
        .route("/lanes", delete(clear_lane_cache))
        .route("/lanes/{route_type}/{route_key}", delete(invalidate_lane));

    Router::new()
        // Health check
        .route("/api/health", get(health_check))
        // Routing diagnostics
        .nest("/api/internal", internal_routes)
        // Bot callbacks
        .route("/webhook/{bot_name}/event", post(webhooks::handlers::receive_event))
        .route("/webhook/{bot_name}/card", post(webhooks::handlers::receive_card))
        // Middleware
        .layer(TraceLayer::new_for_http())
        // State
        .with_state(state)
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service name
    pub service: String,
    /// Build identifier
    pub version: String,
    /// Response time (RFC 3339)
    pub timestamp: String,
}

/// Health check endpoint.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        service: SERVICE_NAME.into(),
        version: state.config.version.clone(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// Query for [`resolve_route`].
#[derive(Debug, Deserialize)]
pub struct RouteQuery {
    /// Path appended to the resolved base URL.
    #[serde(default)]
    pub path: String,
    /// Lane override; the request's `x-lane` header is used otherwise.
    pub lane: Option<String>,
}

/// Resolved route for one service.
#[derive(Debug, Serialize, Deserialize)]
pub struct RouteResponse {
    pub service: String,
    pub url: String,
    /// Lane requested by the caller, if any.
    pub lane: Option<String>,
    /// Current registry entry for the service.
    pub info: Option<ServiceInfo>,
}

/// `GET /api/internal/routes/{service}`
async fn resolve_route(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(service): Path<String>,
    Query(query): Query<RouteQuery>,
) -> Json<RouteResponse> {
    let lane_override = query.lane.as_deref().filter(|l| !l.is_empty());
    let url = state
        .router
        .resolve_url(&ctx, &service, &query.path, lane_override);

    Json(RouteResponse {
        lane: lane_override.map(str::to_string).or_else(|| ctx.lane.clone()),
        info: state.router.service(&service),
        service,
        url,
    })
}

/// `GET /api/internal/routes`
async fn list_routes(State(state): State<AppState>) -> Json<Topology> {
    Json(state.router.snapshot().as_ref().clone())
}

/// `DELETE /api/internal/lanes/{route_type}/{route_key}`
///
/// Drops one cached binding after it was rebound.
async fn invalidate_lane(
    State(state): State<AppState>,
    Path((route_type, route_key)): Path<(RouteType, String)>,
) -> StatusCode {
    state.resolver.invalidate(route_type, &route_key);
    tracing::info!(%route_type, route_key = %route_key, "Lane binding invalidated");
    StatusCode::NO_CONTENT
}

/// `DELETE /api/internal/lanes`
async fn clear_lane_cache(State(state): State<AppState>) -> StatusCode {
    state.resolver.clear_cache();
    tracing::info!("Lane binding cache cleared");
    StatusCode::NO_CONTENT
}
