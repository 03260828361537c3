//! Lane Binding Store
//!
//! Point lookups against the authoritative lane binding table.
//! Uses runtime queries (`sqlx::query_as`) to avoid requiring a live
//! database at compile time.

use async_trait::async_trait;
use lane_common::RouteType;
use sqlx::PgPool;
use thiserror::Error;

/// Errors raised by a lane binding lookup.
#[derive(Debug, Error)]
pub enum LaneStoreError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Store could not be reached for a non-database reason.
    #[error("Lane store unavailable: {0}")]
    Unavailable(String),
}

/// Read surface of the lane binding store.
#[async_trait]
pub trait LaneBindingStore: Send + Sync {
    /// Return the lane of the active binding for `(route_type, route_key)`,
    /// or `None` when there is no active binding.
    async fn find_active_lane(
        &self,
        route_type: RouteType,
        route_key: &str,
    ) -> Result<Option<String>, LaneStoreError>;
}

/// `PostgreSQL`-backed lane binding store.
#[derive(Clone)]
pub struct PgLaneBindingStore {
    pool: PgPool,
}

impl PgLaneBindingStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LaneBindingStore for PgLaneBindingStore {
    async fn find_active_lane(
        &self,
        route_type: RouteType,
        route_key: &str,
    ) -> Result<Option<String>, LaneStoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            r"
            SELECT lane_name
            FROM lane_routing
            WHERE route_type = $1 AND route_key = $2 AND is_active = true
            LIMIT 1
            ",
        )
        .bind(route_type.as_str())
        .bind(route_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(lane,)| lane))
    }
}
