//! Lane Resolution
//!
//! Maps routable entities (bots, chats) to the lane that should handle their
//! traffic, backed by the `lane_routing` table and a short-lived in-memory
//! cache.

pub mod resolver;
pub mod store;

pub use resolver::LaneResolver;
pub use store::{LaneBindingStore, LaneStoreError, PgLaneBindingStore};
