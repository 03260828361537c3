//! Lane Proxy Server
//!
//! Lane-aware routing and messaging core: resolves which deployment lane owns
//! a bot or chat, routes outbound calls to lane-specific service hosts, runs a
//! lane-scoped AMQP topology, and relays bot webhooks to the owning lane.

pub mod api;
pub mod broker;
pub mod config;
pub mod context;
pub mod db;
pub mod lane;
pub mod routing;
pub mod webhooks;
