//! Context header names carried between lane-aware services.
//!
//! Header names are case-insensitive on the wire; these are the canonical
//! lowercase spellings.

/// Lane the request belongs to.
pub const LANE: &str = "x-lane";

/// Trace identifier propagated across hops.
pub const TRACE_ID: &str = "x-trace-id";

/// Calling application (bot) name.
pub const APP_NAME: &str = "x-app-name";
