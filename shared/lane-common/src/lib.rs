//! Lane Common Library
//!
//! Lane naming rules, route types, and context header names shared by every
//! lane-aware process (HTTP services, queue producers and consumers).

pub mod headers;
pub mod lane;
pub mod types;

pub use lane::*;
pub use types::*;
