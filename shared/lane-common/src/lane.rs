//! Lane Naming
//!
//! A lane-scoped name is always derived from a base name and the effective
//! lane by suffixing. Production (the `prod` sentinel, an empty string, or no
//! lane at all) always maps to the bare base name.

/// Sentinel lane name for the production environment.
pub const PROD_LANE: &str = "prod";

/// Normalize a lane value: `None`, `""` and `"prod"` all mean production.
///
/// ```
/// use lane_common::normalize_lane;
///
/// assert_eq!(normalize_lane(Some("feat-x")), Some("feat-x"));
/// assert_eq!(normalize_lane(Some("prod")), None);
/// assert_eq!(normalize_lane(Some("")), None);
/// assert_eq!(normalize_lane(None), None);
/// ```
#[must_use]
pub fn normalize_lane(lane: Option<&str>) -> Option<&str> {
    match lane {
        Some(l) if !l.is_empty() && l != PROD_LANE => Some(l),
        _ => None,
    }
}

/// Whether the lane names a non-production environment.
#[must_use]
pub fn is_feature_lane(lane: Option<&str>) -> bool {
    normalize_lane(lane).is_some()
}

/// Lane-scoped queue name: `base` or `base_{lane}`.
#[must_use]
pub fn lane_queue(base: &str, lane: Option<&str>) -> String {
    match normalize_lane(lane) {
        Some(l) => format!("{base}_{l}"),
        None => base.to_string(),
    }
}

/// Lane-scoped routing key: `base` or `base.{lane}`.
#[must_use]
pub fn lane_routing_key(base: &str, lane: Option<&str>) -> String {
    match normalize_lane(lane) {
        Some(l) => format!("{base}.{l}"),
        None => base.to_string(),
    }
}

/// Lane-scoped host name: `service` or `service-{lane}`.
///
/// Callers decide whether the lane is actually deployed for the service;
/// this only applies the suffix rule.
#[must_use]
pub fn lane_host(service: &str, lane: Option<&str>) -> String {
    match normalize_lane(lane) {
        Some(l) => format!("{service}-{l}"),
        None => service.to_string(),
    }
}
