//! Request Context
//!
//! Request-scoped values (lane, trace id, caller identity) read from inbound
//! headers and passed explicitly to everything that needs them.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use lane_common::{headers, normalize_lane};
use uuid::Uuid;

/// Ambient values for one logical request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Lane the request belongs to (`None` = production).
    pub lane: Option<String>,
    /// Trace identifier.
    pub trace_id: Option<String>,
    /// Calling application (bot) name.
    pub app_name: Option<String>,
}

impl RequestContext {
    /// Context with only a lane set.
    #[must_use]
    pub fn with_lane(lane: impl Into<String>) -> Self {
        Self {
            lane: Some(lane.into()),
            ..Self::default()
        }
    }

    /// Build a context from inbound headers.
    ///
    /// A missing trace id is generated so every hop after this one carries
    /// the same identifier.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        Self {
            lane: read(headers::LANE).filter(|l| normalize_lane(Some(l)).is_some()),
            trace_id: read(headers::TRACE_ID).or_else(|| Some(Uuid::new_v4().to_string())),
            app_name: read(headers::APP_NAME),
        }
    }

    /// Headers to inject on an outbound call made on behalf of this request.
    #[must_use]
    pub fn outbound_headers(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::with_capacity(3);
        if let Some(lane) = &self.lane {
            out.push((headers::LANE, lane.clone()));
        }
        if let Some(trace_id) = &self.trace_id {
            out.push((headers::TRACE_ID, trace_id.clone()));
        }
        if let Some(app_name) = &self.app_name {
            out.push((headers::APP_NAME, app_name.clone()));
        }
        out
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers))
    }
}
