//! Webhook HTTP Handlers
//!
//! Both endpoints answer `{}` as soon as the body is accepted; forwarding
//! happens in the background.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::events::{is_forwardable, Inbound};
use crate::api::AppState;

/// Errors returned to the webhook caller.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// No HTTP bot with this name was loaded.
    #[error("Unknown bot: {0}")]
    UnknownBot(String),

    /// Verification token missing or wrong.
    #[error("Invalid verification token")]
    InvalidToken,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::UnknownBot(_) => (StatusCode::NOT_FOUND, "UNKNOWN_BOT"),
            Self::InvalidToken => (StatusCode::UNAUTHORIZED, "INVALID_TOKEN"),
        };
        (status, Json(json!({ "error": code, "message": self.to_string() }))).into_response()
    }
}

/// `POST /webhook/{bot_name}/event`
pub async fn receive_event(
    State(state): State<AppState>,
    Path(bot_name): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, WebhookError> {
    accept(&state, &bot_name, Inbound::event(body))
}

/// `POST /webhook/{bot_name}/card`
pub async fn receive_card(
    State(state): State<AppState>,
    Path(bot_name): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, WebhookError> {
    accept(&state, &bot_name, Inbound::card(body))
}

fn accept(state: &AppState, bot_name: &str, inbound: Inbound) -> Result<Json<Value>, WebhookError> {
    let bot = state
        .bots
        .get(bot_name)
        .ok_or_else(|| WebhookError::UnknownBot(bot_name.to_string()))?;

    if !bot.accepts_token(inbound.token()) {
        warn!(bot = %bot_name, "Rejected webhook with invalid verification token");
        return Err(WebhookError::InvalidToken);
    }

    match inbound {
        Inbound::Challenge { challenge, .. } => {
            info!(bot = %bot_name, "Answered URL verification challenge");
            Ok(Json(json!({ "challenge": challenge })))
        }
        Inbound::Payload {
            event_type, params, ..
        } => {
            if is_forwardable(&event_type) {
                info!(bot = %bot_name, event_type = %event_type, "Received event");
                state.forwarder.forward(&event_type, bot_name, params);
            } else {
                debug!(bot = %bot_name, event_type = %event_type, "Dropping unregistered event type");
            }
            Ok(Json(json!({})))
        }
    }
}
