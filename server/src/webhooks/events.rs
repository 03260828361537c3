//! Inbound Event Payloads

use serde_json::{Map, Value};

/// Event types relayed to the target service.
pub const REGISTERED_EVENT_TYPES: &[&str] = &[
    "im.message.receive_v1",
    "im.message.recalled_v1",
    "im.chat.member.user.added_v1",
    "im.chat.member.user.deleted_v1",
    "im.chat.member.user.withdrawn_v1",
    "im.chat.member.bot.added_v1",
    "im.chat.member.bot.deleted_v1",
    "im.message.reaction.created_v1",
    "im.message.reaction.deleted_v1",
    "im.chat.access_event.bot_p2p_chat_entered_v1",
    "im.chat.updated_v1",
];

/// Event type used for card action callbacks.
pub const CARD_ACTION_EVENT: &str = "card.action.trigger";

/// Event type used when the payload carries none.
pub const UNKNOWN_EVENT: &str = "unknown";

/// Whether an event type is relayed.
pub fn is_forwardable(event_type: &str) -> bool {
    event_type == CARD_ACTION_EVENT || REGISTERED_EVENT_TYPES.contains(&event_type)
}

/// A parsed webhook body.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// URL verification handshake; answered with the challenge.
    Challenge {
        challenge: String,
        token: Option<String>,
    },
    /// A payload to relay.
    Payload {
        event_type: String,
        token: Option<String>,
        params: Value,
    },
}

impl Inbound {
    /// Parse an event callback body.
    pub fn event(body: Value) -> Self {
        if let Some(challenge) = challenge(&body) {
            return challenge;
        }

        let token = token(&body);
        let params = flatten_envelope(body);
        let event_type = params
            .get("event_type")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .unwrap_or(UNKNOWN_EVENT)
            .to_string();

        Self::Payload {
            event_type,
            token,
            params,
        }
    }

    /// Parse a card action callback body. The body is relayed as-is.
    pub fn card(body: Value) -> Self {
        if let Some(challenge) = challenge(&body) {
            return challenge;
        }

        Self::Payload {
            event_type: CARD_ACTION_EVENT.to_string(),
            token: token(&body),
            params: body,
        }
    }

    /// Verification token carried by the body, if any.
    pub fn token(&self) -> Option<&str> {
        match self {
            Self::Challenge { token, .. } | Self::Payload { token, .. } => token.as_deref(),
        }
    }
}

fn challenge(body: &Value) -> Option<Inbound> {
    if body.get("type").and_then(Value::as_str) != Some("url_verification") {
        return None;
    }
    let challenge = body.get("challenge").and_then(Value::as_str)?;
    Some(Inbound::Challenge {
        challenge: challenge.to_string(),
        token: token(body),
    })
}

fn token(body: &Value) -> Option<String> {
    body.pointer("/header/token")
        .or_else(|| body.get("token"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Merge a `{header, event}` envelope into one flat object, header first.
/// Other bodies pass through unchanged.
fn flatten_envelope(body: Value) -> Value {
    let mut map = match body {
        Value::Object(map) => map,
        other => return other,
    };

    match (map.remove("header"), map.remove("event")) {
        (Some(Value::Object(header)), Some(Value::Object(event))) => {
            let mut flat = Map::with_capacity(header.len() + event.len());
            flat.extend(header);
            flat.extend(event);
            Value::Object(flat)
        }
        (header, event) => {
            if let Some(header) = header {
                map.insert("header".into(), header);
            }
            if let Some(event) = event {
                map.insert("event".into(), event);
            }
            Value::Object(map)
        }
    }
}
