//! Bot Registry
//!
//! HTTP bots are loaded once at startup. Only loaded bots get webhook
//! routes; a rebind of a bot's lane does not require a reload because the
//! lane is resolved per event.

use std::collections::HashMap;

use sqlx::PgPool;
use tracing::{info, warn};

/// Bots that receive events over HTTP webhooks.
const HTTP_INIT_TYPE: &str = "http";

/// One row of `bot_config`, limited to what the proxy needs.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct BotConfig {
    pub bot_name: String,
    pub app_id: String,
    /// Token expected in inbound bodies; unchecked when empty.
    pub verification_token: Option<String>,
    pub init_type: String,
    pub is_dev: bool,
}

impl BotConfig {
    /// Whether an inbound token is acceptable for this bot.
    pub fn accepts_token(&self, token: Option<&str>) -> bool {
        match self.verification_token.as_deref().filter(|t| !t.is_empty()) {
            Some(expected) => token == Some(expected),
            None => true,
        }
    }
}

/// Webhook-enabled bots keyed by name.
#[derive(Debug, Clone, Default)]
pub struct BotRegistry {
    bots: HashMap<String, BotConfig>,
}

impl BotRegistry {
    pub fn new(bots: impl IntoIterator<Item = BotConfig>) -> Self {
        Self {
            bots: bots.into_iter().map(|b| (b.bot_name.clone(), b)).collect(),
        }
    }

    pub fn get(&self, bot_name: &str) -> Option<&BotConfig> {
        self.bots.get(bot_name)
    }

    pub fn len(&self) -> usize {
        self.bots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bots.is_empty()
    }
}

/// Keep HTTP bots, dropping dev bots in production.
pub fn select_http_bots(rows: Vec<BotConfig>, production: bool) -> Vec<BotConfig> {
    rows.into_iter()
        .filter(|b| b.init_type == HTTP_INIT_TYPE)
        .filter(|b| !production || !b.is_dev)
        .collect()
}

/// Load active HTTP bots from `bot_config`.
#[tracing::instrument(skip(pool))]
pub async fn load_http_bots(pool: &PgPool, production: bool) -> Result<BotRegistry, sqlx::Error> {
    let rows = sqlx::query_as::<_, BotConfig>(
        r"
        SELECT bot_name, app_id, verification_token, init_type, is_dev
        FROM bot_config
        WHERE is_active = true
        ",
    )
    .fetch_all(pool)
    .await?;

    let registry = BotRegistry::new(select_http_bots(rows, production));
    if registry.is_empty() {
        warn!("No HTTP bots found to register");
    } else {
        for bot in registry.bots.values() {
            info!(
                bot = %bot.bot_name,
                app_id = %bot.app_id,
                event_path = %format!("/webhook/{}/event", bot.bot_name),
                card_path = %format!("/webhook/{}/card", bot.bot_name),
                "Registered bot"
            );
        }
        info!(count = registry.len(), "HTTP bots registered");
    }
    Ok(registry)
}
