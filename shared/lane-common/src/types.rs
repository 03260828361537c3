//! Route Types

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of routable entity a lane binding applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteType {
    /// A bot, keyed by bot name.
    Bot,
    /// A chat, keyed by chat id.
    Chat,
}

impl RouteType {
    /// Value stored in the `route_type` column.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bot => "bot",
            Self::Chat => "chat",
        }
    }
}

impl fmt::Display for RouteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
