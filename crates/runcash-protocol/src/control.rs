use serde::{Deserialize, Serialize};

/// Client → Server control message, keyed by game name.
///
/// Wire: `{ "type": "join", "gameName": "Lightning" }`. Older viewers send
/// `subscribe_to_roleta` / `unsubscribe_from_roleta` with `roleta_nome`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    #[serde(alias = "subscribe", alias = "subscribe_to_roleta")]
    Join {
        #[serde(rename = "gameName", alias = "game_name", alias = "roleta_nome")]
        game_name: String,
    },
    #[serde(alias = "unsubscribe", alias = "unsubscribe_from_roleta")]
    Leave {
        #[serde(rename = "gameName", alias = "game_name", alias = "roleta_nome")]
        game_name: String,
    },
    /// Keepalive from the viewer; never answered.
    Ping,
}

impl ControlFrame {
    pub fn join(game_name: impl Into<String>) -> Self {
        ControlFrame::Join {
            game_name: game_name.into(),
        }
    }

    pub fn leave(game_name: impl Into<String>) -> Self {
        ControlFrame::Leave {
            game_name: game_name.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
