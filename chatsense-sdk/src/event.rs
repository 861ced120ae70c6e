//! Wire events read from the chat stream and the payloads handed to consumers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Sentiment label attached to every analysed chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    /// All labels, in display order.
    pub const ALL: [Sentiment; 3] = [Sentiment::Positive, Sentiment::Neutral, Sentiment::Negative];

    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Neutral => "neutral",
            Sentiment::Negative => "negative",
        }
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sentiment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Sentiment::ALL
            .into_iter()
            .find(|label| label.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown sentiment '{s}'"))
    }
}

/// A chat message after the backend has run sentiment analysis on it.
///
/// `username`, `message` and `sentiment` are required; anything else the
/// backend attaches (confidence, badges, colours) is kept in `extra` so it
/// can be displayed without the SDK knowing about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSentimentEvent {
    pub username: String,
    pub message: String,
    pub sentiment: Sentiment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChatSentimentEvent {
    pub fn new(username: &str, message: &str, sentiment: Sentiment) -> Self {
        Self {
            username: username.to_string(),
            message: message.to_string(),
            sentiment,
            confidence: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Key used to recognise a message that was already counted.
    ///
    /// Two identical messages from the same user collapse into one.
    pub fn dedup_key(&self) -> String {
        format!("{}\u{1f}{}", self.username, self.message)
    }
}

/// Events the backend pushes over the chat stream, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundEvent {
    /// The backend accepted the subscription.
    Connection {
        #[serde(default)]
        channel: Option<String>,
    },

    /// Keepalive from the backend. Never forwarded.
    Heartbeat {
        #[serde(default)]
        timestamp: Option<String>,
    },

    /// Reply to a client ping (WebSocket transport only).
    Pong {
        #[serde(default)]
        timestamp: Option<String>,
    },

    /// The backend stopped reading chat for this channel.
    Disconnect {
        #[serde(default)]
        channel: Option<String>,
    },

    /// An analysed chat message.
    Message { data: ChatSentimentEvent },
}

impl InboundEvent {
    /// Decode one JSON frame from the stream.
    pub fn parse(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::Connection { .. } => "connection",
            InboundEvent::Heartbeat { .. } => "heartbeat",
            InboundEvent::Pong { .. } => "pong",
            InboundEvent::Disconnect { .. } => "disconnect",
            InboundEvent::Message { .. } => "message",
        }
    }
}
