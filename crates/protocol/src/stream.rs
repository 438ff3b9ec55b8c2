//! Messages carried on the notification stream.
//!
//! Each message travels as one server-sent event whose `data` field is the
//! message text, for example `data: sync\n\n`.

use std::fmt;

/// A notification stream message.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum StreamMessage {
    /// Sent once when the stream opens.
    Connected,
    /// Liveness heartbeat.
    Ping,
    /// Wake-up: the receiver should pull.
    Sync,
    /// Any other payload, forwarded untouched.
    Other(String),
}

impl StreamMessage {
    /// The text sent in the event's `data` field.
    pub fn as_str(&self) -> &str {
        match self {
            StreamMessage::Connected => "connected",
            StreamMessage::Ping => "ping",
            StreamMessage::Sync => "sync",
            StreamMessage::Other(s) => s,
        }
    }

    /// Only `sync` asks the receiver to re-pull; control messages never do.
    pub fn triggers_pull(&self) -> bool {
        matches!(self, StreamMessage::Sync)
    }
}

impl Default for StreamMessage {
    fn default() -> Self {
        StreamMessage::Sync
    }
}

impl From<&str> for StreamMessage {
    fn from(data: &str) -> Self {
        match data {
            "connected" => StreamMessage::Connected,
            "ping" => StreamMessage::Ping,
            "sync" => StreamMessage::Sync,
            other => StreamMessage::Other(other.to_string()),
        }
    }
}

impl fmt::Display for StreamMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
