use std::time::Duration;

/// Lifecycle of the single chat connection, published on a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting {
        attempt: u32,
    },
    Authenticating {
        attempt: u32,
    },
    Ready,
    Backoff {
        failed_attempt: u32,
        retry_in: Duration,
    },
    Failed {
        reason: String,
    },
}

/// An owned chat message, materialized from a parsed PRIVMSG so it can be
/// handed to a handler task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub channel: String,
    pub sender: String,
    pub text: String,
}

impl ChatMessage {
    pub fn new(channel: impl Into<String>, sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            sender: sender.into(),
            text: text.into(),
        }
    }

    pub fn is_action(&self) -> bool {
        super::irc_parser::is_action_body(&self.text)
    }
}
