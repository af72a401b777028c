use std::sync::Arc;
use tokio::time::Instant;

use crate::history::ChatHistory;
use crate::stats;
use crate::twitch::client::BotControl;
use crate::twitch::types::ChatMessage;

const PING_COMMAND: &str = "s//ping";
const JOIN_COMMAND: &str = "s//join";
const REJOIN_COMMAND: &str = "s//rejoin";
const CORRECTION_PREFIX: &str = "s/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command<'a> {
    Ping,
    Join(&'a str),
    Rejoin,
    Correction { from: &'a str, to: &'a str },
}

impl<'a> Command<'a> {
    /// Recognizes a command by priority: ping, join, rejoin, correction.
    fn parse(body: &'a str) -> Option<Self> {
        if body.starts_with(PING_COMMAND) {
            return Some(Command::Ping);
        }
        if let Some(rest) = body.strip_prefix(JOIN_COMMAND) {
            let channel = rest.trim();
            return Some(Command::Join(channel.strip_prefix('#').unwrap_or(channel)));
        }
        if body.starts_with(REJOIN_COMMAND) {
            return Some(Command::Rejoin);
        }
        Self::parse_correction(body)
    }

    fn parse_correction(body: &'a str) -> Option<Self> {
        if !body.starts_with(CORRECTION_PREFIX) {
            return None;
        }
        let mut fields = body.split('/');
        let (_, from, to) = (fields.next()?, fields.next()?, fields.next()?);
        if fields.next().is_some() {
            return None;
        }
        let from = from.trim();
        if from.is_empty() {
            return None;
        }
        Some(Command::Correction {
            from,
            to: to.trim(),
        })
    }

    fn requires_admin(&self) -> bool {
        matches!(self, Command::Join(_) | Command::Rejoin)
    }
}

fn privmsg(channel: &str, text: &str) -> String {
    format!("PRIVMSG #{} :{}", channel, text)
}

/// Turns chat messages into replies: built-in commands, corrections against
/// recent history, or recording the message for later corrections.
pub struct CommandDispatcher {
    history: Arc<ChatHistory>,
    control: Arc<dyn BotControl>,
    admin: String,
    started_at: Instant,
}

impl CommandDispatcher {
    pub fn new(history: Arc<ChatHistory>, control: Arc<dyn BotControl>, admin: impl Into<String>) -> Self {
        Self {
            history,
            control,
            admin: admin.into(),
            started_at: Instant::now(),
        }
    }

    fn is_admin(&self, sender: &str) -> bool {
        sender.eq_ignore_ascii_case(&self.admin)
    }

    /// Returns the line to send in response, if any.
    pub async fn handle(&self, message: &ChatMessage) -> Option<String> {
        let Some(command) = Command::parse(&message.text) else {
            self.record(message);
            return None;
        };

        if command.requires_admin() && !self.is_admin(&message.sender) {
            tracing::debug!(
                channel.name = %message.channel,
                sender = %message.sender,
                "Ignoring admin command from non-admin"
            );
            return None;
        }

        match command {
            Command::Ping => Some(self.ping_reply(&message.channel).await),
            Command::Join(channel) if channel.is_empty() => None,
            Command::Join(channel) => {
                tracing::info!(channel.name = %channel, requested_by = %message.sender, "Joining channel on request");
                Some(format!("JOIN #{}", channel))
            }
            Command::Rejoin => Some(self.rejoin(&message.channel).await),
            Command::Correction { from, to } => Some(self.correct(message, from, to)),
        }
    }

    fn record(&self, message: &ChatMessage) {
        if message.is_action() {
            return;
        }
        self.history
            .append(&message.channel, message.sender.as_str(), message.text.as_str());
    }

    async fn ping_reply(&self, channel: &str) -> String {
        let uptime = stats::format_uptime(self.started_at.elapsed());
        let memory = stats::memory_summary();
        let ping = match self.control.measure_latency().await {
            Some(latency) => format!("TMI Ping: {}ms", latency.as_millis()),
            None => "TMI took too long to respond".to_string(),
        };
        privmsg(
            channel,
            &format!("🤓 {} || Uptime: {} || Memory: {}", ping, uptime, memory),
        )
    }

    async fn rejoin(&self, channel: &str) -> String {
        tracing::info!(channel.name = %channel, "Starting rejoin");
        if let Err(e) = self.control.send_line(privmsg(channel, "Starting rejoin")).await {
            tracing::warn!(error = %e, "Could not announce rejoin");
        }
        match self.control.join_channels().await {
            Ok(joined) => {
                tracing::info!(channel.name = %channel, joined, "Rejoin finished");
                privmsg(channel, "Rejoined!")
            }
            Err(e) => {
                tracing::error!(channel.name = %channel, error = %e, "Rejoin failed");
                privmsg(channel, &format!("Rejoin failed: {}", e))
            }
        }
    }

    fn correct(&self, message: &ChatMessage, from: &str, to: &str) -> String {
        let snapshot = self.history.snapshot(&message.channel);
        let Some(original) = snapshot.iter().find(|entry| entry.text.contains(from)) else {
            return privmsg(
                &message.channel,
                &format!("Couldn't find a message matching \"{}\"", from),
            );
        };

        let corrected = original.text.replacen(from, to, 1);
        let attribution = if original.sender == message.sender {
            format!("{} meant to say", message.sender)
        } else {
            format!("{} thinks @{} meant to say", message.sender, original.sender)
        };
        privmsg(&message.channel, &format!("{}: {}", attribution, corrected))
    }
}
