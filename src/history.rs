use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub sender: String,
    pub text: String,
}

type ChannelLog = Arc<Mutex<VecDeque<HistoryEntry>>>;

/// Bounded per-channel record of recent chat lines.
///
/// Channels are created on first touch. Each channel keeps at most
/// `capacity` entries, dropping the oldest when full.
#[derive(Debug)]
pub struct ChatHistory {
    channels: DashMap<String, ChannelLog>,
    capacity: usize,
}

impl Default for ChatHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

impl ChatHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn channel_log(&self, channel: &str) -> ChannelLog {
        if let Some(log) = self.channels.get(channel) {
            return Arc::clone(log.value());
        }
        // entry() holds the shard lock, so two first writers share one log.
        Arc::clone(self.channels.entry(channel.to_owned()).or_default().value())
    }

    pub fn append(&self, channel: &str, sender: impl Into<String>, text: impl Into<String>) {
        let log = self.channel_log(channel);
        let mut entries = log.lock();
        entries.push_back(HistoryEntry {
            sender: sender.into(),
            text: text.into(),
        });
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Newest-first copy of the channel's entries; empty for unknown channels.
    pub fn snapshot(&self, channel: &str) -> Vec<HistoryEntry> {
        let Some(log) = self.channels.get(channel).map(|log| Arc::clone(log.value())) else {
            return Vec::new();
        };
        let entries = log.lock();
        entries.iter().rev().cloned().collect()
    }

    pub fn len(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|log| Arc::clone(log.value()))
            .map_or(0, |log| log.lock().len())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
