use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use super::error::{Result as TwitchResult, TwitchError};

/// Resolves the channels a bot account should sit in.
#[async_trait]
pub trait ChannelListSource: Send + Sync {
    async fn lookup(&self, identity: &str) -> TwitchResult<Vec<String>>;
}

#[derive(Deserialize, Debug)]
struct ChannelListResponse {
    #[serde(default, alias = "Bots")]
    bots: Vec<BotEntry>,
}

#[derive(Deserialize, Debug)]
struct BotEntry {
    #[serde(alias = "Username")]
    username: String,
    #[serde(default, alias = "Channels")]
    channels: Vec<String>,
}

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Channel list published as a JSON document over HTTP:
/// `{"bots": [{"username": "...", "channels": ["..."]}]}`.
pub struct HttpChannelList {
    client: reqwest::Client,
    url: String,
}

impl HttpChannelList {
    pub fn new(url: impl Into<String>) -> TwitchResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(TwitchError::Reqwest)?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ChannelListSource for HttpChannelList {
    async fn lookup(&self, identity: &str) -> TwitchResult<Vec<String>> {
        tracing::info!("[CHANNEL_LIST] Fetching channel list from {}", self.url);
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(TwitchError::Reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error body".to_string());
            tracing::error!("[CHANNEL_LIST] Fetch failed (HTTP {}): {}", status, body);
            return Err(TwitchError::ChannelListStatus {
                status: status.as_u16(),
                body,
            });
        }

        let list = response
            .json::<ChannelListResponse>()
            .await
            .map_err(TwitchError::Reqwest)?;
        channels_for(list, identity)
    }
}

/// Fixed channel list taken from configuration.
#[derive(Debug, Clone)]
pub struct StaticChannelList {
    channels: Vec<String>,
}

impl StaticChannelList {
    pub fn new(channels: Vec<String>) -> Self {
        Self { channels }
    }
}

#[async_trait]
impl ChannelListSource for StaticChannelList {
    async fn lookup(&self, _identity: &str) -> TwitchResult<Vec<String>> {
        Ok(normalize(self.channels.iter().map(String::as_str)))
    }
}

fn channels_for(list: ChannelListResponse, identity: &str) -> TwitchResult<Vec<String>> {
    let entry = list
        .bots
        .into_iter()
        .find(|bot| bot.username.eq_ignore_ascii_case(identity))
        .ok_or_else(|| TwitchError::ChannelListMissingIdentity(identity.to_string()))?;
    let channels = normalize(entry.channels.iter().map(String::as_str));
    tracing::info!(
        "[CHANNEL_LIST] {} channel(s) listed for {}",
        channels.len(),
        identity
    );
    Ok(channels)
}

/// Strips `#`, drops blanks and duplicates, keeps first-seen order.
fn normalize<'a>(channels: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    channels
        .map(|c| c.trim().trim_start_matches('#'))
        .filter(|c| !c.is_empty())
        .filter(|c| seen.insert(c.to_ascii_lowercase()))
        .map(str::to_string)
        .collect()
}
