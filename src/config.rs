use crate::error::{ConfigError, Result as AppResult};
use crate::history::DEFAULT_HISTORY_CAPACITY;
use crate::twitch::ConnectionSettings;
use config::builder::{ConfigBuilder, DefaultState};
use config::{Config, Environment, File};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::time::Duration;

const DEFAULT_ADDRESS: &str = "irc.chat.twitch.tv:6697";
const DEFAULT_ADMIN: &str = "jammehcow";
const DEFAULT_CHANNEL_LIST_URL: &str =
    "https://gist.githubusercontent.com/jammehcow/cfe63f93a2a2bd89250951c0dff3906b/raw";

#[derive(Deserialize)]
pub struct TwitchConfig {
    pub username: String,
    pub token: String,
    pub address: String,
    pub tls: bool,
    pub admin: String,
    pub channel_list_url: String,
    #[serde(default, deserialize_with = "deserialize_string_or_list")]
    pub channels: Vec<String>,
}

impl fmt::Debug for TwitchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwitchConfig")
            .field("username", &self.username)
            .field("token", &"***")
            .field("address", &self.address)
            .field("tls", &self.tls)
            .field("admin", &self.admin)
            .field("channel_list_url", &self.channel_list_url)
            .field("channels", &self.channels)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub max_attempts: u32,
    pub connect_timeout_ms: u64,
    pub welcome_timeout_ms: u64,
    pub backoff_step_ms: u64,
    pub join_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub history_capacity: usize,
    pub shutdown_grace_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            connect_timeout_ms: 5_000,
            welcome_timeout_ms: 10_000,
            backoff_step_ms: 2_000,
            join_interval_ms: 340,
            probe_timeout_ms: 5_000,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            shutdown_grace_ms: 2_000,
        }
    }
}

impl From<&ConnectionConfig> for ConnectionSettings {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            welcome_timeout: Duration::from_millis(config.welcome_timeout_ms),
            backoff_step: Duration::from_millis(config.backoff_step_ms),
            join_interval: Duration::from_millis(config.join_interval_ms),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AppSettings {
    pub twitch: TwitchConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

impl AppSettings {
    fn validate(self) -> Result<Self, ConfigError> {
        if self.connection.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "connection.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.connection.history_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "connection.history_capacity must be at least 1".to_string(),
            ));
        }
        if self.twitch.channels.is_empty() && self.twitch.channel_list_url.trim().is_empty() {
            return Err(ConfigError::Missing(
                "twitch.channel_list_url or twitch.channels".to_string(),
            ));
        }
        Ok(self)
    }
}

pub fn load_settings() -> AppResult<AppSettings> {
    let builder = Config::builder()
        .add_source(
            Environment::with_prefix("SEDBOT")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("twitch.channels")
                .try_parsing(true),
        )
        .add_source(File::with_name("config").required(false));

    Ok(settings_from(builder)?)
}

fn settings_from(builder: ConfigBuilder<DefaultState>) -> Result<AppSettings, ConfigError> {
    let settings = builder
        .set_default("twitch.address", DEFAULT_ADDRESS)
        .and_then(|b| b.set_default("twitch.tls", true))
        .and_then(|b| b.set_default("twitch.admin", DEFAULT_ADMIN))
        .and_then(|b| b.set_default("twitch.channel_list_url", DEFAULT_CHANNEL_LIST_URL))
        .map_err(|e| ConfigError::Load(e.to_string()))?
        .build()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    settings
        .try_deserialize::<AppSettings>()
        .map_err(|e| ConfigError::Load(e.to_string()))?
        .validate()
}

/// Accepts either `"a,b"` or `["a", "b"]`.
fn deserialize_string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    use serde_json::Value;

    let value = Value::deserialize(deserializer)?;
    let items = match value {
        Value::String(s) => s.split(',').map(|item| item.trim().to_string()).collect(),
        Value::Array(arr) => {
            let mut items = Vec::with_capacity(arr.len());
            for item in arr {
                let Value::String(s) = item else {
                    return Err(D::Error::custom("Array must contain only strings"));
                };
                items.push(s.trim().to_string());
            }
            items
        }
        Value::Null => Vec::new(),
        _ => return Err(D::Error::custom("Expected string or array of strings")),
    };
    Ok(items.into_iter().filter(|item| !item.is_empty()).collect())
}
