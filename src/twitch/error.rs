use std::time::Duration;
use thiserror::Error;
use tokio_util::codec::LinesCodecError;

#[derive(Error, Debug)]
pub enum TwitchError {
    #[error("Invalid bot username {0:?}: expected 3-25 letters, digits or underscores")]
    InvalidIdentity(String),
    #[error("Invalid OAuth token: expected \"oauth:\" followed by lowercase letters, digits or underscores")]
    InvalidCredential,
    #[error("Failed to connect after {attempts} attempts")]
    ConnectRetriesExhausted { attempts: u32 },
    #[error("Channel list has no entry for bot {0}")]
    ChannelListMissingIdentity(String),
    #[error("Channel list request returned {status}: {body}")]
    ChannelListStatus { status: u16, body: String },
    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Transport connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("No welcome from server within {0:?}")]
    WelcomeTimeout(Duration),
    #[error("Authentication rejected by server: {0}")]
    AuthenticationRejected(String),
    #[error("Connection closed by server")]
    ConnectionClosed,
    #[error("Server requested a reconnect")]
    ReconnectRequested,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Line framing error: {0}")]
    Codec(#[from] LinesCodecError),
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("Actor communication error: {0}")]
    ActorComm(String),
    #[error("Shutdown requested")]
    Shutdown,
}

impl TwitchError {
    /// Errors that end a session but leave the bot free to reconnect.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TwitchError::ConnectTimeout(_)
                | TwitchError::WelcomeTimeout(_)
                | TwitchError::AuthenticationRejected(_)
                | TwitchError::ConnectionClosed
                | TwitchError::ReconnectRequested
                | TwitchError::Io(_)
                | TwitchError::Codec(_)
                | TwitchError::Tls(_)
        )
    }
}

pub type Result<T, E = TwitchError> = std::result::Result<T, E>;
