pub mod channel_list;
pub mod client;
pub mod connection;
pub mod error;
pub mod irc_parser;
pub mod transport;
pub mod types;

pub use channel_list::{ChannelListSource, HttpChannelList, StaticChannelList};
pub use connection::{ConnectionSettings, Credentials, TwitchBot};
pub use error::TwitchError;
pub use transport::TcpTransport;
