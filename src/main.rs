use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod error;
mod history;
mod stats;
mod twitch;

use crate::commands::CommandDispatcher;
use crate::config::load_settings;
use crate::error::Result as AppResult;
use crate::history::ChatHistory;
use crate::twitch::{
    ChannelListSource, ConnectionSettings, Credentials, HttpChannelList, StaticChannelList,
    TcpTransport, TwitchBot,
};

#[tokio::main]
async fn main() -> AppResult<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_PKG_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = load_settings()?;
    tracing::info!("Configuration loaded: {:?}", settings);

    let transport = Arc::new(TcpTransport::new(
        settings.twitch.address.clone(),
        settings.twitch.tls,
    )?);
    let channel_list: Arc<dyn ChannelListSource> = if settings.twitch.channels.is_empty() {
        Arc::new(HttpChannelList::new(settings.twitch.channel_list_url.clone())?)
    } else {
        tracing::info!(
            "Using {} configured channel(s), skipping channel list lookup",
            settings.twitch.channels.len()
        );
        Arc::new(StaticChannelList::new(settings.twitch.channels.clone()))
    };
    let history = Arc::new(ChatHistory::with_capacity(
        settings.connection.history_capacity,
    ));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown signal received");
        signal_token.cancel();
    });

    let bot = TwitchBot::new(
        Credentials {
            username: settings.twitch.username.clone(),
            token: settings.twitch.token.clone(),
        },
        ConnectionSettings::from(&settings.connection),
        transport,
        channel_list,
        shutdown,
    );
    let dispatcher = CommandDispatcher::new(
        history,
        Arc::new(bot.handle()),
        settings.twitch.admin.clone(),
    );

    let handle = bot.handle();
    let result = bot.run(dispatcher).await;
    tracing::info!(
        state = ?handle.state(),
        handler_failures = handle.handler_failures(),
        "Bot exited"
    );
    result?;
    Ok(())
}
