//! room-sync client entry point.
//!
//! Connects to the hub, keeps the rooms listed in `ROOM_IDS` subscribed
//! and logs every resolved store update until interrupted.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use room_sync::config::SyncConfig;
use room_sync::store::TracingStore;
use room_sync::sync::{ConnectionManager, EnvironmentTrigger};
use room_sync::transport::TokenFactory;
use room_sync::transport::ws::{WsTransportFactory, WsTransportOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = SyncConfig::from_env()?;
    tracing::info!(hub = %config.hub_url, rooms = config.room_ids.len(), "starting room-sync");

    // Token is read fresh on every dial
    let token = TokenFactory::new(|| std::env::var("ACCESS_TOKEN").unwrap_or_default());
    let factory = Arc::new(WsTransportFactory::new(WsTransportOptions::from_config(
        &config, token,
    )));
    let manager = ConnectionManager::new(&config, factory, Arc::new(TracingStore));

    let mut states = manager.subscribe_state();
    let state = manager.connect().await;
    tracing::info!(state = state.as_str(), "initial connect settled");

    // SIGHUP stands in for the network-online signal a UI would send
    #[cfg(unix)]
    let mut hangup =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

    loop {
        #[cfg(unix)]
        let resume = hangup.recv();
        #[cfg(not(unix))]
        let resume = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
            _ = resume => {
                manager.handle_trigger(EnvironmentTrigger::NetworkOnline).await;
            }
            change = states.recv() => match change {
                Ok(change) => tracing::info!(
                    state = change.state.as_str(),
                    connection_id = ?change.connection_id,
                    "connection state changed"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "state observer lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    manager.stop().await;
    Ok(())
}
