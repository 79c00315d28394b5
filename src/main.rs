//! Chat Relay - generative replies for chat channels
//!
//! Relays user messages posted to a chat channel to a generative model and
//! posts the model's replies back into the same channel, marked as generated.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod binding;
mod config;
mod conversation;
mod core;
mod media;
mod providers;
mod routes;
mod session;
mod transport;

#[cfg(test)]
mod testing;

use binding::{ChannelBinding, ConfigStore};
use config::{ChannelsConfig, Config};
use core::RelayRegistry;
use providers::ProviderConnector;
use transport::{ChatTransport, InMemoryTransport, WebhookTransport};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub relays: Arc<RelayRegistry>,
    /// Present when messages are kept in process
    pub history: Option<Arc<InMemoryTransport>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let channels = match &config.channels_file {
        Some(path) => {
            let channels = ChannelsConfig::from_file(path)?;
            tracing::info!(
                path = %path.display(),
                channels = channels.channels.len(),
                "Loaded channel configuration"
            );
            channels
        }
        None => ChannelsConfig::default(),
    };
    let configs = Arc::new(ConfigStore::from_config(channels));

    let (transport, history): (Arc<dyn ChatTransport>, _) = match &config.webhook_url {
        Some(url) => {
            tracing::info!(url = %url, "Relaying replies to webhook");
            let client = reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
                .build()?;
            (Arc::new(WebhookTransport::new(client, url.clone())), None)
        }
        None => {
            let memory = Arc::new(InMemoryTransport::new());
            (memory.clone(), Some(memory))
        }
    };

    let connector = Arc::new(ProviderConnector::new(config.clone())?);
    let binding = Arc::new(ChannelBinding::new(configs, transport));
    let relays = Arc::new(RelayRegistry::new(binding, connector));

    let state = AppState {
        relays: relays.clone(),
        history,
    };

    let app = Router::new()
        .merge(routes::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!("Chat relay running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    relays.close_all().await;
    tracing::info!("All relays stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
