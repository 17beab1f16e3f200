use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use peercoord::auth::AllowAll;
use peercoord::config::ServerConfig;
use peercoord::coordinator::Coordinator;
use peercoord::gateway::{self, GatewayState};
use peercoord::pubsub::{LocalPubsub, Pubsub};
use peercoord::store::{SqliteStore, Store};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();
    let filter = EnvFilter::from_default_env().add_directive("peercoord=info".parse()?);
    if config.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let self_id = Uuid::new_v4();
    tracing::info!(self_id = %self_id, listen_addr = %config.listen_addr, "starting peer coordinator");

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&config.store_path)?);
    let pubsub: Arc<dyn Pubsub> = LocalPubsub::new();
    let coordinator = Arc::new(Coordinator::with_config(
        self_id,
        store,
        pubsub,
        config.heartbeat_period(),
        config.missed_heartbeats,
        config.cleanup_interval(),
    ));

    let state = GatewayState {
        coordinator: coordinator.clone(),
        authorizer: Arc::new(AllowAll),
    };
    let router = gateway::router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "gateway listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "gateway server error");
        }
    });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
    }

    // Stop accepting new connections; existing ones are dropped with the
    // process. Draining every open `ConnIo` gracefully would require the
    // gateway to track and close them individually, which isn't worth the
    // complexity for a process that's about to exit anyway.
    server.abort();
    let _ = server.await;
    tracing::info!("shutdown complete");
    Ok(())
}
