//! linkwatch - heartbeat-based link monitoring.
//!
//! Accepts signed heartbeats from a network appliance, records them, and
//! opens, confirms, and closes downtime windows when they stop arriving.

mod auth;
mod config;
mod db;
mod monitor;
mod notify;
mod web;

use auth::Authenticator;
use config::ServerConfig;
use db::Store;
use monitor::{DowntimeSupervisor, SupervisorSettings};
use notify::{NotificationSink, WebhookNotifier};
use web::{AppState, Server};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("linkwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting linkwatch on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    if let Err(reason) = cfg.validate_secret() {
        tracing::error!(
            "{}; signed writes will be refused until this is fixed",
            reason
        );
    }

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let webhook = WebhookNotifier::new(cfg.webhook_url.clone());
    if !webhook.is_enabled() {
        tracing::info!("No webhook configured, notifications are disabled");
    }
    let notifier: Arc<dyn NotificationSink> = Arc::new(webhook);

    // Start downtime supervisor
    let supervisor = Arc::new(DowntimeSupervisor::new(
        store.clone(),
        notifier.clone(),
        SupervisorSettings::from_config(&cfg),
    ));
    let supervisor_task = supervisor.start();

    let authenticator = Arc::new(Authenticator::new(
        cfg.api_secret.clone(),
        &cfg.mount_prefix,
        cfg.nonce_cache_capacity,
    ));

    // Start web server
    let server = Server::new(AppState {
        config: cfg,
        store,
        supervisor: supervisor.clone(),
        notifier,
        authenticator,
    });
    server.start(shutdown_signal()).await?;

    supervisor.stop();
    if let Some(task) = supervisor_task {
        let _ = task.await;
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
