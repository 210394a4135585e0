//! Web server module.

mod error;
mod handlers;

pub use error::*;
pub use handlers::*;

use crate::auth::{require_signature, Authenticator};
use crate::config::ServerConfig;
use crate::db::Store;
use crate::monitor::DowntimeSupervisor;
use crate::notify::NotificationSink;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub supervisor: Arc<DowntimeSupervisor>,
    pub notifier: Arc<dyn NotificationSink>,
    pub authenticator: Arc<Authenticator>,
}

/// Build the router with all routes.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    let signed = Router::new()
        .route("/heartbeat", post(handlers::handle_post_heartbeat))
        .route_layer(middleware::from_fn_with_state(
            state.authenticator.clone(),
            require_signature,
        ));

    let api = Router::new()
        .route("/status", get(handlers::handle_status))
        .route("/heartbeats", get(handlers::handle_get_heartbeats))
        .route("/downtimes", get(handlers::handle_get_downtimes))
        .merge(signed);

    let prefix = state.config.mount_prefix.clone();
    let app = if prefix.is_empty() {
        Router::new().merge(api)
    } else {
        Router::new().nest(&prefix, api)
    };

    app.route("/health", get(handlers::handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
        .with_state(state)
}

/// Web server for linkwatch.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given state.
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(
        &self,
        shutdown: F,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = router(self.state.clone());

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
