//! Parley server library logic.

pub mod background;
pub mod config;
pub mod directory;
pub mod transport;

use axum::{routing::get, Extension, Json, Router};
use config::{Config, ConfigError};
use directory::ConfigDirectory;
use parley_dialback::{ConnectionManager, TimerService};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use transport::{ChannelTransport, TransportCommand};

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// S2S connection manager.
    pub manager: Arc<ConnectionManager>,
    /// Transport the manager writes through.
    pub transport: Arc<ChannelTransport>,
}

impl AppState {
    /// Wires the trust core from configuration.
    ///
    /// Returns the state and the command stream the socket layer consumes.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if a configured domain is malformed.
    pub fn from_config(
        config: &Config,
        timer: Arc<dyn TimerService>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportCommand>), ConfigError> {
        let directory = Arc::new(ConfigDirectory::from_config(&config.domains)?);
        tracing::info!(domains = ?directory.names(), "serving domains");
        let (transport, commands) = ChannelTransport::new();
        let transport = Arc::new(transport);
        let manager = Arc::new(ConnectionManager::new(
            config.s2s.to_runtime(),
            directory,
            transport.clone(),
            timer,
        ));
        Ok((Self { manager, transport }, commands))
    }
}

/// Health check handler.
///
/// Returns `200 OK` with server status, version and the number of trusted
/// domain pairs.
async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "authenticated_pairs": state.manager.registry().authenticated_pairs().len(),
        "connections": state.manager.session_count(),
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .layer(Extension(Arc::new(state)))
}
