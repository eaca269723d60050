//! HTTP API server for the cadence gateway

pub mod health;
pub mod websocket;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use axum::Router;
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use crate::session::{SessionOptions, SessionServices};
use crate::{Config, Result};

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub services: SessionServices,
    pub config: Arc<Config>,
    /// Number of open duplex connections
    pub sessions: Arc<AtomicUsize>,
    pub started_at: DateTime<Utc>,
}

impl ApiState {
    #[must_use]
    pub fn new(services: SessionServices, config: Config) -> Self {
        Self {
            services,
            config: Arc::new(config),
            sessions: Arc::new(AtomicUsize::new(0)),
            started_at: Utc::now(),
        }
    }

    /// Options for a newly connected session
    #[must_use]
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions::from_config(&self.config)
    }
}

/// Configuration for building an API server
pub struct ApiServerBuilder {
    services: SessionServices,
    config: Config,
}

impl ApiServerBuilder {
    /// Create a new API server builder
    #[must_use]
    pub fn new(services: SessionServices, config: Config) -> Self {
        Self { services, config }
    }

    /// Set the port to listen on
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.server.port = port;
        self
    }

    /// Set the static files directory
    #[must_use]
    pub fn static_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.config.server.static_dir = dir;
        self
    }

    /// Build the API server
    #[must_use]
    pub fn build(self) -> ApiServer {
        let host = self.config.server.host.clone();
        let port = self.config.server.port;
        let static_dir = self.config.server.static_dir.clone();

        ApiServer {
            state: Arc::new(ApiState::new(self.services, self.config)),
            host,
            port,
            static_dir,
        }
    }
}

/// HTTP API server
pub struct ApiServer {
    state: Arc<ApiState>,
    host: String,
    port: u16,
    static_dir: Option<PathBuf>,
}

impl ApiServer {
    /// Shared handler state
    #[must_use]
    pub fn state(&self) -> Arc<ApiState> {
        Arc::clone(&self.state)
    }

    /// Build the router with all routes
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .merge(websocket::router(self.state.clone()))
            .merge(health::router())
            .merge(health::ready_router(self.state.clone()));

        // Serve static files if configured
        if let Some(static_dir) = &self.static_dir {
            let index_file = static_dir.join("index.html");
            let serve_dir =
                ServeDir::new(static_dir).fallback(ServeFile::new(&index_file));

            router = router.fallback_service(serve_dir);
            tracing::info!(path = %static_dir.display(), "serving static files");
        }

        // CORS layer for cross-origin requests from the web client
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        router.layer(cors).layer(TraceLayer::new_for_http())
    }

    /// Run the API server
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(addr = %addr, "API server listening");

        axum::serve(listener, self.router())
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}
