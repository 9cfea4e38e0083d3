// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Command server
//!
//! Exposes the engine over a single JSON endpoint.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check with pool counters
//! - `POST /movies` - Command endpoint, body `{"q": {"type": ..., "data": ...}}`
//!
//! # Example
//!
//! ```no_run
//! use mediafetch::config::Config;
//! use mediafetch::download::DownloadManager;
//! use mediafetch::server::Server;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load(None)?;
//! let manager = DownloadManager::from_config(config.clone())?;
//! Server::new(manager).with_listen(config.listen).start().await?;
//! # Ok(())
//! # }
//! ```

use axum::{
    extract::{DefaultBodyLimit, State},
    response::Json,
    routing::{get, post},
    Router,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;

use crate::download::DownloadManager;
use crate::service::{Response, Service};

// Maximum request body size (1MB)
const MAX_BODY_SIZE: usize = 1024 * 1024;
// Listing and OAuth calls can retry for a while
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Command server.
pub struct Server {
    manager: DownloadManager,
    listen: String,
}

impl Server {
    /// Create a server bound to 127.0.0.1:8080 by default.
    pub fn new(manager: DownloadManager) -> Self {
        Self {
            manager,
            listen: "127.0.0.1:8080".to_string(),
        }
    }

    /// Set the listen address.
    pub fn with_listen(mut self, listen: impl Into<String>) -> Self {
        self.listen = listen.into();
        self
    }

    pub fn listen(&self) -> &str {
        &self.listen
    }

    /// Build the router with all routes.
    pub fn build_router(&self) -> Router {
        router(Service::new(self.manager.clone()))
    }

    /// Start the server and run until SIGINT/SIGTERM.
    pub async fn start(&self) -> Result<()> {
        self.start_with_shutdown(shutdown_signal()).await
    }

    /// Start the server and run until `signal` resolves or the engine is
    /// shut down, then cancel background work and persist the pool.
    pub async fn start_with_shutdown<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();
        tracing::info!("Starting server on {}", self.listen);

        let listener = tokio::net::TcpListener::bind(&self.listen).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "Address {} is already in use. \
                    Another mediafetch server may be running; stop it or pass --listen <ADDR>",
                    self.listen
                )
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", self.listen, e)
            }
        })?;

        let engine_stopped = self.manager.shutdown_token();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = signal => {}
                    _ = engine_stopped.cancelled() => {}
                }
            })
            .await?;

        if let Err(e) = self.manager.shutdown().await {
            tracing::error!("Failed to persist pool during shutdown: {}", e);
        } else {
            tracing::info!("Pool persisted successfully");
        }
        tracing::info!("Cleanup complete, shutting down server");
        Ok(())
    }
}

/// Router over a service, shared by the binary and tests.
pub fn router(service: Service) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/movies", post(movies_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
        .with_state(service)
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Command envelope.
#[derive(Deserialize)]
struct MoviesRequest {
    #[serde(default)]
    q: Value,
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    items: usize,
    associated: usize,
    pending: usize,
    active_jobs: usize,
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler(State(service): State<Service>) -> Json<HealthResponse> {
    let manager = service.manager();
    let stats = manager.stats();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        items: stats.total,
        associated: stats.associated,
        pending: stats.pending,
        active_jobs: manager.active_jobs(),
    })
}

/// Every command answers 200 with the envelope; failures travel in `err`.
async fn movies_handler(
    State(service): State<Service>,
    Json(request): Json<MoviesRequest>,
) -> Json<Response> {
    Json(service.handle_value(request.q).await)
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            _ => {
                tracing::warn!("Failed to install signal handlers, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
        tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
    }
}
