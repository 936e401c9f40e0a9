// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Playback HTTP server
//!
//! # Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /api/stream/:id` - Stream a video (cache first, live fallback); honors `Range`
//! - `GET /api/videos/:id/next` - Next video of the same playlist
//! - `GET /cache/stats` - Cache usage and download pipeline counters
//! - `GET /cache/events?limit=N` - Recent cache events
//!
//! # Example
//!
//! ```no_run
//! use reelcache::server::Server;
//! # use reelcache::stream::StreamProxy;
//! # use std::sync::Arc;
//!
//! # async fn example(proxy: StreamProxy) -> anyhow::Result<()> {
//! let events = Arc::new(reelcache::events::MemoryEventLog::default());
//! let server = Server::new(proxy, events).with_port(3000);
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap},
    response::{Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::cache::CacheStats;
use crate::config::DEFAULT_PORT;
use crate::download::PipelineStatus;
use crate::errors::{ApiResult, UserError};
use crate::events::{CacheEvent, EventLog};
use crate::stream::StreamProxy;
use crate::types::{VideoDescriptor, VideoId};

/// Default number of events returned by `/cache/events`.
const DEFAULT_EVENT_LIMIT: usize = 100;

/// Server state shared across handlers.
pub struct AppState {
    pub proxy: StreamProxy,
    pub events: Arc<dyn EventLog>,
}

/// Playback server configuration.
pub struct Server {
    port: u16,
    /// Address to bind to (defaults to 127.0.0.1).
    bind_address: String,
    state: Arc<AppState>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("port", &self.port)
            .field("bind_address", &self.bind_address)
            .finish_non_exhaustive()
    }
}

impl Server {
    pub fn new(proxy: StreamProxy, events: Arc<dyn EventLog>) -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: "127.0.0.1".to_string(),
            state: Arc::new(AppState { proxy, events }),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Use "0.0.0.0" to let other devices on the network play videos.
    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    /// Build the router with all routes.
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/api/stream/:id", get(stream_handler))
            .route("/api/videos/:id/next", get(next_video_handler))
            .route("/cache/stats", get(cache_stats_handler))
            .route("/cache/events", get(cache_events_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind and serve until SIGINT/SIGTERM.
    pub async fn start(&self) -> Result<()> {
        let addr = format!("{}:{}", self.bind_address, self.port);
        let listener = bind(&addr, self.port).await?;
        tracing::info!("Starting playback server on {}", addr);
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: tokio::net::TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Bind a listener with a readable error for the common port clash.
pub(crate) async fn bind(addr: &str, port: u16) -> Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            anyhow::anyhow!(
                "Port {} is already in use. Stop the other instance or choose another port with --port",
                port
            )
        } else {
            anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
        }
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    source: &'static str,
    cache_entries: usize,
    cache_bytes: u64,
}

#[derive(Serialize)]
struct CacheStatsResponse {
    cache: CacheStats,
    usage_percent: f64,
    pipeline: PipelineStatus,
}

#[derive(Serialize)]
struct NextVideoResponse {
    next: Option<VideoDescriptor>,
}

#[derive(Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let stats = state.proxy.store().stats();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        source: state.proxy.source_kind(),
        cache_entries: stats.completed,
        cache_bytes: stats.total_bytes,
    })
}

async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let video = find_video(&state, VideoId(id)).await?;
    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    state.proxy.stream(&video, range).await
}

async fn next_video_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> ApiResult<Json<NextVideoResponse>> {
    let video = find_video(&state, VideoId(id)).await?;
    let next = state
        .proxy
        .catalog()
        .next_in_playlist(video.id)
        .await
        .map_err(|e| UserError::internal_error(&format!("{:#}", e)))?;
    Ok(Json(NextVideoResponse { next }))
}

async fn cache_stats_handler(State(state): State<Arc<AppState>>) -> Json<CacheStatsResponse> {
    let cache = state.proxy.store().stats();
    Json(CacheStatsResponse {
        usage_percent: cache.usage_percent(),
        cache,
        pipeline: state.proxy.pipeline().status(),
    })
}

async fn cache_events_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Json<Vec<CacheEvent>> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    Json(state.events.recent(limit))
}

async fn find_video(state: &AppState, id: VideoId) -> ApiResult<VideoDescriptor> {
    state
        .proxy
        .catalog()
        .video(id)
        .await
        .map_err(|e| UserError::internal_error(&format!("{:#}", e)))?
        .ok_or_else(|| UserError::not_found("video"))
}

/// Resolves on SIGINT/SIGTERM (Ctrl+C elsewhere).
pub(crate) async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
                    }
                }
            }
            _ => {
                tracing::warn!("Could not install signal handlers, falling back to Ctrl+C");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
    }

    tracing::info!("Shutting down server");
}
