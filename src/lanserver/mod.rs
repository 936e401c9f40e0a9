// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! LAN media file server
//!
//! Runs on the machine that holds the video files and exposes one directory
//! tree to [`crate::remote::LanFileSource`].
//!
//! # Endpoints
//!
//! - `GET /health` - `{"ok": true}`
//! - `GET /api/list?path=/dir` - Directory listing
//! - `GET /file?path=/dir/video.mp4` - File bytes; honors `Range`
//!
//! When a token is configured every request except `/health` must carry it
//! in `x-auth-token`. Paths resolving outside the root are rejected with
//! `400 INVALID_PATH`.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::remote::lan::AUTH_HEADER;
use crate::remote::normalize_rel_path;
use crate::security::token_matches;
use crate::server::{bind, shutdown_signal};
use crate::stream::serve_file;

/// Default LAN server port.
pub const DEFAULT_LAN_PORT: u16 = 18080;

struct LanState {
    root: PathBuf,
    token: String,
}

/// A path inside the served root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafePath {
    /// Absolute path on disk.
    pub resolved: PathBuf,
    /// Normalized rooted path as seen by clients.
    pub rel: String,
}

/// Resolve a client path against `root`, refusing anything that escapes it.
///
/// `.` and `..` are resolved lexically first; an existing target is then
/// canonicalized so symlinks pointing outside the root are refused too.
pub fn resolve_safe(root: &Path, rel_path: &str) -> Option<SafePath> {
    let normalized = normalize_rel_path(rel_path);
    let mut parts: Vec<&str> = Vec::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }

    let mut resolved = root.to_path_buf();
    for part in &parts {
        let mut components = Path::new(part).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(c)), None) => resolved.push(c),
            _ => return None,
        }
    }

    if let Ok(canonical) = std::fs::canonicalize(&resolved) {
        if !canonical.starts_with(root) {
            return None;
        }
    }

    Some(SafePath {
        resolved,
        rel: format!("/{}", parts.join("/")),
    })
}

/// Content type by extension; unknown files are opaque bytes.
fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("mov") => "video/quicktime",
        Some("mp4") | Some("m4v") => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// LAN file server configuration.
#[derive(Debug)]
pub struct LanServer {
    root: PathBuf,
    token: Option<String>,
    port: u16,
    bind_address: String,
}

impl LanServer {
    pub fn new(root: impl Into<PathBuf>, token: Option<String>) -> Self {
        Self {
            root: root.into(),
            token,
            port: DEFAULT_LAN_PORT,
            bind_address: "127.0.0.1".to_string(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    /// Build the router. Fails when the root does not exist.
    pub fn build_router(&self) -> Result<Router> {
        let root = std::fs::canonicalize(&self.root)
            .with_context(|| format!("Media root {:?} is not accessible", self.root))?;
        let state = Arc::new(LanState {
            root,
            token: self.token.clone().unwrap_or_default(),
        });

        Ok(Router::new()
            .route("/health", get(health_handler))
            .route("/api/list", get(list_handler))
            .route("/file", get(file_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state))
    }

    /// Bind and serve until SIGINT/SIGTERM.
    pub async fn start(&self) -> Result<()> {
        let router = self.build_router()?;
        let addr = format!("{}:{}", self.bind_address, self.port);
        let listener = bind(&addr, self.port).await?;

        tracing::info!("LAN media server on http://{} serving {:?}", addr, self.root);
        if self.token.as_deref().unwrap_or_default().is_empty() {
            tracing::warn!("No token configured; anyone on the network can read the media root");
        }

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct PathQuery {
    path: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListEntry {
    name: String,
    path: String,
    is_dir: bool,
    size: u64,
    mtime_ms: f64,
}

#[derive(Serialize)]
struct ListResponse {
    path: String,
    entries: Vec<ListEntry>,
}

fn json_error(status: StatusCode, code: &str) -> Response {
    (status, Json(serde_json::json!({ "error": code }))).into_response()
}

fn authorized(state: &LanState, headers: &HeaderMap) -> bool {
    let presented = headers.get(AUTH_HEADER).and_then(|v| v.to_str().ok());
    token_matches(&state.token, presented)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn list_handler(
    State(state): State<Arc<LanState>>,
    headers: HeaderMap,
    Query(query): Query<PathQuery>,
) -> Response {
    if !authorized(&state, &headers) {
        return json_error(StatusCode::UNAUTHORIZED, "UNAUTHORIZED");
    }
    let Some(safe) = resolve_safe(&state.root, query.path.as_deref().unwrap_or("/")) else {
        return json_error(StatusCode::BAD_REQUEST, "INVALID_PATH");
    };

    let mut dir = match tokio::fs::read_dir(&safe.resolved).await {
        Ok(dir) => dir,
        Err(e) => {
            tracing::debug!("List failed for {}: {}", safe.rel, e);
            return json_error(StatusCode::NOT_FOUND, "NOT_FOUND");
        }
    };

    let mut entries = Vec::new();
    loop {
        let entry = match dir.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Error while listing {}: {}", safe.rel, e);
                break;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let metadata = tokio::fs::metadata(entry.path()).await.ok();
        let is_dir = metadata.as_ref().map(|m| m.is_dir()).unwrap_or(false);
        let size = metadata
            .as_ref()
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .unwrap_or(0);
        let mtime_ms = metadata
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        let path = if safe.rel == "/" {
            format!("/{}", name)
        } else {
            format!("{}/{}", safe.rel, name)
        };
        entries.push(ListEntry {
            name,
            path,
            is_dir,
            size,
            mtime_ms,
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    Json(ListResponse {
        path: safe.rel,
        entries,
    })
    .into_response()
}

async fn file_handler(
    State(state): State<Arc<LanState>>,
    headers: HeaderMap,
    Query(query): Query<PathQuery>,
) -> Response {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, "UNAUTHORIZED").into_response();
    }
    let Some(safe) = resolve_safe(&state.root, query.path.as_deref().unwrap_or("")) else {
        return (StatusCode::BAD_REQUEST, "INVALID_PATH").into_response();
    };

    match tokio::fs::metadata(&safe.resolved).await {
        Ok(m) if m.is_file() => {}
        Ok(_) => return (StatusCode::NOT_FOUND, "NOT_FILE").into_response(),
        Err(_) => return (StatusCode::NOT_FOUND, "NOT_FOUND").into_response(),
    }

    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    match serve_file(&safe.resolved, range, content_type_for(&safe.resolved)).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("Failed to serve {}: {}", safe.rel, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "READ_FAILED").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn root() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let root = std::fs::canonicalize(dir.path()).expect("canonicalize");
        std::fs::create_dir_all(root.join("Kids")).expect("mkdir");
        std::fs::write(root.join("Kids").join("1.mp4"), b"data").expect("write");
        (dir, root)
    }

    #[test]
    fn test_resolve_inside_root() {
        let (_dir, root) = root();
        let safe = resolve_safe(&root, "Kids\\1.mp4").expect("inside");
        assert_eq!(safe.rel, "/Kids/1.mp4");
        assert_eq!(safe.resolved, root.join("Kids").join("1.mp4"));

        let safe = resolve_safe(&root, "/Kids/./sub/../1.mp4").expect("inside");
        assert_eq!(safe.rel, "/Kids/1.mp4");

        let safe = resolve_safe(&root, "").expect("root");
        assert_eq!(safe.rel, "/");
        assert_eq!(safe.resolved, root);
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let (_dir, root) = root();
        assert!(resolve_safe(&root, "/../etc/passwd").is_none());
        assert!(resolve_safe(&root, "..\\..\\secret").is_none());
        assert!(resolve_safe(&root, "/Kids/../../outside").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_symlink_escape() {
        let (_dir, root) = root();
        let outside = TempDir::new().expect("Failed to create temp dir");
        std::fs::write(outside.path().join("secret.mp4"), b"x").expect("write");
        std::os::unix::fs::symlink(outside.path(), root.join("link")).expect("symlink");
        assert!(resolve_safe(&root, "/link/secret.mp4").is_none());
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for(Path::new("a.MOV")), "video/quicktime");
        assert_eq!(content_type_for(Path::new("a.m4v")), "video/mp4");
        assert_eq!(content_type_for(Path::new("notes.txt")), "application/octet-stream");
    }

    #[test]
    fn test_missing_root_fails_to_build() {
        let server = LanServer::new("/definitely/not/here/reelcache", None);
        assert!(server.build_router().is_err());
    }
}
