// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Remote video sources.
//!
//! Videos physically live on a remote store. [`RemoteSource`] is the one
//! seam the cache and stream layers talk to; which store sits behind it is
//! decided once when the process starts.
//!
//! | Variant | Locator (`remote_ref`) | Auth |
//! |---|---|---|
//! | [`CloudDriveSource`] | numeric file id | bearer token from an [`AccessTokenProvider`] |
//! | [`LanFileSource`] | rooted forward-slash path | static `x-auth-token` header |
//!
//! No request timeout is set on either variant: media files are large and
//! links can be slow.

pub mod cloud;
pub mod lan;

pub use cloud::{AccessTokenProvider, CloudDriveSource, StaticTokenProvider};
pub use lan::{normalize_rel_path, LanFileSource};

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SourceConfig;

/// Errors raised by a remote source.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote source is not configured: {0}")]
    NotConfigured(String),

    #[error("remote source rejected credentials: {0}")]
    Auth(String),

    #[error("remote source answered HTTP {0}")]
    Status(u16),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("unexpected response from remote source: {0}")]
    InvalidResponse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub is_directory: bool,
    pub size_bytes: u64,
    /// Locator to pass back to [`RemoteSource::open_file`].
    pub stable_id: String,
}

/// An open upstream response: status, passthrough headers and the body.
pub struct RemoteStream {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_range: Option<String>,
    pub content_length: Option<u64>,
    pub accept_ranges: Option<String>,
    pub body: BoxStream<'static, Result<Bytes, RemoteError>>,
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStream")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("content_range", &self.content_range)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

impl RemoteStream {
    /// Wrap a streaming `reqwest` response.
    pub fn from_response(response: reqwest::Response) -> Self {
        let header = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header(reqwest::header::CONTENT_TYPE);
        let content_range = header(reqwest::header::CONTENT_RANGE);
        let accept_ranges = header(reqwest::header::ACCEPT_RANGES);
        let content_length = header(reqwest::header::CONTENT_LENGTH).and_then(|v| v.parse().ok());

        Self {
            status: response.status().as_u16(),
            content_type,
            content_range,
            content_length,
            accept_ranges,
            body: response
                .bytes_stream()
                .map(|chunk| chunk.map_err(RemoteError::from))
                .boxed(),
        }
    }

    /// True for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A store that can list directories and stream files.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Short name used in logs.
    fn kind(&self) -> &'static str;

    /// List one directory.
    async fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>, RemoteError>;

    /// Open a file for streaming, forwarding `range` verbatim when given.
    async fn open_file(&self, remote_ref: &str, range: Option<&str>) -> Result<RemoteStream, RemoteError>;
}

/// Build the configured remote source.
pub fn from_config(source: &SourceConfig) -> Result<Arc<dyn RemoteSource>> {
    let source: Arc<dyn RemoteSource> = match source {
        SourceConfig::CloudDrive { api_base, access_token } => Arc::new(CloudDriveSource::new(
            api_base.clone(),
            Arc::new(StaticTokenProvider::new(access_token.clone())),
        )?),
        SourceConfig::Lan { base_url, token } => {
            Arc::new(LanFileSource::new(base_url.clone(), token.clone())?)
        }
    };
    tracing::info!(kind = source.kind(), "Remote source configured");
    Ok(source)
}

/// Shared `reqwest` client without an overall timeout.
fn http_client() -> Result<reqwest::Client, RemoteError> {
    Ok(reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()?)
}
