// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Playback streaming.
//!
//! For each play request the proxy first asks the cache for a completed
//! copy. On a hit the local file is served with range support and no
//! network call is made. On a miss the video (and, when prefetch is on, the
//! next one in its playlist) is handed to the download pipeline without
//! waiting, and the request is proxied live from the remote source.
//!
//! The proxy never writes to the cache directory.

pub mod range;

pub use range::{serve_file, ByteRange};

use std::io::ErrorKind;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;

use crate::cache::CacheStore;
use crate::catalog::Catalog;
use crate::download::DownloadPipeline;
use crate::errors::{map_io_error, UserError};
use crate::remote::RemoteSource;
use crate::types::{MediaKind, VideoDescriptor};

/// Range requested upstream when the client sent none.
const DEFAULT_LIVE_RANGE: &str = "bytes=0-";

/// Cache-first video streamer.
#[derive(Clone)]
pub struct StreamProxy {
    store: Arc<CacheStore>,
    pipeline: DownloadPipeline,
    source: Arc<dyn RemoteSource>,
    catalog: Arc<dyn Catalog>,
    prefetch_next: bool,
}

impl StreamProxy {
    pub fn new(
        store: Arc<CacheStore>,
        pipeline: DownloadPipeline,
        source: Arc<dyn RemoteSource>,
        catalog: Arc<dyn Catalog>,
        prefetch_next: bool,
    ) -> Self {
        Self {
            store,
            pipeline,
            source,
            catalog,
            prefetch_next,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn pipeline(&self) -> &DownloadPipeline {
        &self.pipeline
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    pub fn source_kind(&self) -> &'static str {
        self.source.kind()
    }

    /// Serve `video`, honoring the client's `Range` header.
    pub async fn stream(&self, video: &VideoDescriptor, range: Option<&str>) -> Result<Response, UserError> {
        if let Some(path) = self.store.lookup(video.id) {
            let content_type = MediaKind::from_path(&path).content_type();
            match serve_file(&path, range, content_type).await {
                Ok(response) => {
                    tracing::debug!(video_id = %video.id, range = ?range, "Serving from cache");
                    return Ok(response);
                }
                // Evicted between lookup and open.
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    tracing::debug!(video_id = %video.id, "Cached file vanished, streaming live");
                }
                Err(e) => return Err(map_io_error(&e)),
            }
        }

        self.schedule_caching(video);
        self.proxy_live(video, range).await
    }

    /// Submit `video` and its playlist successor to the pipeline. Never blocks.
    fn schedule_caching(&self, video: &VideoDescriptor) {
        self.pipeline.enqueue(video);
        if !self.prefetch_next {
            return;
        }

        let catalog = self.catalog.clone();
        let pipeline = self.pipeline.clone();
        let video_id = video.id;
        tokio::spawn(async move {
            match catalog.next_in_playlist(video_id).await {
                Ok(Some(next)) => {
                    if pipeline.enqueue(&next) {
                        tracing::debug!(video_id = %video_id, next_id = %next.id, "Prefetching next video");
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(video_id = %video_id, "Next-video lookup failed: {:#}", e),
            }
        });
    }

    /// Pipe the upstream response straight to the client.
    async fn proxy_live(&self, video: &VideoDescriptor, range: Option<&str>) -> Result<Response, UserError> {
        let range = range.unwrap_or(DEFAULT_LIVE_RANGE);
        let upstream = self.source.open_file(&video.remote_ref, Some(range)).await?;

        let status = StatusCode::from_u16(upstream.status)
            .map_err(|_| UserError::bad_gateway(&format!("invalid upstream status {}", upstream.status)))?;
        if !status.is_success() && status != StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(UserError::bad_gateway(&format!(
                "remote source answered HTTP {} for video {}",
                status.as_u16(),
                video.id
            )));
        }
        tracing::debug!(video_id = %video.id, status = status.as_u16(), range, "Streaming live");

        let content_type = upstream
            .content_type
            .unwrap_or_else(|| video.media_kind().content_type().to_string());
        let accept_ranges = upstream.accept_ranges.unwrap_or_else(|| "bytes".to_string());

        let mut builder = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::ACCEPT_RANGES, accept_ranges);
        if let Some(content_range) = upstream.content_range {
            builder = builder.header(header::CONTENT_RANGE, content_range);
        }
        if let Some(length) = upstream.content_length {
            builder = builder.header(header::CONTENT_LENGTH, length);
        }

        builder
            .body(Body::from_stream(upstream.body))
            .map_err(|e| UserError::internal_error(&format!("building live response: {}", e)))
    }
}
