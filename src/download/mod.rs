// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Background download pipeline for the video cache.
//!
//! Exactly one worker downloads at a time, in FIFO order. Submissions never
//! block: a full queue drops the submission and records an event.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐ try_send ┌─────────────────┐
//! │ DownloadPipeline │─────────▶│ Worker (tokio)  │
//! │ (enqueue)        │          │ one at a time   │
//! └────────┬─────────┘          └────────┬────────┘
//!          │ lookup                      │ admit / begin_write / commit
//!          ▼                             ▼
//! ┌──────────────────┐          ┌─────────────────┐
//! │ CacheStore       │◀─────────│ RemoteSource    │
//! └──────────────────┘  bytes   └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use reelcache::cache::CacheStore;
//! use reelcache::download::DownloadPipeline;
//! use reelcache::events::TracingEventLog;
//! use reelcache::remote::LanFileSource;
//! use reelcache::types::VideoDescriptor;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let events = Arc::new(TracingEventLog);
//! let store = Arc::new(CacheStore::open("/srv/cache", 8 << 30, events.clone())?);
//! let source = Arc::new(LanFileSource::new("http://10.0.0.2:18080", None)?);
//! let pipeline = DownloadPipeline::start(store, source, events);
//!
//! let video = VideoDescriptor::new(12, 1, "12 - Lunch.mp4", "/kids/12 - Lunch.mp4", 1 << 20);
//! pipeline.enqueue(&video);
//! pipeline.wait_idle().await;
//! # Ok(())
//! # }
//! ```

pub mod pipeline;
pub mod types;

pub use pipeline::{DownloadPipeline, DEFAULT_QUEUE_CAPACITY};
pub use types::{DownloadTask, PipelineStatus, TaskOutcome};
