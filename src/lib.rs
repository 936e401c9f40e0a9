// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! reelcache - Video streaming proxy with a bounded local cache
//!
//! Plays videos from a remote source (a cloud drive or a LAN file server)
//! and keeps recently watched ones on local disk:
//!
//! **Cache hit** -> local file with range support
//! **Cache miss** -> live proxy + background download (and prefetch of the next video)
//!
//! # Core Modules
//!
//! - [`cache`] - Size-bounded LRU store of completed video files
//! - [`download`] - Single-worker background download pipeline
//! - [`stream`] - Cache-first streaming and local range serving
//! - [`remote`] - Remote source abstraction (cloud drive, LAN server)
//! - [`catalog`] - Video metadata and playlist ordering
//! - [`server`] - Playback HTTP server
//! - [`lanserver`] - Companion file server for a LAN media root
//! - [`events`] - Cache event log hook
//! - [`config`] - Configuration file and environment overrides
//! - [`errors`] - Client-facing error responses

pub mod cache;
pub mod catalog;
pub mod config;
pub mod download;
pub mod errors;
pub mod events;
pub mod lanserver;
pub mod remote;
pub mod security;
pub mod server;
pub mod stream;
pub mod types;

pub use cache::{CacheError, CacheStats, CacheStore};
pub use catalog::{Catalog, MemoryCatalog};
pub use config::{load_config, Config};
pub use download::{DownloadPipeline, PipelineStatus};
pub use events::{CacheEvent, EventKind, EventLog};
pub use remote::{RemoteError, RemoteSource};
pub use stream::StreamProxy;
pub use types::{MediaKind, VideoDescriptor, VideoId};
