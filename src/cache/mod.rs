// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Local video cache.
//!
//! [`CacheStore`] owns the cache directory's metadata table and makes every
//! admission and eviction decision. Bytes are written into the directory only
//! by the download pipeline; the stream proxy only reads.
//!
//! # Layout
//!
//! ```text
//! <cache_dir>/
//!   index.json        metadata table (video id -> path, size, completed, times)
//!   index.lock        advisory lock guarding index rewrites
//!   12.mp4            completed file for video 12
//!   13.mov.part       download in progress for video 13
//! ```

pub mod entry;
pub mod index;
pub mod store;

pub use entry::CacheEntry;
pub use index::CacheIndex;
pub use store::{part_path, CacheStats, CacheStore};

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Errors raised by the cache layer.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cache index is unreadable: {0}")]
    Index(#[from] serde_json::Error),

    #[error("timed out after {timeout:?} waiting for lock on {path:?}")]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("refusing to commit video {video_id}: {path:?} is not a file")]
    MissingFile { video_id: u64, path: PathBuf },
}

impl CacheError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
