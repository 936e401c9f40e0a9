// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cache metadata rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::VideoId;

/// One video that has been (or is being) cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub video_id: VideoId,
    /// Final location of the cached file (never the `.part` name).
    pub path: PathBuf,
    /// Exact size once `completed`; the expected size while downloading.
    pub size_bytes: u64,
    /// The file at `path` exists and is fully written.
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// Monotonic recency counter, breaks `last_accessed_at` ties.
    #[serde(default)]
    pub access_seq: u64,
}

impl CacheEntry {
    /// A fresh, incomplete row marking download intent.
    pub fn pending(video_id: VideoId, path: PathBuf, expected_size: u64, access_seq: u64) -> Self {
        let now = Utc::now();
        Self {
            video_id,
            path,
            size_bytes: expected_size,
            completed: false,
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            access_seq,
        }
    }

    /// Record a cache hit.
    pub fn touch(&mut self, access_seq: u64) {
        let now = Utc::now();
        self.last_accessed_at = now;
        self.updated_at = now;
        self.access_seq = access_seq;
    }

    /// Eviction order key: oldest access first.
    pub fn recency_key(&self) -> (DateTime<Utc>, u64) {
        (self.last_accessed_at, self.access_seq)
    }
}
