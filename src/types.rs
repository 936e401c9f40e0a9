// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Canonical types used across reelcache.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Stable identifier of a video in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VideoId(pub u64);

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for VideoId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Everything the cache and stream layers need to know about one video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoDescriptor {
    pub id: VideoId,
    /// Playlist (category) the video belongs to.
    pub category_id: u64,
    /// Display title, usually the remote file name.
    pub title: String,
    /// Locator understood by the configured remote source
    /// (file id on the cloud drive, rooted path on the LAN server).
    pub remote_ref: String,
    /// Size reported by the catalog. Zero means unknown.
    #[serde(default)]
    pub size_bytes: u64,
}

impl VideoDescriptor {
    pub fn new(
        id: u64,
        category_id: u64,
        title: impl Into<String>,
        remote_ref: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        Self {
            id: VideoId(id),
            category_id,
            title: title.into(),
            remote_ref: remote_ref.into(),
            size_bytes,
        }
    }

    /// Media kind derived from the title's extension.
    pub fn media_kind(&self) -> MediaKind {
        MediaKind::from_path(Path::new(&self.title))
    }
}

/// Container formats the player understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Mp4,
    M4v,
    QuickTime,
}

impl MediaKind {
    /// Classify by extension. Unknown or missing extensions are treated as MP4.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("mov") => MediaKind::QuickTime,
            Some("m4v") => MediaKind::M4v,
            _ => MediaKind::Mp4,
        }
    }

    /// Value for the `Content-Type` header.
    pub fn content_type(&self) -> &'static str {
        match self {
            MediaKind::QuickTime => "video/quicktime",
            MediaKind::Mp4 | MediaKind::M4v => "video/mp4",
        }
    }

    /// Extension (with dot) used for the cached copy on disk.
    pub fn cache_extension(&self) -> &'static str {
        match self {
            MediaKind::QuickTime => ".mov",
            MediaKind::M4v => ".m4v",
            MediaKind::Mp4 => ".mp4",
        }
    }
}
