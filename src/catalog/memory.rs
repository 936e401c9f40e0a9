// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Catalog held in memory, loaded from a JSON file.
//!
//! ```json
//! { "videos": [ { "id": 1, "category_id": 1, "title": "1 - Start.mp4",
//!                 "remote_ref": "/kids/1 - Start.mp4", "size_bytes": 1048576 } ] }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{next_after, sort_playlist, Catalog};
use crate::types::{VideoDescriptor, VideoId};

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    videos: Vec<VideoDescriptor>,
}

/// Immutable catalog keyed by video id.
#[derive(Debug, Default, Clone)]
pub struct MemoryCatalog {
    videos: BTreeMap<VideoId, VideoDescriptor>,
}

impl MemoryCatalog {
    pub fn from_videos(videos: impl IntoIterator<Item = VideoDescriptor>) -> Self {
        Self {
            videos: videos.into_iter().map(|v| (v.id, v)).collect(),
        }
    }

    /// Load from `path`. A missing file yields an empty catalog.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!("Catalog file {:?} not found, starting empty", path);
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog file: {:?}", path))?;
        let file: CatalogFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse catalog file: {:?}", path))?;
        tracing::info!("Loaded {} videos from catalog", file.videos.len());
        Ok(Self::from_videos(file.videos))
    }

    pub fn len(&self) -> usize {
        self.videos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.videos.is_empty()
    }

    /// Videos of one category in playlist order.
    pub fn playlist(&self, category_id: u64) -> Vec<VideoDescriptor> {
        let mut videos: Vec<VideoDescriptor> = self
            .videos
            .values()
            .filter(|v| v.category_id == category_id)
            .cloned()
            .collect();
        sort_playlist(&mut videos);
        videos
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn video(&self, id: VideoId) -> Result<Option<VideoDescriptor>> {
        Ok(self.videos.get(&id).cloned())
    }

    async fn next_in_playlist(&self, id: VideoId) -> Result<Option<VideoDescriptor>> {
        let Some(current) = self.videos.get(&id) else {
            return Ok(None);
        };
        Ok(next_after(current, self.videos.values()).cloned())
    }
}
