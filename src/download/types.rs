// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download types for background cache filling.

use std::path::PathBuf;

use serde::Serialize;

use crate::cache::part_path;
use crate::types::{VideoDescriptor, VideoId};

/// A video waiting for (or undergoing) a background download.
///
/// Lives only inside the pipeline; never persisted.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub video_id: VideoId,
    pub descriptor: VideoDescriptor,
    /// Final cache path. Bytes land in [`DownloadTask::temp_path`] first.
    pub target_path: PathBuf,
    pub expected_size_bytes: u64,
}

impl DownloadTask {
    pub fn new(descriptor: VideoDescriptor, target_path: PathBuf) -> Self {
        Self {
            video_id: descriptor.id,
            expected_size_bytes: descriptor.size_bytes,
            descriptor,
            target_path,
        }
    }

    pub fn temp_path(&self) -> PathBuf {
        part_path(&self.target_path)
    }
}

/// How a dequeued task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// File committed to the cache.
    Cached,
    /// Already cached or admission refused; nothing written.
    Skipped,
}

/// Counters published by the pipeline after every state change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStatus {
    /// Tasks accepted but not yet started.
    pub queued: usize,
    /// Video currently downloading.
    pub active: Option<VideoId>,
    pub succeeded: u64,
    pub failed: u64,
    /// Tasks that wrote nothing: already cached, or admission refused them.
    pub skipped: u64,
    /// Submissions dropped because the queue was full.
    pub dropped: u64,
}

impl PipelineStatus {
    /// Nothing queued and nothing running.
    pub fn is_idle(&self) -> bool {
        self.queued == 0 && self.active.is_none()
    }

    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed + self.skipped
    }
}
