// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cache event log.
//!
//! Every cache decision that an operator may want to see later (admission
//! refusals, evictions, stale purges, background download start/success/
//! failure, dropped queue submissions) is reported through [`EventLog`].
//! The cache itself never decides where events end up.
//!
//! Log line format for [`FileEventLog`] is one JSON object per line:
//! `{"at":"2025-01-15T10:23:45Z","kind":"EVICTED","video_id":12,"message":"Evicted cache video 12"}`

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::security::{resilient_read, resilient_write};
use crate::types::VideoId;

/// Default number of events kept in memory.
pub const DEFAULT_RECENT_CAPACITY: usize = 500;

/// Category of a cache event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    AdmissionRefused,
    Evicted,
    StalePurged,
    DownloadStarted,
    DownloadSucceeded,
    DownloadFailed,
    QueueFull,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdmissionRefused => "ADMISSION_REFUSED",
            Self::Evicted => "EVICTED",
            Self::StalePurged => "STALE_PURGED",
            Self::DownloadStarted => "DOWNLOAD_STARTED",
            Self::DownloadSucceeded => "DOWNLOAD_SUCCEEDED",
            Self::DownloadFailed => "DOWNLOAD_FAILED",
            Self::QueueFull => "QUEUE_FULL",
        }
    }

    /// True for events that indicate something went wrong.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::DownloadFailed | Self::QueueFull)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One reported cache event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEvent {
    pub at: DateTime<Utc>,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_id: Option<VideoId>,
    /// Human-readable description.
    pub message: String,
}

impl CacheEvent {
    pub fn new(kind: EventKind, video_id: Option<VideoId>, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            kind,
            video_id,
            message: message.into(),
        }
    }

    pub fn for_video(kind: EventKind, video_id: VideoId, message: impl Into<String>) -> Self {
        Self::new(kind, Some(video_id), message)
    }
}

/// Sink for cache events.
pub trait EventLog: Send + Sync {
    /// Record an event. Must not fail or block for long.
    fn record(&self, event: CacheEvent);

    /// Most recent events, newest last. Sinks without memory return nothing.
    fn recent(&self, _limit: usize) -> Vec<CacheEvent> {
        Vec::new()
    }
}

fn trace_event(event: &CacheEvent) {
    if event.kind.is_failure() {
        tracing::warn!(kind = %event.kind, video_id = ?event.video_id, "{}", event.message);
    } else {
        tracing::info!(kind = %event.kind, video_id = ?event.video_id, "{}", event.message);
    }
}

/// Forwards events to `tracing` only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventLog;

impl EventLog for TracingEventLog {
    fn record(&self, event: CacheEvent) {
        trace_event(&event);
    }
}

/// Bounded in-memory ring of events.
#[derive(Debug)]
pub struct MemoryEventLog {
    capacity: usize,
    entries: RwLock<VecDeque<CacheEvent>>,
}

impl MemoryEventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(VecDeque::new()),
        }
    }

    /// Number of recorded events of the given kind still held in memory.
    pub fn count(&self, kind: EventKind) -> usize {
        resilient_read(&self.entries)
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    /// Events of one kind, oldest first.
    pub fn of_kind(&self, kind: EventKind) -> Vec<CacheEvent> {
        resilient_read(&self.entries)
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    fn push(&self, event: CacheEvent) {
        let mut entries = resilient_write(&self.entries);
        entries.push_back(event);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_CAPACITY)
    }
}

impl EventLog for MemoryEventLog {
    fn record(&self, event: CacheEvent) {
        trace_event(&event);
        self.push(event);
    }

    fn recent(&self, limit: usize) -> Vec<CacheEvent> {
        let entries = resilient_read(&self.entries);
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }
}

/// Appends events as JSON lines to a file and keeps a recent window in memory.
#[derive(Debug)]
pub struct FileEventLog {
    path: PathBuf,
    memory: MemoryEventLog,
}

impl FileEventLog {
    /// Open (creating parent directories) an append-only event file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create event log directory: {:?}", parent))?;
        }
        Ok(Self {
            path,
            memory: MemoryEventLog::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, event: &CacheEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Read every event back from the file, skipping unparseable lines.
    pub fn read_all(&self) -> Result<Vec<CacheEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

impl EventLog for FileEventLog {
    fn record(&self, event: CacheEvent) {
        if let Err(e) = self.append(&event) {
            tracing::warn!("Failed to append cache event to {:?}: {}", self.path, e);
        }
        self.memory.record(event);
    }

    fn recent(&self, limit: usize) -> Vec<CacheEvent> {
        self.memory.recent(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_log_is_bounded() {
        let log = MemoryEventLog::new(3);
        for i in 0..5u64 {
            log.record(CacheEvent::for_video(
                EventKind::Evicted,
                VideoId(i),
                format!("Evicted cache video {}", i),
            ));
        }
        let recent = log.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].video_id, Some(VideoId(2)));
        assert_eq!(recent[2].video_id, Some(VideoId(4)));
    }

    #[test]
    fn test_recent_limit_returns_newest() {
        let log = MemoryEventLog::default();
        log.record(CacheEvent::new(EventKind::DownloadStarted, None, "a"));
        log.record(CacheEvent::new(EventKind::DownloadSucceeded, None, "b"));
        let recent = log.recent(1);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message, "b");
        assert_eq!(log.count(EventKind::DownloadStarted), 1);
    }

    #[test]
    fn test_file_log_appends_json_lines() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let log = FileEventLog::open(dir.path().join("logs").join("events.jsonl"))
            .expect("open event log");

        log.record(CacheEvent::for_video(EventKind::DownloadFailed, VideoId(9), "Cache failed for video 9: reset"));
        log.record(CacheEvent::for_video(EventKind::AdmissionRefused, VideoId(10), "Skip cache video 10: not enough space"));

        let content = fs::read_to_string(log.path()).expect("read log");
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("\"kind\":\"DOWNLOAD_FAILED\""));

        let all = log.read_all().expect("read back");
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].kind, EventKind::AdmissionRefused);
        assert_eq!(log.recent(5).len(), 2);
    }

    #[test]
    fn test_failure_kinds() {
        assert!(EventKind::DownloadFailed.is_failure());
        assert!(EventKind::QueueFull.is_failure());
        assert!(!EventKind::Evicted.is_failure());
    }
}
