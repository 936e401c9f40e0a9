// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cache admission, eviction and lookup.

use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde::Serialize;

use super::entry::CacheEntry;
use super::index::CacheIndex;
use super::CacheError;
use crate::events::{CacheEvent, EventKind, EventLog};
use crate::security::{resilient_read, resilient_write};
use crate::types::{VideoDescriptor, VideoId};

/// Suffix of files that are still being downloaded.
pub const PART_SUFFIX: &str = ".part";

/// Temp name used while `target` is being written.
pub fn part_path(target: &Path) -> PathBuf {
    let mut name: OsString = target.as_os_str().to_owned();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

/// Snapshot of cache usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub completed: usize,
    pub in_progress: usize,
    pub total_bytes: u64,
    pub capacity_bytes: u64,
}

impl CacheStats {
    /// Used share of the budget, 0-100.
    pub fn usage_percent(&self) -> f64 {
        if self.capacity_bytes == 0 {
            return 0.0;
        }
        (self.total_bytes as f64 / self.capacity_bytes as f64) * 100.0
    }
}

/// Bounded on-disk video cache with least-recently-used eviction.
///
/// Only completed entries count against the budget and only completed
/// entries are ever evicted. Capacity is enforced at admission time.
pub struct CacheStore {
    dir: PathBuf,
    capacity: u64,
    index: RwLock<CacheIndex>,
    events: Arc<dyn EventLog>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("dir", &self.dir)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl CacheStore {
    /// Open (creating if needed) the cache in `dir` with a byte budget.
    ///
    /// Rows of downloads interrupted by a previous crash are dropped together
    /// with their `.part` files.
    pub fn open(dir: impl AsRef<Path>, capacity: u64, events: Arc<dyn EventLog>) -> Result<Self, CacheError> {
        let store = Self::attach(dir, capacity, events)?;
        store.recover()?;
        Ok(store)
    }

    /// Open without crash recovery.
    ///
    /// For inspecting a cache that a running server may be writing to: its
    /// in-flight rows and `.part` files are left alone.
    pub fn attach(dir: impl AsRef<Path>, capacity: u64, events: Arc<dyn EventLog>) -> Result<Self, CacheError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|source| CacheError::io(dir, source))?;
        let dir = fs::canonicalize(dir).map_err(|source| CacheError::io(dir, source))?;

        let index = CacheIndex::load(&dir)?;
        Ok(Self {
            dir,
            capacity,
            index: RwLock::new(index),
            events,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    /// Final on-disk location for a video's cached copy.
    pub fn target_path(&self, video: &VideoDescriptor) -> PathBuf {
        self.dir
            .join(format!("{}{}", video.id, video.media_kind().cache_extension()))
    }

    /// Path of a completed, present cached copy, refreshing its recency.
    ///
    /// A completed row whose file has disappeared is purged and reported as
    /// a miss. Rows of in-flight downloads are never returned.
    ///
    /// Runs on every playback request, so it only changes the in-memory
    /// index. The change reaches disk with the next download write or
    /// [`CacheStore::flush`].
    pub fn lookup(&self, video_id: VideoId) -> Option<PathBuf> {
        let mut index = resilient_write(&self.index);

        let (completed, path) = match index.entries.get(&video_id) {
            Some(entry) => (entry.completed, entry.path.clone()),
            None => return None,
        };
        if !completed {
            return None;
        }

        if !path.is_file() {
            index.entries.remove(&video_id);
            index.dirty = true;
            drop(index);
            self.events.record(CacheEvent::for_video(
                EventKind::StalePurged,
                video_id,
                format!("Purged stale cache entry for video {}: file missing", video_id),
            ));
            return None;
        }

        let seq = index.next_access_seq();
        if let Some(entry) = index.entries.get_mut(&video_id) {
            entry.touch(seq);
        }
        index.dirty = true;
        Some(path)
    }

    /// Whether a completed row with its file present exists. Does not touch recency.
    pub fn is_cached(&self, video_id: VideoId) -> bool {
        resilient_read(&self.index)
            .entries
            .get(&video_id)
            .is_some_and(|e| e.completed && e.path.is_file())
    }

    /// Write recency and purge changes made by [`CacheStore::lookup`].
    pub fn flush(&self) -> Result<(), CacheError> {
        let mut index = resilient_write(&self.index);
        if !index.dirty {
            return Ok(());
        }
        index.save(&self.dir)
    }

    /// Make room for a file of `size_bytes`.
    ///
    /// Refuses outright when the file alone exceeds capacity. Otherwise
    /// evicts completed entries, least recently accessed first, until the
    /// file fits or nothing evictable remains. Returns whether it now fits.
    pub fn admit(&self, video_id: VideoId, size_bytes: u64) -> bool {
        if size_bytes > self.capacity {
            tracing::debug!(video_id = %video_id, size_bytes, capacity = self.capacity, "File larger than cache capacity");
            return false;
        }

        let mut index = resilient_write(&self.index);
        let mut events = Vec::new();
        let mut changed = self.purge_missing(&mut index, &mut events);

        let mut total = index.completed_bytes();
        let victims: Vec<(VideoId, PathBuf, u64)> = index
            .completed_by_recency()
            .into_iter()
            .map(|e| (e.video_id, e.path.clone(), e.size_bytes))
            .collect();

        for (victim_id, path, size) in victims {
            if total.saturating_add(size_bytes) <= self.capacity {
                break;
            }
            remove_file_quietly(&path);
            index.entries.remove(&victim_id);
            total = total.saturating_sub(size);
            changed = true;
            events.push(CacheEvent::for_video(
                EventKind::Evicted,
                victim_id,
                format!("Evicted cache video {} ({} bytes)", victim_id, size),
            ));
        }

        if changed {
            self.persist(&mut index);
        }
        drop(index);

        for event in events {
            self.events.record(event);
        }

        let fits = total.saturating_add(size_bytes) <= self.capacity;
        if !fits {
            tracing::debug!(video_id = %video_id, total, size_bytes, "Eviction could not free enough space");
        }
        fits
    }

    /// Record download intent before any bytes are written.
    pub fn begin_write(&self, video_id: VideoId, target: &Path, expected_size: u64) -> Result<(), CacheError> {
        let mut index = resilient_write(&self.index);
        let seq = index.next_access_seq();
        match index.entries.get_mut(&video_id) {
            Some(entry) => {
                entry.path = target.to_path_buf();
                entry.size_bytes = expected_size;
                entry.completed = false;
                entry.updated_at = Utc::now();
            }
            None => {
                index.entries.insert(
                    video_id,
                    CacheEntry::pending(video_id, target.to_path_buf(), expected_size, seq),
                );
            }
        }
        index.save(&self.dir)
    }

    /// Flip a row to completed. `final_path` must already hold the whole file.
    pub fn commit(&self, video_id: VideoId, final_size: u64, final_path: &Path) -> Result<(), CacheError> {
        if !final_path.is_file() {
            return Err(CacheError::MissingFile {
                video_id: video_id.0,
                path: final_path.to_path_buf(),
            });
        }

        let mut index = resilient_write(&self.index);
        let seq = index.next_access_seq();
        let entry = index
            .entries
            .entry(video_id)
            .or_insert_with(|| CacheEntry::pending(video_id, final_path.to_path_buf(), final_size, seq));
        entry.path = final_path.to_path_buf();
        entry.size_bytes = final_size;
        entry.completed = true;
        entry.touch(seq);
        index.save(&self.dir)
    }

    /// Drop the row of a failed download. Completed rows are left alone.
    pub fn abort_write(&self, video_id: VideoId) {
        let mut index = resilient_write(&self.index);
        let pending = index
            .entries
            .get(&video_id)
            .map(|e| !e.completed)
            .unwrap_or(false);
        if pending {
            index.entries.remove(&video_id);
            self.persist(&mut index);
        }
    }

    /// Sum of sizes over completed entries.
    pub fn total_bytes(&self) -> u64 {
        resilient_read(&self.index).completed_bytes()
    }

    /// Row for a video, completed or not.
    pub fn entry(&self, video_id: VideoId) -> Option<CacheEntry> {
        resilient_read(&self.index).entries.get(&video_id).cloned()
    }

    /// All rows, ordered by video id.
    pub fn entries(&self) -> Vec<CacheEntry> {
        resilient_read(&self.index).entries.values().cloned().collect()
    }

    pub fn stats(&self) -> CacheStats {
        let index = resilient_read(&self.index);
        let completed = index.entries.values().filter(|e| e.completed).count();
        CacheStats {
            entries: index.entries.len(),
            completed,
            in_progress: index.entries.len() - completed,
            total_bytes: index.completed_bytes(),
            capacity_bytes: self.capacity,
        }
    }

    /// Remove every completed entry and its file. Rows of downloads in
    /// progress are kept so their commit still lands.
    ///
    /// Returns the number of entries and bytes removed.
    pub fn clear(&self) -> Result<(usize, u64), CacheError> {
        let mut index = resilient_write(&self.index);
        let completed: Vec<(VideoId, PathBuf, u64)> = index
            .entries
            .values()
            .filter(|e| e.completed)
            .map(|e| (e.video_id, e.path.clone(), e.size_bytes))
            .collect();

        let mut bytes = 0u64;
        for (video_id, path, size) in &completed {
            remove_file_quietly(path);
            index.entries.remove(video_id);
            bytes = bytes.saturating_add(*size);
        }
        index.save(&self.dir)?;
        tracing::info!(entries = completed.len(), bytes, "Cleared video cache");
        Ok((completed.len(), bytes))
    }

    /// Drop incomplete rows and stray `.part` files left by a crash.
    fn recover(&self) -> Result<(), CacheError> {
        let mut index = resilient_write(&self.index);

        let interrupted: Vec<(VideoId, PathBuf)> = index
            .entries
            .values()
            .filter(|e| !e.completed)
            .map(|e| (e.video_id, e.path.clone()))
            .collect();
        for (video_id, path) in &interrupted {
            remove_file_quietly(&part_path(path));
            index.entries.remove(video_id);
            tracing::info!(video_id = %video_id, "Dropped interrupted cache download");
        }

        let read_dir = fs::read_dir(&self.dir).map_err(|source| CacheError::io(&self.dir, source))?;
        for dir_entry in read_dir.flatten() {
            let path = dir_entry.path();
            let is_part = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(PART_SUFFIX))
                .unwrap_or(false);
            if is_part {
                tracing::debug!("Removing orphan partial file {:?}", path);
                remove_file_quietly(&path);
            }
        }

        if !interrupted.is_empty() {
            index.save(&self.dir)?;
        }
        Ok(())
    }

    /// Remove completed rows whose file is gone. Returns whether any were removed.
    fn purge_missing(&self, index: &mut CacheIndex, events: &mut Vec<CacheEvent>) -> bool {
        let missing: Vec<VideoId> = index
            .entries
            .values()
            .filter(|e| e.completed && !e.path.is_file())
            .map(|e| e.video_id)
            .collect();
        for video_id in &missing {
            index.entries.remove(video_id);
            events.push(CacheEvent::for_video(
                EventKind::StalePurged,
                *video_id,
                format!("Purged stale cache entry for video {}: file missing", video_id),
            ));
        }
        !missing.is_empty()
    }

    /// Best-effort save for paths where the caller cannot act on failure.
    fn persist(&self, index: &mut CacheIndex) {
        if let Err(e) = index.save(&self.dir) {
            tracing::warn!("Failed to persist cache index: {}", e);
        }
    }
}

fn remove_file_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove cached file {:?}: {}", path, e),
    }
}
