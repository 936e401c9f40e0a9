// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent cache metadata table.
//!
//! The index lives next to the cached files as `index.json`. Writes go to a
//! temp file which is fsynced and renamed over the index while an exclusive
//! lock on `index.lock` is held, so a crash never leaves a torn index and a
//! second process (e.g. `reelcache cache stats`) never reads a half-written
//! one.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::entry::CacheEntry;
use super::CacheError;
use crate::types::VideoId;

/// Index file name inside the cache directory.
pub const INDEX_FILE: &str = "index.json";

/// Lock file name inside the cache directory.
pub const LOCK_FILE: &str = "index.lock";

/// Default timeout for acquiring the index lock.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval while waiting for the lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// All cache rows plus bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheIndex {
    pub entries: BTreeMap<VideoId, CacheEntry>,
    /// Last value handed out by [`CacheIndex::next_access_seq`].
    #[serde(default)]
    pub access_clock: u64,
    pub last_saved: Option<DateTime<Utc>>,
    pub version: u32,
    /// In-memory changes not yet written by [`CacheIndex::save`].
    #[serde(skip)]
    pub dirty: bool,
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheIndex {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            access_clock: 0,
            last_saved: None,
            version: 1,
            dirty: false,
        }
    }

    pub fn index_path(dir: &Path) -> PathBuf {
        dir.join(INDEX_FILE)
    }

    fn lock_path(dir: &Path) -> PathBuf {
        dir.join(LOCK_FILE)
    }

    /// Next value of the recency clock.
    pub fn next_access_seq(&mut self) -> u64 {
        self.access_clock += 1;
        self.access_clock
    }

    /// Sum of sizes over completed rows.
    pub fn completed_bytes(&self) -> u64 {
        self.entries
            .values()
            .filter(|e| e.completed)
            .fold(0u64, |acc, e| acc.saturating_add(e.size_bytes))
    }

    /// Completed rows, least recently used first.
    pub fn completed_by_recency(&self) -> Vec<&CacheEntry> {
        let mut completed: Vec<&CacheEntry> =
            self.entries.values().filter(|e| e.completed).collect();
        completed.sort_by_key(|e| e.recency_key());
        completed
    }

    fn open_lock_file(path: &Path) -> Result<File, CacheError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| CacheError::io(path, source))
    }

    fn acquire_exclusive_lock_with_timeout(path: &Path, timeout: Duration) -> Result<File, CacheError> {
        let lock_file = Self::open_lock_file(path)?;
        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&lock_file) {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(CacheError::LockTimeout {
                            path: path.to_path_buf(),
                            timeout,
                        });
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(CacheError::io(path, e)),
            }
        }
    }

    fn acquire_shared_lock_with_timeout(file: &File, path: &Path, timeout: Duration) -> Result<(), CacheError> {
        let start = Instant::now();
        loop {
            match FileExt::try_lock_shared(file) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(CacheError::LockTimeout {
                            path: path.to_path_buf(),
                            timeout,
                        });
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(CacheError::io(path, e)),
            }
        }
    }

    /// Load the index from `dir`. A missing index yields an empty one.
    pub fn load(dir: &Path) -> Result<Self, CacheError> {
        let path = Self::index_path(dir);
        if !path.exists() {
            return Ok(Self::new());
        }

        let lock_path = Self::lock_path(dir);
        let lock_file = Self::open_lock_file(&lock_path)?;
        Self::acquire_shared_lock_with_timeout(&lock_file, &lock_path, LOCK_TIMEOUT)?;

        let content = fs::read_to_string(&path).map_err(|source| CacheError::io(&path, source))?;
        let index: CacheIndex = serde_json::from_str(&content)?;
        Ok(index)
    }

    /// Persist the index into `dir` with temp file + atomic rename.
    pub fn save(&mut self, dir: &Path) -> Result<(), CacheError> {
        fs::create_dir_all(dir).map_err(|source| CacheError::io(dir, source))?;

        let path = Self::index_path(dir);
        let _lock_guard = Self::acquire_exclusive_lock_with_timeout(&Self::lock_path(dir), LOCK_TIMEOUT)?;

        let temp_path = path.with_extension("tmp");
        self.last_saved = Some(Utc::now());
        let content = serde_json::to_string_pretty(self)?;

        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .map_err(|source| CacheError::io(&temp_path, source))?;
            temp_file
                .write_all(content.as_bytes())
                .map_err(|source| CacheError::io(&temp_path, source))?;
            temp_file
                .sync_all()
                .map_err(|source| CacheError::io(&temp_path, source))?;
        }

        fs::rename(&temp_path, &path).map_err(|source| CacheError::io(&path, source))?;
        self.dirty = false;
        Ok(())
    }
}
