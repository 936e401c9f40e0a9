// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration for reelcache.
//!
//! Settings are read from `~/.reelcache/config.json` (or an explicit path)
//! and then overridden by environment variables, so a deployment can keep a
//! config file and still tweak the cache budget from its service unit.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default cache budget in gigabytes.
pub const DEFAULT_CACHE_MAX_GB: f64 = 8.0;

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 3000;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cache: CacheSettings,
    /// Remote source the videos live on.
    #[serde(default)]
    pub source: Option<SourceConfig>,
    /// Catalog file (categories and videos).
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,
    /// Optional JSON-lines sink for cache events.
    #[serde(default)]
    pub event_log_path: Option<PathBuf>,
}

/// Cache budget and placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Capacity in bytes. Takes precedence over `max_gb`; zero disables caching.
    #[serde(default)]
    pub max_bytes: Option<u64>,
    /// Capacity in gigabytes (GiB).
    #[serde(default)]
    pub max_gb: Option<f64>,
    /// Directory holding cached files and the index.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Speculatively cache the next video of the playlist.
    #[serde(default = "default_prefetch_next")]
    pub prefetch_next: bool,
}

/// Which remote source to stream from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Cloud drive reached with a bearer token.
    CloudDrive {
        #[serde(default = "default_cloud_api_base")]
        api_base: String,
        access_token: String,
    },
    /// LAN file server reached with a shared token header.
    Lan {
        base_url: String,
        #[serde(default)]
        token: Option<String>,
    },
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_prefetch_next() -> bool {
    true
}

fn default_cloud_api_base() -> String {
    crate::remote::cloud::DEFAULT_API_BASE.to_string()
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_bytes: None,
            max_gb: None,
            dir: None,
            prefetch_next: default_prefetch_next(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            cache: CacheSettings::default(),
            source: None,
            catalog_path: None,
            event_log_path: None,
        }
    }
}

impl CacheSettings {
    /// Effective capacity in bytes.
    ///
    /// A byte count wins, then a gigabyte count, then the 8 GiB default.
    /// An explicit zero in either field disables caching.
    pub fn capacity_bytes(&self) -> u64 {
        if let Some(bytes) = self.max_bytes {
            return bytes;
        }
        let gb = self
            .max_gb
            .filter(|g| g.is_finite() && *g >= 0.0)
            .unwrap_or(DEFAULT_CACHE_MAX_GB);
        (gb * BYTES_PER_GB) as u64
    }

    /// Effective cache directory.
    pub fn cache_dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| default_data_dir().join("cache"))
    }
}

impl Config {
    /// Catalog file, defaulting to `~/.reelcache/catalog.json`.
    pub fn catalog_path(&self) -> PathBuf {
        self.catalog_path
            .clone()
            .unwrap_or_else(|| default_data_dir().join("catalog.json"))
    }

    /// Apply environment overrides on top of file values.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("BIND_ADDRESS").filter(|v| !v.trim().is_empty()) {
            self.bind_address = addr;
        }
        if let Some(port) = lookup("PORT").and_then(|v| v.trim().parse().ok()) {
            self.port = port;
        }
        if let Some(bytes) = lookup("CACHE_MAX_BYTES").and_then(|v| v.trim().parse().ok()) {
            self.cache.max_bytes = Some(bytes);
        }
        if let Some(gb) = lookup("CACHE_MAX_GB").and_then(|v| v.trim().parse().ok()) {
            self.cache.max_gb = Some(gb);
        }
        if let Some(dir) = lookup("CACHE_DIR").filter(|v| !v.trim().is_empty()) {
            self.cache.dir = Some(PathBuf::from(dir));
        }
        if let Some(flag) = lookup("PREFETCH_NEXT") {
            self.cache.prefetch_next = !flag.trim().eq_ignore_ascii_case("false");
        }
        if let Some(path) = lookup("CATALOG_PATH").filter(|v| !v.trim().is_empty()) {
            self.catalog_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("EVENT_LOG_PATH").filter(|v| !v.trim().is_empty()) {
            self.event_log_path = Some(PathBuf::from(path));
        }
    }
}

/// `~/.reelcache`, or `./.reelcache` when no home directory is available.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".reelcache"))
        .unwrap_or_else(|| PathBuf::from(".reelcache"))
}

/// Default config file location.
pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.json")
}

/// Load configuration from `path` (or the default location), then apply
/// environment overrides. A missing file yields defaults.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    let mut config = if path.exists() {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?
    } else {
        Config::default()
    };

    config.apply_env();
    Ok(config)
}

/// Write configuration as pretty JSON.
pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content).with_context(|| format!("Failed to write config file: {:?}", path))?;
    Ok(())
}
