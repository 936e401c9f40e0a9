// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! LAN file-server remote source (client side of [`crate::lanserver`]).

use async_trait::async_trait;
use serde::Deserialize;

use super::{http_client, DirEntry, RemoteError, RemoteSource, RemoteStream};

/// Header carrying the shared token.
pub const AUTH_HEADER: &str = "x-auth-token";

/// Normalize a relative path to a rooted forward-slash form.
///
/// Backslashes become slashes, a leading slash is added, repeated slashes
/// collapse. Empty input is the root.
pub fn normalize_rel_path(path: &str) -> String {
    if path.trim().is_empty() {
        return "/".to_string();
    }
    let replaced = path.replace('\\', "/");
    let mut normalized = String::with_capacity(replaced.len() + 1);
    if !replaced.starts_with('/') {
        normalized.push('/');
    }
    let mut previous_slash = false;
    for c in replaced.chars() {
        if c == '/' {
            if previous_slash {
                continue;
            }
            previous_slash = true;
        } else {
            previous_slash = false;
        }
        normalized.push(c);
    }
    normalized
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    entries: Vec<ListEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListEntry {
    name: String,
    path: String,
    #[serde(default)]
    is_dir: bool,
    #[serde(default)]
    size: u64,
}

/// Remote source backed by a token-authenticated LAN file server.
#[derive(Debug, Clone)]
pub struct LanFileSource {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl LanFileSource {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, RemoteError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            base_url,
            token: token.filter(|t| !t.is_empty()),
            client: http_client()?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, endpoint: &str, path: &str) -> Result<reqwest::RequestBuilder, RemoteError> {
        if self.base_url.is_empty() {
            return Err(RemoteError::NotConfigured("LAN base URL is empty".to_string()));
        }
        let mut request = self
            .client
            .get(format!("{}{}", self.base_url, endpoint))
            .query(&[("path", normalize_rel_path(path))]);
        if let Some(token) = &self.token {
            request = request.header(AUTH_HEADER, token);
        }
        Ok(request)
    }
}

#[async_trait]
impl RemoteSource for LanFileSource {
    fn kind(&self) -> &'static str {
        "lan"
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>, RemoteError> {
        let response = self.request("/api/list", path)?.send().await?;
        match response.status().as_u16() {
            200..=299 => {}
            401 => return Err(RemoteError::Auth("LAN server rejected token".to_string())),
            status => return Err(RemoteError::Status(status)),
        }

        let list: ListResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(format!("list failed: {}", e)))?;
        Ok(list
            .entries
            .into_iter()
            .map(|e| DirEntry {
                name: e.name,
                is_directory: e.is_dir,
                size_bytes: e.size,
                stable_id: e.path,
            })
            .collect())
    }

    async fn open_file(&self, remote_ref: &str, range: Option<&str>) -> Result<RemoteStream, RemoteError> {
        let mut request = self.request("/file", remote_ref)?;
        if let Some(range) = range {
            request = request.header(reqwest::header::RANGE, range);
        }
        let response = request.send().await?;
        if response.status().as_u16() == 401 {
            return Err(RemoteError::Auth("LAN server rejected token".to_string()));
        }
        Ok(RemoteStream::from_response(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_rel_path() {
        assert_eq!(normalize_rel_path(""), "/");
        assert_eq!(normalize_rel_path("   "), "/");
        assert_eq!(normalize_rel_path("Kids\\Cartoons\\1.mp4"), "/Kids/Cartoons/1.mp4");
        assert_eq!(normalize_rel_path("//a///b/"), "/a/b/");
        assert_eq!(normalize_rel_path("/already/ok.mov"), "/already/ok.mov");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let source = LanFileSource::new("http://192.168.1.5:18080///", Some(String::new())).expect("source");
        assert_eq!(source.base_url(), "http://192.168.1.5:18080");
        assert!(source.token.is_none());
    }

    #[tokio::test]
    async fn test_empty_base_url_is_not_configured() {
        let source = LanFileSource::new("", None).expect("source");
        let err = source.open_file("/a.mp4", None).await.unwrap_err();
        assert!(matches!(err, RemoteError::NotConfigured(_)));
    }

    #[test]
    fn test_list_entry_parses_server_shape() {
        let list: ListResponse = serde_json::from_str(
            r#"{"path":"/","entries":[{"name":"a.mp4","path":"/a.mp4","isDir":false,"size":10,"mtimeMs":1.5}]}"#,
        )
        .expect("parse");
        assert_eq!(list.entries[0].path, "/a.mp4");
        assert_eq!(list.entries[0].size, 10);
    }
}
