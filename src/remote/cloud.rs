// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cloud-drive remote source.
//!
//! Listing goes through the drive's `file?method=list` endpoint, 200 entries
//! per page. Opening a file first resolves a short-lived download link
//! (`dlink`) through `multimedia?method=filemetas`, then streams from that
//! link with the client headers the drive expects.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{http_client, DirEntry, RemoteError, RemoteSource, RemoteStream};

/// Default cloud-drive REST base.
pub const DEFAULT_API_BASE: &str = "https://pan.baidu.com/rest/2.0/xpan";

/// Page size for directory listings.
const LIST_PAGE_SIZE: usize = 200;

const CLIENT_USER_AGENT: &str = "netdisk";
const CLIENT_REFERER: &str = "https://pan.baidu.com/";
const CLIENT_ORIGIN: &str = "https://pan.baidu.com";

/// Supplies a valid bearer token for each request.
///
/// Implementations own the refresh flow; callers never see an expired token.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, RemoteError>;
}

/// A fixed token, e.g. from the config file.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String, RemoteError> {
        if self.token.trim().is_empty() {
            return Err(RemoteError::Auth(
                "access token missing, complete the authorization flow first".to_string(),
            ));
        }
        Ok(self.token.clone())
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    errno: i64,
    #[serde(default)]
    list: Vec<ListItem>,
}

#[derive(Debug, Deserialize)]
struct ListItem {
    fs_id: u64,
    server_filename: String,
    #[serde(default)]
    isdir: u8,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct MetasResponse {
    #[serde(default)]
    errno: i64,
    #[serde(default)]
    list: Vec<FileMeta>,
}

#[derive(Debug, Deserialize)]
struct FileMeta {
    #[serde(default)]
    dlink: Option<String>,
}

/// Remote source backed by a cloud-drive account.
pub struct CloudDriveSource {
    api_base: String,
    tokens: Arc<dyn AccessTokenProvider>,
    client: reqwest::Client,
}

impl std::fmt::Debug for CloudDriveSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudDriveSource")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl CloudDriveSource {
    pub fn new(api_base: impl Into<String>, tokens: Arc<dyn AccessTokenProvider>) -> Result<Self, RemoteError> {
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            tokens,
            client: http_client()?,
        })
    }

    /// Resolve a streaming link for a file id.
    async fn download_link(&self, file_id: &str) -> Result<String, RemoteError> {
        let token = self.tokens.access_token().await?;
        let fsids = format!("[{}]", file_id);
        let response = self
            .client
            .get(format!("{}/multimedia", self.api_base))
            .query(&[
                ("method", "filemetas"),
                ("access_token", token.as_str()),
                ("fsids", fsids.as_str()),
                ("dlink", "1"),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RemoteError::Status(response.status().as_u16()));
        }

        let metas: MetasResponse = response.json().await?;
        if metas.errno != 0 {
            return Err(RemoteError::InvalidResponse(format!("dlink error {}", metas.errno)));
        }
        let dlink = metas
            .list
            .into_iter()
            .next()
            .and_then(|m| m.dlink)
            .ok_or_else(|| RemoteError::InvalidResponse("missing dlink".to_string()))?;

        Ok(with_access_token(&dlink, &token))
    }
}

/// Append `access_token` to a link unless it already carries one.
pub(crate) fn with_access_token(link: &str, token: &str) -> String {
    if link.contains("access_token=") {
        return link.to_string();
    }
    let separator = if link.contains('?') { '&' } else { '?' };
    format!("{}{}access_token={}", link, separator, token)
}

#[async_trait]
impl RemoteSource for CloudDriveSource {
    fn kind(&self) -> &'static str {
        "cloud_drive"
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>, RemoteError> {
        let token = self.tokens.access_token().await?;
        let mut entries = Vec::new();
        let mut start = 0usize;

        loop {
            let start_param = start.to_string();
            let limit_param = LIST_PAGE_SIZE.to_string();
            let response = self
                .client
                .get(format!("{}/file", self.api_base))
                .query(&[
                    ("method", "list"),
                    ("dir", path),
                    ("order", "name"),
                    ("web", "1"),
                    ("start", start_param.as_str()),
                    ("limit", limit_param.as_str()),
                    ("access_token", token.as_str()),
                ])
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(RemoteError::Status(response.status().as_u16()));
            }

            let page: ListResponse = response.json().await?;
            if page.errno != 0 {
                return Err(RemoteError::InvalidResponse(format!("list error {}", page.errno)));
            }
            let page_len = page.list.len();
            entries.extend(page.list.into_iter().map(|item| DirEntry {
                name: item.server_filename,
                is_directory: item.isdir == 1,
                size_bytes: item.size,
                stable_id: item.fs_id.to_string(),
            }));

            if page_len < LIST_PAGE_SIZE {
                break;
            }
            start += LIST_PAGE_SIZE;
        }

        tracing::debug!(path, count = entries.len(), "Listed cloud-drive directory");
        Ok(entries)
    }

    async fn open_file(&self, remote_ref: &str, range: Option<&str>) -> Result<RemoteStream, RemoteError> {
        let link = self.download_link(remote_ref).await?;
        let mut request = self
            .client
            .get(link)
            .header(reqwest::header::USER_AGENT, CLIENT_USER_AGENT)
            .header(reqwest::header::REFERER, CLIENT_REFERER)
            .header(reqwest::header::ORIGIN, CLIENT_ORIGIN);
        if let Some(range) = range {
            request = request.header(reqwest::header::RANGE, range);
        }
        let response = request.send().await?;
        Ok(RemoteStream::from_response(response))
    }
}
