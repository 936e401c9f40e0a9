// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Serving a complete local file with HTTP range support.

use std::io::SeekFrom;
use std::path::Path;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

/// What a `Range` header asks for, resolved against a file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// No range requested.
    Full,
    /// Inclusive byte span.
    Partial { start: u64, end: u64 },
    /// Malformed or outside the file.
    Unsatisfiable,
}

impl ByteRange {
    /// Resolve an optional `Range` header.
    ///
    /// Only a single `bytes=<start>-[<end>]` span is accepted. An omitted or
    /// too large `end` means the last byte.
    pub fn parse(header: Option<&str>, size: u64) -> Self {
        let Some(header) = header else {
            return ByteRange::Full;
        };
        let Some(spec) = header.trim().strip_prefix("bytes=") else {
            return ByteRange::Unsatisfiable;
        };
        let Some((start, end)) = spec.trim().split_once('-') else {
            return ByteRange::Unsatisfiable;
        };

        let Some(start) = parse_digits(start) else {
            return ByteRange::Unsatisfiable;
        };
        if start >= size {
            return ByteRange::Unsatisfiable;
        }
        let last = size - 1;
        let end = if end.trim().is_empty() {
            last
        } else {
            match parse_digits(end) {
                Some(end) => end.min(last),
                None => return ByteRange::Unsatisfiable,
            }
        };
        if end < start {
            return ByteRange::Unsatisfiable;
        }
        ByteRange::Partial { start, end }
    }
}

fn parse_digits(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Respond with `path` (or the requested slice of it).
///
/// 200 with the whole file without a range, 206 with `Content-Range` for a
/// satisfiable range, 416 with `Content-Range: bytes */<size>` otherwise.
/// `Accept-Ranges: bytes` and the given content type are always set.
pub async fn serve_file(path: &Path, range: Option<&str>, content_type: &str) -> std::io::Result<Response> {
    let mut file = File::open(path).await?;
    let size = file.metadata().await?.len();

    let response = match ByteRange::parse(range, size) {
        ByteRange::Full => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type.to_string()),
                (header::ACCEPT_RANGES, "bytes".to_string()),
                (header::CONTENT_LENGTH, size.to_string()),
            ],
            Body::from_stream(ReaderStream::new(file)),
        )
            .into_response(),
        ByteRange::Partial { start, end } => {
            let length = end - start + 1;
            file.seek(SeekFrom::Start(start)).await?;
            (
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::CONTENT_TYPE, content_type.to_string()),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                    (header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, size)),
                    (header::CONTENT_LENGTH, length.to_string()),
                ],
                Body::from_stream(ReaderStream::new(file.take(length))),
            )
                .into_response()
        }
        ByteRange::Unsatisfiable => (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [
                (header::CONTENT_TYPE, content_type.to_string()),
                (header::ACCEPT_RANGES, "bytes".to_string()),
                (header::CONTENT_RANGE, format!("bytes */{}", size)),
            ],
            Body::empty(),
        )
            .into_response(),
    };
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_range() {
        assert_eq!(ByteRange::parse(None, 1000), ByteRange::Full);
        assert_eq!(
            ByteRange::parse(Some("bytes=0-99"), 1000),
            ByteRange::Partial { start: 0, end: 99 }
        );
        assert_eq!(
            ByteRange::parse(Some("bytes=500-"), 1000),
            ByteRange::Partial { start: 500, end: 999 }
        );
        assert_eq!(
            ByteRange::parse(Some("bytes=900-5000"), 1000),
            ByteRange::Partial { start: 900, end: 999 }
        );
        assert_eq!(ByteRange::parse(Some("bytes=2000-"), 1000), ByteRange::Unsatisfiable);
        assert_eq!(ByteRange::parse(Some("bytes=1000-"), 1000), ByteRange::Unsatisfiable);
    }

    #[test]
    fn test_parse_range_rejects_malformed() {
        for header in ["bytes=-100", "bytes=a-b", "items=0-1", "bytes=0-1,5-6", "bytes=10-5", "bytes=", "0-99"] {
            assert_eq!(ByteRange::parse(Some(header), 1000), ByteRange::Unsatisfiable, "{}", header);
        }
        assert_eq!(ByteRange::parse(Some("bytes=0-"), 0), ByteRange::Unsatisfiable);
    }

    async fn thousand_byte_file() -> (TempDir, std::path::PathBuf) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("clip.mp4");
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &data).await.expect("write");
        (dir, path)
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body")
            .to_vec()
    }

    fn header_str<'a>(response: &'a Response, name: header::HeaderName) -> Option<&'a str> {
        response.headers().get(name).and_then(|v| v.to_str().ok())
    }

    #[tokio::test]
    async fn test_serve_partial() {
        let (_dir, path) = thousand_byte_file().await;
        let response = serve_file(&path, Some("bytes=0-99"), "video/mp4").await.expect("serve");
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(header_str(&response, header::CONTENT_RANGE), Some("bytes 0-99/1000"));
        assert_eq!(header_str(&response, header::CONTENT_LENGTH), Some("100"));
        assert_eq!(header_str(&response, header::ACCEPT_RANGES), Some("bytes"));
        assert_eq!(body_bytes(response).await.len(), 100);
    }

    #[tokio::test]
    async fn test_serve_partial_from_middle() {
        let (_dir, path) = thousand_byte_file().await;
        let response = serve_file(&path, Some("bytes=500-509"), "video/mp4").await.expect("serve");
        let body = body_bytes(response).await;
        let expected: Vec<u8> = (500..510u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(body, expected);
    }

    #[tokio::test]
    async fn test_serve_unsatisfiable() {
        let (_dir, path) = thousand_byte_file().await;
        let response = serve_file(&path, Some("bytes=2000-"), "video/mp4").await.expect("serve");
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(header_str(&response, header::CONTENT_RANGE), Some("bytes */1000"));
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_serve_full() {
        let (_dir, path) = thousand_byte_file().await;
        let response = serve_file(&path, None, "video/quicktime").await.expect("serve");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, header::CONTENT_LENGTH), Some("1000"));
        assert_eq!(header_str(&response, header::CONTENT_TYPE), Some("video/quicktime"));
        assert_eq!(body_bytes(response).await.len(), 1000);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let err = serve_file(&dir.path().join("gone.mp4"), None, "video/mp4")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
