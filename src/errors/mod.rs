// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Client-facing error handling.
//!
//! Only failures that happen while actively serving a client reach this
//! module; cache and pipeline failures are absorbed and logged where they
//! occur. Every error carries a reference code that is also written to the
//! log together with the (sanitized) internal details, so a support request
//! quoting the code can be matched to the log line.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use crate::remote::RemoteError;

/// Generate a unique error reference code.
/// Format: ERR-YYYYMMDD-XXXXXX (e.g., ERR-20240115-A3F8K2)
pub fn generate_reference_code() -> String {
    let date = Utc::now().format("%Y%m%d");
    let mut rng = rand::thread_rng();
    let chars: Vec<char> = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789".chars().collect();
    let random: String = (0..6)
        .map(|_| chars[rng.gen_range(0..chars.len())])
        .collect();
    format!("ERR-{}-{}", date, random)
}

/// Error types for client-facing responses.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum UserError {
    /// Invalid request from client (400)
    InvalidRequest {
        message: String,
        reference: String,
        field: Option<String>,
    },

    /// Unknown video or route (404)
    NotFound {
        message: String,
        reference: String,
    },

    /// Remote source failed while streaming live (502)
    BadGateway {
        message: String,
        reference: String,
    },

    /// No remote source configured (503)
    ServiceUnavailable {
        message: String,
        reference: String,
    },

    /// Local failure while serving (500)
    InternalError {
        message: String,
        reference: String,
    },
}

impl UserError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            UserError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            UserError::NotFound { .. } => StatusCode::NOT_FOUND,
            UserError::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            UserError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            UserError::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn reference(&self) -> &str {
        match self {
            UserError::InvalidRequest { reference, .. }
            | UserError::NotFound { reference, .. }
            | UserError::BadGateway { reference, .. }
            | UserError::ServiceUnavailable { reference, .. }
            | UserError::InternalError { reference, .. } => reference,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            UserError::InvalidRequest { message, .. }
            | UserError::NotFound { message, .. }
            | UserError::BadGateway { message, .. }
            | UserError::ServiceUnavailable { message, .. }
            | UserError::InternalError { message, .. } => message,
        }
    }
}

/// JSON body of an error response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: UserError,
    pub status: u16,
}

impl IntoResponse for UserError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let response = ErrorResponse {
            status: status.as_u16(),
            error: self,
        };

        let body = serde_json::to_string(&response).unwrap_or_else(|_| {
            r#"{"error":{"error_type":"internal_error","message":"An unexpected error occurred","reference":"ERR-FALLBACK"},"status":500}"#.to_string()
        });

        (status, [("content-type", "application/json")], body).into_response()
    }
}

impl UserError {
    pub fn invalid_request(user_message: &str, field: Option<&str>) -> Self {
        let reference = generate_reference_code();
        tracing::warn!(reference = %reference, field = ?field, "Invalid request: {}", user_message);

        Self::InvalidRequest {
            message: user_message.to_string(),
            reference,
            field: field.map(|s| s.to_string()),
        }
    }

    pub fn not_found(resource: &str) -> Self {
        let reference = generate_reference_code();
        tracing::info!(reference = %reference, resource = %resource, "Resource not found");

        Self::NotFound {
            message: format!("The requested {} was not found.", resource),
            reference,
        }
    }

    /// Live streaming failed upstream. The sanitized diagnostic is returned
    /// to the client.
    pub fn bad_gateway(internal_details: &str) -> Self {
        let reference = generate_reference_code();
        let sanitized = sanitize_error_details(internal_details);
        tracing::error!(reference = %reference, internal_details = %sanitized, "Live stream failed");

        Self::BadGateway {
            message: format!("Unable to stream from the remote source: {}", sanitized),
            reference,
        }
    }

    pub fn service_unavailable(internal_details: &str) -> Self {
        let reference = generate_reference_code();
        let sanitized = sanitize_error_details(internal_details);
        tracing::error!(reference = %reference, internal_details = %sanitized, "Service unavailable");

        Self::ServiceUnavailable {
            message: "No remote source is configured. Please check the server configuration.".to_string(),
            reference,
        }
    }

    /// Never exposes internal details to the client.
    pub fn internal_error(internal_error: &str) -> Self {
        let reference = generate_reference_code();
        let sanitized = sanitize_error_details(internal_error);
        tracing::error!(reference = %reference, internal_error = %sanitized, "Internal server error");

        Self::InternalError {
            message: format!("An internal error occurred. Reference: {}", reference),
            reference,
        }
    }
}

impl From<RemoteError> for UserError {
    fn from(error: RemoteError) -> Self {
        match error {
            RemoteError::NotConfigured(_) => UserError::service_unavailable(&error.to_string()),
            other => UserError::bad_gateway(&other.to_string()),
        }
    }
}

/// Map a local I/O failure while serving.
pub fn map_io_error(error: &std::io::Error) -> UserError {
    match error.kind() {
        std::io::ErrorKind::NotFound => UserError::not_found("file"),
        _ => UserError::internal_error(&error.to_string()),
    }
}

/// Patterns for scrubbing secrets and host details from diagnostics.
static SANITIZE_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        // File paths (Windows and Unix)
        (Regex::new(r"[A-Za-z]:\\[^\s]+").expect("Windows path regex"), "[PATH_REDACTED]"),
        (Regex::new(r"/(?:home|usr|var|etc|opt|tmp|root|srv|mnt)/[^\s]+").expect("Unix path regex"), "[PATH_REDACTED]"),

        // IP addresses
        (Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").expect("IPv4 regex"), "[IP_REDACTED]"),

        // Tokens carried in URLs and headers
        (Regex::new(r"(?i)access_token=[^\s&]+").expect("Access token regex"), "access_token=[TOKEN_REDACTED]"),
        (Regex::new(r"(?i)x-auth-token:\s*[^\s]+").expect("LAN token regex"), "x-auth-token: [TOKEN_REDACTED]"),
        (Regex::new(r"Bearer [a-zA-Z0-9-._~+/]+=*").expect("Bearer token regex"), "Bearer [TOKEN_REDACTED]"),

        // Stack traces
        (Regex::new(r"at [^\s]+\.rs:\d+:\d+").expect("Rust location regex"), "[LOCATION_REDACTED]"),
        (Regex::new(r"stack backtrace:[\s\S]*").expect("Stack trace regex"), "[STACK_TRACE_REDACTED]"),

        // Generic long alphanumeric strings (potential secrets)
        (Regex::new(r"\b[A-Za-z0-9]{40,}\b").expect("Long secret regex"), "[SECRET_REDACTED]"),
    ]
});

/// Remove paths, addresses and credentials from an error message.
pub fn sanitize_error_details(error: &str) -> String {
    let mut result = error.to_string();
    for (pattern, replacement) in SANITIZE_PATTERNS.iter() {
        result = pattern.replace_all(&result, *replacement).to_string();
    }
    result
}

/// Result type that uses UserError for the error variant.
pub type ApiResult<T> = Result<T, UserError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_reference_code() {
        let code = generate_reference_code();
        assert!(code.starts_with("ERR-"));
        assert_eq!(code.len(), 19); // ERR-YYYYMMDD-XXXXXX = 4+8+1+6

        let code2 = generate_reference_code();
        assert_ne!(code, code2);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(UserError::invalid_request("bad", None).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(UserError::not_found("video").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(UserError::bad_gateway("reset").status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            UserError::service_unavailable("no source").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            UserError::internal_error("disk").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_bad_gateway_carries_sanitized_diagnostic() {
        let err = UserError::bad_gateway(
            "error sending request for url (https://d.pcs.example/file?fid=1&access_token=abc123): connection refused",
        );
        let message = err.message();
        assert!(message.contains("connection refused"));
        assert!(!message.contains("abc123"));
        assert!(message.contains("[TOKEN_REDACTED]"));
    }

    #[test]
    fn test_sanitize_paths_and_ips() {
        let sanitized = sanitize_error_details("open /srv/cache/12.mp4 via 192.168.1.100:18080");
        assert!(!sanitized.contains("/srv/cache"));
        assert!(!sanitized.contains("192.168.1.100"));
        assert!(sanitized.contains("[PATH_REDACTED]"));
        assert!(sanitized.contains("[IP_REDACTED]"));

        let sanitized = sanitize_error_details(r"Error at D:\KidsVideos\a.mp4");
        assert!(sanitized.contains("[PATH_REDACTED]"));
    }

    #[test]
    fn test_internal_error_never_exposes_details() {
        let user_error = UserError::internal_error("read failed on /home/family/cache/3.mov");
        let message = user_error.message();
        assert!(!message.contains("/home/family"));
        assert!(message.contains("Reference:"));
    }

    #[test]
    fn test_remote_error_mapping() {
        let err: UserError = RemoteError::Status(503).into();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert!(err.message().contains("HTTP 503"));

        let err: UserError = RemoteError::NotConfigured("no source".into()).into();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_map_io_error() {
        let err = map_io_error(&std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        let err = map_io_error(&std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_user_error_serialization() {
        let error = UserError::invalid_request("Bad input", Some("range"));
        let json = serde_json::to_string(&error).expect("serialize");
        assert!(json.contains("invalid_request"));
        assert!(json.contains("Bad input"));
        assert!(json.contains("range"));
        assert!(json.contains("reference"));
    }
}
