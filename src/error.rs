//! Error taxonomy for the render pipeline
//!
//! Every failure is tagged with an [`ErrorKind`] at the point where it happens.
//! Callers branch on the kind, never on the message text.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum GenerateError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Upstream connection failed: {0}")]
    UpstreamConnection(String),

    #[error("Navigation to {url} timed out after {timeout:?}")]
    NavigationTimeout { url: String, timeout: Duration },

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Render failed: {0}")]
    Render(String),

    #[error("Stream aborted: {0}")]
    Stream(String),

    #[error("Cache write failed: {0}")]
    CacheWrite(String),

    #[error("Cache read failed: {0}")]
    CacheRead(String),

    #[error("IO error: {0}")]
    Io(String),
}

/// Structured tag for a [`GenerateError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Validation,
    UpstreamConnection,
    NavigationTimeout,
    Navigation,
    Render,
    Stream,
    CacheWrite,
    CacheRead,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Validation => "validation",
            ErrorKind::UpstreamConnection => "upstream_connection",
            ErrorKind::NavigationTimeout => "navigation_timeout",
            ErrorKind::Navigation => "navigation",
            ErrorKind::Render => "render",
            ErrorKind::Stream => "stream",
            ErrorKind::CacheWrite => "cache_write",
            ErrorKind::CacheRead => "cache_read",
            ErrorKind::Io => "io",
        }
    }
}

impl GenerateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GenerateError::Configuration(_) => ErrorKind::Configuration,
            GenerateError::Validation(_) => ErrorKind::Validation,
            GenerateError::UpstreamConnection(_) => ErrorKind::UpstreamConnection,
            GenerateError::NavigationTimeout { .. } => ErrorKind::NavigationTimeout,
            GenerateError::Navigation(_) => ErrorKind::Navigation,
            GenerateError::Render(_) => ErrorKind::Render,
            GenerateError::Stream(_) => ErrorKind::Stream,
            GenerateError::CacheWrite(_) => ErrorKind::CacheWrite,
            GenerateError::CacheRead(_) => ErrorKind::CacheRead,
            GenerateError::Io(_) => ErrorKind::Io,
        }
    }

    /// HTTP status category surfaced to the caller.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            _ => 500,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let (error, details) = match self {
            GenerateError::Configuration(d) => ("Service is not configured", Some(d.clone())),
            GenerateError::Validation(d) => ("Invalid request", Some(d.clone())),
            GenerateError::UpstreamConnection(d) => {
                ("Could not reach the rendering service", Some(d.clone()))
            }
            GenerateError::NavigationTimeout { url, timeout } => (
                "Page took too long to load",
                Some(format!("{url} did not load within {timeout:?}")),
            ),
            GenerateError::Navigation(d) => ("Page could not be loaded", Some(d.clone())),
            GenerateError::Render(d) => ("Failed to generate document", Some(d.clone())),
            GenerateError::Stream(d) => ("Document stream was interrupted", Some(d.clone())),
            GenerateError::CacheWrite(d) | GenerateError::CacheRead(d) => {
                ("Cache unavailable", Some(d.clone()))
            }
            GenerateError::Io(d) => ("Internal error", Some(d.clone())),
        };

        ErrorBody {
            error: error.to_string(),
            details,
        }
    }
}

/// JSON error payload returned with a non-success status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<std::io::Error> for GenerateError {
    fn from(err: std::io::Error) -> Self {
        GenerateError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for GenerateError {
    fn from(err: serde_json::Error) -> Self {
        GenerateError::Validation(err.to_string())
    }
}
