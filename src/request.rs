//! Inbound request parsing and response metadata
//!
//! The route accepts a JSON body of exactly `{ "url": "..." }`. Anything else
//! is rejected with a validation error before the pipeline is touched.

use crate::utils::{sanitize_filename, validate_url};
use crate::GenerateError;
use serde::{Deserialize, Serialize};
use url::Url;

pub const PDF_CONTENT_TYPE: &str = "application/pdf";
const FALLBACK_FILENAME: &str = "document.pdf";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GeneratePayload {
    pub url: String,
}

/// A validated render request. The URL as submitted doubles as the cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    key: String,
    url: Url,
}

impl RenderRequest {
    pub fn parse(url: &str) -> Result<Self, GenerateError> {
        let parsed = validate_url(url)?;
        Ok(Self {
            key: url.trim().to_string(),
            url: parsed,
        })
    }

    /// Parse a JSON request body.
    pub fn from_json(body: &[u8]) -> Result<Self, GenerateError> {
        let payload: GeneratePayload = serde_json::from_slice(body)?;
        Self::parse(&payload.url)
    }

    pub fn cache_key(&self) -> &str {
        &self.key
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// `<host>.pdf`, or `document.pdf` when the URL has no usable host.
    pub fn suggested_filename(&self) -> String {
        self.url
            .host_str()
            .map(sanitize_filename)
            .filter(|host| !host.is_empty())
            .map(|host| format!("{host}.pdf"))
            .unwrap_or_else(|| FALLBACK_FILENAME.to_string())
    }
}

pub fn content_disposition(filename: &str) -> String {
    format!("attachment; filename=\"{}\"", filename.replace('"', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_parse_valid_payload() {
        let request = RenderRequest::from_json(br#"{"url":"https://example.com/a?b=c"}"#).unwrap();
        assert_eq!(request.cache_key(), "https://example.com/a?b=c");
        assert_eq!(request.url().host_str(), Some("example.com"));
    }

    #[test]
    fn test_rejects_unexpected_fields() {
        let err = RenderRequest::from_json(br#"{"url":"https://example.com","format":"A4"}"#)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_rejects_missing_or_empty_url() {
        assert!(RenderRequest::from_json(br#"{}"#).is_err());
        assert!(RenderRequest::from_json(br#"{"url":""}"#).is_err());
        assert!(RenderRequest::from_json(br#"{"url":"not a url"}"#).is_err());
        assert!(RenderRequest::from_json(b"garbage").is_err());
    }

    #[test]
    fn test_suggested_filename() {
        let request = RenderRequest::parse("https://docs.example.com/guide").unwrap();
        assert_eq!(request.suggested_filename(), "docs.example.com.pdf");

        let request = RenderRequest::parse("http://[::1]:8080/").unwrap();
        assert_eq!(request.suggested_filename(), "[__1].pdf");
    }

    #[test]
    fn test_content_disposition() {
        assert_eq!(
            content_disposition("example.com.pdf"),
            "attachment; filename=\"example.com.pdf\""
        );
    }
}
