//! Configuration management with serde serialization/deserialization
//!
//! This module provides the configuration structures for the render service:
//! the remote browser endpoint, the fixed render profile, and the hybrid cache.

use crate::GenerateError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const ENV_BROWSER_ENDPOINT: &str = "RENDER_BROWSER_ENDPOINT";
pub const ENV_BROWSER_TOKEN: &str = "RENDER_BROWSER_TOKEN";
pub const ENV_CACHE_DIR: &str = "RENDER_CACHE_DIR";

/// Main configuration structure for the render service
///
/// # Examples
///
/// ```rust
/// use page_render::Config;
///
/// let config = Config::default();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Remote browser-automation service connection
    pub browser: RemoteBrowserConfig,

    /// Fixed render profile applied to every page
    pub render: RenderProfile,

    /// Blob directory and expiry settings for the hybrid cache
    pub cache: CacheConfig,

    /// Number of chunks each tee sink may buffer before the source is paused (default: 16)
    ///
    /// The slower of the two consumers sets the pace once this window fills.
    pub tee_buffer_chunks: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            browser: RemoteBrowserConfig::default(),
            render: RenderProfile::default(),
            cache: CacheConfig::default(),
            tee_buffer_chunks: 16,
        }
    }
}

impl Config {
    /// Overlay values from `RENDER_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var(name).ok());
    }

    fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = lookup(ENV_BROWSER_ENDPOINT).filter(|v| !v.is_empty()) {
            self.browser.endpoint = Some(endpoint);
        }
        if let Some(token) = lookup(ENV_BROWSER_TOKEN).filter(|v| !v.is_empty()) {
            self.browser.token = Some(token);
        }
        if let Some(dir) = lookup(ENV_CACHE_DIR).filter(|v| !v.is_empty()) {
            self.cache.directory = PathBuf::from(dir);
        }
    }

    /// Sanity checks on numeric settings. The remote endpoint is checked
    /// separately by [`RemoteBrowserConfig::connection_url`] so a missing
    /// credential disables rendering without refusing to start.
    pub fn validate(&self) -> Result<(), GenerateError> {
        let profile = &self.render;

        if profile.navigation_timeout.is_zero() {
            return Err(GenerateError::Configuration(
                "Navigation timeout must be greater than 0".into(),
            ));
        }

        if profile.settlement_timeout.is_zero() {
            return Err(GenerateError::Configuration(
                "Settlement timeout must be greater than 0".into(),
            ));
        }

        if profile.viewport.width == 0 || profile.viewport.height == 0 {
            return Err(GenerateError::Configuration(
                "Viewport dimensions must be greater than 0".into(),
            ));
        }

        if self.tee_buffer_chunks == 0 {
            return Err(GenerateError::Configuration(
                "Tee buffer must hold at least one chunk".into(),
            ));
        }

        if self.cache.ttl.is_zero() {
            return Err(GenerateError::Configuration(
                "Cache TTL must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

/// Connection settings for the remote browser-automation service
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RemoteBrowserConfig {
    /// Websocket endpoint, e.g. `wss://chrome.example.net`
    pub endpoint: Option<String>,

    /// Auth token appended to the endpoint as the `token` query parameter
    pub token: Option<String>,
}

impl RemoteBrowserConfig {
    /// Build the connection string for the remote service.
    ///
    /// Missing or malformed values produce [`GenerateError::Configuration`].
    ///
    /// ```rust
    /// use page_render::RemoteBrowserConfig;
    ///
    /// let remote = RemoteBrowserConfig {
    ///     endpoint: Some("wss://chrome.example.net".into()),
    ///     token: Some("secret".into()),
    /// };
    /// let url = remote.connection_url().unwrap();
    /// assert_eq!(url.as_str(), "wss://chrome.example.net/?token=secret");
    /// ```
    pub fn connection_url(&self) -> Result<Url, GenerateError> {
        let endpoint = self
            .endpoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| {
                GenerateError::Configuration(format!(
                    "remote browser endpoint is not set ({ENV_BROWSER_ENDPOINT})"
                ))
            })?;
        let token = self
            .token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                GenerateError::Configuration(format!(
                    "remote browser token is not set ({ENV_BROWSER_TOKEN})"
                ))
            })?;

        let mut url = Url::parse(endpoint).map_err(|e| {
            GenerateError::Configuration(format!("invalid remote browser endpoint: {e}"))
        })?;

        match url.scheme() {
            "ws" | "wss" | "http" | "https" => {}
            other => {
                return Err(GenerateError::Configuration(format!(
                    "unsupported remote browser scheme: {other}"
                )))
            }
        }

        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }
}

/// The fixed render profile
///
/// Every page is loaded with the same user agent and viewport, waits for
/// image activity to settle, and is captured with print media emulation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RenderProfile {
    /// User-Agent presented to the target site
    pub user_agent: String,

    /// Browser viewport used for layout before printing
    pub viewport: Viewport,

    /// Hard limit for page navigation (default: 30 seconds)
    ///
    /// Exceeding it fails the request with a navigation timeout.
    pub navigation_timeout: Duration,

    /// Soft limit for image settlement (default: 10 seconds)
    ///
    /// Exceeding it is logged and the capture proceeds anyway.
    pub settlement_timeout: Duration,

    /// Quiet window re-checked after each image finishes (default: 500ms)
    pub settlement_debounce: Duration,

    /// Fixed pause between settlement and capture (default: 1 second)
    pub settle_delay: Duration,

    /// Include CSS backgrounds in the printed document (default: true)
    pub print_background: bool,
}

impl Default for RenderProfile {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36"
                .to_string(),
            viewport: Viewport::default(),
            navigation_timeout: Duration::from_secs(30),
            settlement_timeout: Duration::from_secs(10),
            settlement_debounce: Duration::from_millis(500),
            settle_delay: Duration::from_secs(1),
            print_background: true,
        }
    }
}

/// Browser viewport configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1280)
    pub width: u32,

    /// Viewport height in pixels (default: 800)
    pub height: u32,

    /// Device pixel ratio (default: 1.0)
    pub device_scale_factor: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 800,
            device_scale_factor: 1.0,
        }
    }
}

/// Hybrid cache settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Directory holding blob files (default: `./cache`)
    pub directory: PathBuf,

    /// Lifetime of an index entry (default: 24 hours)
    pub ttl: Duration,

    /// Unreferenced blobs older than this are removed by `evict` (default: 7 days)
    pub orphan_max_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("cache"),
            ttl: Duration::from_secs(24 * 60 * 60),
            orphan_max_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}
