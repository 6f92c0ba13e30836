//! # Page Render
//!
//! Turns a web page into a downloadable PDF by driving a remote headless
//! Chrome over the DevTools protocol. Finished documents are kept in a
//! hybrid cache: a key/expiry index in front of durable blob files.
//!
//! A cache miss runs one render session:
//!
//! 1. connect to the remote browser and open a fresh page
//! 2. apply the render profile (user agent, viewport, print media)
//! 3. navigate and wait for image requests to settle
//! 4. print to a PDF returned as a protocol stream
//! 5. split that stream so the caller and the cache write read it together
//!
//! The session is released only after both readers are done with the stream.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use page_render::{Config, RenderRequest, RenderService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.apply_env();
//!
//!     let service = RenderService::from_config(&config);
//!     let request = RenderRequest::parse("https://example.com")?;
//!
//!     let mut artifact = service.generate(&request).await?;
//!     let mut size = 0;
//!     while let Some(chunk) = artifact.body.next().await {
//!         size += chunk?.len();
//!     }
//!     println!("{}: {} bytes", artifact.filename, size);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! page-render generate --url https://example.com --output example.pdf
//! page-render evict --max-age-hours 168
//! page-render validate --config render.json
//! ```

/// Configuration and settings for the render service
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Network-idle detection for image requests
pub mod settlement;

/// Render session lifecycle and lease handling
pub mod session;

/// Chrome DevTools implementation of the render backend
pub mod chrome;

/// Index plus blob-store document cache
pub mod cache;

/// Two-way stream fan-out
pub mod tee;

/// Request orchestration from cache lookup to session release
pub mod service;

/// Inbound request parsing and response metadata
pub mod request;

/// Metric names and Prometheus exporter
pub mod metrics;

/// Command-line interface implementation
pub mod cli;

/// Utility functions and helpers
pub mod utils;


pub use cache::{CacheIndex, CachedBlob, EvictionReport, HybridCache, MemoryIndex};
pub use chrome::ChromeBackend;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use crate::metrics::install_prometheus;
pub use request::{GeneratePayload, RenderRequest, PDF_CONTENT_TYPE};
pub use service::*;
pub use session::{RenderBackend, RenderSession, SessionLease, SessionState};
pub use settlement::{Settlement, SettlementDetector};
pub use tee::{tee, SinkState, SourceOutcome, TeeReport};
pub use utils::*;
