use crate::{format_bytes, format_duration, Config, RenderRequest, RenderService};
use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "page-render")]
#[command(about = "Render web pages to PDF through a remote headless browser")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Remote browser WebSocket endpoint")]
    pub endpoint: Option<String>,

    #[arg(long, help = "Remote browser access token")]
    pub token: Option<String>,

    #[arg(long, help = "Cache blob directory")]
    pub cache_dir: Option<PathBuf>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, help = "Serve Prometheus metrics on this address")]
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Render a single URL to a PDF file
    Generate {
        #[arg(short, long, help = "URL to render")]
        url: String,

        #[arg(short, long, help = "Output file path (defaults to <host>.pdf)")]
        output: Option<PathBuf>,
    },

    /// Remove cache blobs that no index entry references
    Evict {
        #[arg(long, help = "Only remove blobs older than this many hours")]
        max_age_hours: Option<u64>,
    },

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

impl Cli {
    /// Overlay command-line flags onto `config`.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(endpoint) = &self.endpoint {
            config.browser.endpoint = Some(endpoint.clone());
        }
        if let Some(token) = &self.token {
            config.browser.token = Some(token.clone());
        }
        if let Some(dir) = &self.cache_dir {
            config.cache.directory = dir.clone();
        }
    }
}

pub struct CliRunner {
    pub config: Config,
    pub service: RenderService,
}

impl CliRunner {
    pub fn new(config: Config) -> Self {
        let service = RenderService::from_config(&config);
        Self { config, service }
    }

    pub async fn run(&self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Generate { url, output } => self.run_generate(&url, output).await,
            Commands::Evict { max_age_hours } => {
                let max_age = max_age_hours
                    .map(|hours| Duration::from_secs(hours * 3600))
                    .unwrap_or(self.config.cache.orphan_max_age);
                self.run_evict(max_age).await
            }
            Commands::Validate { config } => self.validate_config(&config).await,
        }
    }

    pub async fn run_generate(&self, url: &str, output: Option<PathBuf>) -> anyhow::Result<()> {
        let request = RenderRequest::parse(url)?;
        let output = output.unwrap_or_else(|| PathBuf::from(request.suggested_filename()));
        let started = Instant::now();

        info!("Generating document for: {}", request.url());
        let artifact = self.service.generate(&request).await?;
        let source = artifact.source;

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&output)
            .await
            .with_context(|| format!("creating {}", output.display()))?;
        let mut body = artifact.body;
        let mut size = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(body);

        let report = artifact.completion.wait().await;
        if let Some(Err(e)) = &report.cache_write {
            warn!("Document was not cached: {}", e);
        }

        println!("Document generated successfully:");
        println!("  URL: {}", request.url());
        println!("  Output: {}", output.display());
        println!("  Source: {}", source.as_str());
        println!("  Size: {}", format_bytes(size));
        println!("  Duration: {}", format_duration(started.elapsed()));

        Ok(())
    }

    pub async fn run_evict(&self, max_age: Duration) -> anyhow::Result<()> {
        info!(
            "Evicting orphan blobs older than {} from {}",
            format_duration(max_age),
            self.config.cache.directory.display()
        );

        let report = self.service.cache().evict_orphans(max_age).await?;

        println!("Eviction completed:");
        println!("  Scanned: {}", report.scanned);
        println!("  Removed: {}", report.removed);
        println!("  Freed: {}", format_bytes(report.bytes_freed));

        Ok(())
    }

    pub async fn validate_config(&self, config_path: &Path) -> anyhow::Result<()> {
        println!("Validating configuration: {}", config_path.display());

        let content = fs::read_to_string(config_path).await?;
        let mut config: Config = serde_json::from_str(&content)?;
        config.apply_env();
        config.validate()?;

        let endpoint = config.browser.connection_url()?;

        println!("Configuration is valid:");
        println!("  Browser endpoint: {}", endpoint.host_str().unwrap_or("-"));
        println!(
            "  Viewport: {}x{}",
            config.render.viewport.width, config.render.viewport.height
        );
        println!("  Navigation timeout: {:?}", config.render.navigation_timeout);
        println!("  Settlement timeout: {:?}", config.render.settlement_timeout);
        println!("  Cache directory: {}", config.cache.directory.display());
        println!("  Cache TTL: {}", format_duration(config.cache.ttl));

        Ok(())
    }
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}
