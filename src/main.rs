use anyhow::Context;
use clap::Parser;
use page_render::{install_prometheus, setup_logging, Cli, CliRunner, Config};
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting page-render v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await?;

    if let Some(addr) = args.metrics_addr {
        install_prometheus(addr)?;
    }

    let cli_runner = CliRunner::new(config);

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);

    let result = tokio::select! {
        result = cli_runner.run(args.command) => result,
        _ = shutdown_rx.recv() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    info!("page-render stopped");
    Ok(())
}

/// File, then `RENDER_*` environment, then command-line flags.
async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = if let Some(config_path) = &args.config {
        let content = tokio::fs::read_to_string(config_path)
            .await
            .with_context(|| format!("reading {}", config_path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", config_path.display()))?
    } else {
        Config::default()
    };

    config.apply_env();
    args.apply_overrides(&mut config);
    config.validate()?;

    match config.browser.connection_url() {
        Ok(url) => info!("Remote browser: {}", url.host_str().unwrap_or("-")),
        Err(e) => warn!("{}", e),
    }
    info!("Cache directory: {}", config.cache.directory.display());

    Ok(config)
}

fn setup_shutdown_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("Could not install SIGTERM handler: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        let _ = shutdown_tx.send(());
    })
}
