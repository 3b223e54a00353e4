//! Drawbridge: an HTTPS server with graceful shutdown.
//!
//! This is the application entry point. It loads configuration from a TOML
//! file, initializes tracing, builds the site router and runs the launcher
//! until the server has drained or failed.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use drawbridge::config::{AppConfig, LogFormat, DEFAULT_CONFIG_PATH, DEFAULT_LOG_FILTER};
use drawbridge::routes::create_router;
use drawbridge::{Launcher, ServeOutcome};

/// Drawbridge: HTTPS with automatic certificates and graceful shutdown
#[derive(Parser, Debug)]
#[command(name = "drawbridge", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level filter (e.g., "drawbridge=debug,tower_http=info")
    #[arg(short, long)]
    log_level: Option<String>,
}

fn init_tracing(filter: &str, format: LogFormat) {
    let registry = tracing_subscriber::registry().with(EnvFilter::new(filter));

    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Priority: CLI > env > default
    let log_filter = args
        .log_level
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

    let config = match AppConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(&log_filter, LogFormat::Text);
            tracing::error!(error = %e, path = %args.config, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&log_filter, config.logging.format);
    tracing::info!(path = %args.config, "Loaded configuration");

    let server_config = match config.http.server_config() {
        Ok(server_config) => server_config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid server configuration");
            return ExitCode::FAILURE;
        }
    };

    let app = create_router(&config.site);

    ServeOutcome::from(Launcher::new(app, server_config).serve().await).report()
}
