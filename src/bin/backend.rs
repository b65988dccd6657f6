use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use yt_premium::{
    api::{self, API_PREFIX, AppState},
    config::{self, DEFAULT_CONFIG_PATH},
    schedule::SudoCronHost,
    security::ensure_not_root,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "YouTube download and subscription API.")]
struct Cli {
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the TOML config file")]
    config: PathBuf,
    #[arg(long = "host", value_name = "ADDR", help = "Override the listen address")]
    host: Option<String>,
    #[arg(long = "port", value_name = "PORT", help = "Override the listen port")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    ensure_not_root("backend")?;

    let mut cfg = config::load_config_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(host) = cli.host {
        cfg.host = host;
    }
    if let Some(port) = cli.port {
        cfg.port = port;
    }

    let host = Arc::new(SudoCronHost::from_config(&cfg));
    let state = AppState::new(&cfg, host).context("initializing subscription store")?;
    let app = api::router(state);

    let addr = SocketAddr::new(cfg.host.parse()?, cfg.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(%addr, prefix = API_PREFIX, data_dir = %cfg.data_dir.display(), "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("yt_premium=info,backend=info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|value| value.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(filter)
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
}
