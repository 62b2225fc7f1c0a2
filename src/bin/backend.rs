#![forbid(unsafe_code)]

//! Axum backend serving the directory-backed video catalog.

use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use videoteca::{
    config::{DEFAULT_CONFIG_PATH, Overrides, load_settings},
    server::{AppState, router},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve a personal video catalog over HTTP.")]
struct Cli {
    #[arg(
        long = "config",
        value_name = "PATH",
        default_value = DEFAULT_CONFIG_PATH,
        help = "Path to the config file"
    )]
    config: PathBuf,
    #[arg(
        long = "videos-root",
        value_name = "PATH",
        help = "Directory holding one subdirectory per category"
    )]
    videos_root: Option<PathBuf>,
    #[arg(
        long = "thumbnails-root",
        value_name = "PATH",
        help = "Directory mirroring the categories with generated thumbnails"
    )]
    thumbnails_root: Option<PathBuf>,
    #[arg(long = "host", value_name = "ADDR", help = "Address to listen on")]
    host: Option<std::net::IpAddr>,
    #[arg(long = "port", value_name = "PORT", help = "Port to listen on")]
    port: Option<u16>,
    #[arg(
        long = "public-url",
        value_name = "URL",
        help = "Base URL advertised in listings (default http://<lan-ip>:<port>)"
    )]
    public_url: Option<String>,
    #[arg(long = "ffmpeg", value_name = "PATH", help = "ffmpeg binary to invoke")]
    ffmpeg: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "videoteca=info,backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Environment variables take precedence over flags.
    let port = std::env::var("VIDEOTECA_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .or(cli.port);
    let host = std::env::var("VIDEOTECA_HOST")
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .or(cli.host);

    let settings = load_settings(
        &cli.config,
        Overrides {
            videos_root: cli.videos_root,
            thumbnails_root: cli.thumbnails_root,
            host,
            port,
            public_url: cli.public_url,
            ffmpeg: cli.ffmpeg,
        },
    )
    .context("loading settings")?;

    if !settings.videos_root.is_dir() {
        warn!(
            root = %settings.videos_root.display(),
            "videos root does not exist yet; the catalog will be empty"
        );
    }
    info!(
        videos = %settings.videos_root.display(),
        thumbnails = %settings.thumbnails_root.display(),
        public_url = %settings.public_url,
        "catalog configured"
    );

    let addr = SocketAddr::new(settings.host, settings.port);
    let state = AppState::with_ffmpeg(settings);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {}", err);
    }
}
