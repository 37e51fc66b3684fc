//! epochlog server binary

use anyhow::{Context, Result};
use clap::Parser;
use epochlog_common::Config;
use epochlog_common::config::{EpochStoreKind, LogFormat};
use epochlog_server::{Server, http};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "epochlog-server")]
#[command(about = "epochlog sequencer and recovery server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/epochlog/server.toml")]
    config: PathBuf,

    /// Index of this node in the nodes configuration
    #[arg(long, env = "EPOCHLOG_NODE_INDEX")]
    node_index: Option<u16>,

    /// Use a file epoch store at this path
    #[arg(long)]
    epoch_store_path: Option<PathBuf>,

    /// Number of sequencer workers
    #[arg(long)]
    workers: Option<usize>,

    /// Listen address for the admin API
    #[arg(long)]
    admin_listen: Option<SocketAddr>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config: Config = if args.config.exists() {
        let text = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", args.config.display()))?
    } else {
        Config::default()
    };

    // CLI takes precedence over the file
    if let Some(index) = args.node_index {
        config.node.index = index;
    }
    if let Some(path) = &args.epoch_store_path {
        config.epoch_store.backend = EpochStoreKind::File;
        config.epoch_store.path = Some(path.clone());
    }
    if let Some(workers) = args.workers {
        config.sequencer.workers = workers;
    }
    if let Some(listen) = args.admin_listen {
        config.admin.listen = listen;
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    Ok(config)
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());
    let (text, json) = match config.logging.format {
        LogFormat::Text => (Some(tracing_subscriber::fmt::layer()), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config);

    info!("Starting epochlog server");
    info!("Config file: {}", args.config.display());

    let server = Server::start(config)
        .await
        .context("failed to start epochlog server")?;

    let admin = if server.config().admin.enabled {
        let listener = TcpListener::bind(server.config().admin.listen)
            .await
            .with_context(|| format!("binding admin API to {}", server.config().admin.listen))?;
        let router = http::router(server.admin());
        let shutdown = server.shutdown_token();
        Some(tokio::spawn(async move {
            if let Err(e) = http::serve(listener, router, shutdown).await {
                error!("Admin API error: {}", e);
            }
        }))
    } else {
        info!("Admin API disabled");
        None
    };

    tokio::signal::ctrl_c().await.ok();
    server.shutdown().await;
    if let Some(admin) = admin {
        admin.await.ok();
    }

    info!("epochlog server shut down gracefully");
    Ok(())
}
