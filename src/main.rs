use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use bulu::config::Config;
use bulu::engine::Engine;
use bulu::server::Server;
use bulu::watcher;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "bulu", about = "Weighted consistent-hashing reverse proxy gateway")]
struct Args {
    /// Path to the JSON configuration file; the file is watched for reloads.
    #[arg(short, long, default_value = "bulu_conf.js")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bulu=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load(&args.config)
        .map_err(|e| anyhow::anyhow!("failed to load configuration: {e}"))?;

    let engine = Arc::new(Engine::new());
    engine
        .init_nodes(&config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to build routing tables: {e}"))?;

    watcher::watch_config(args.config.clone(), engine.clone())
        .map_err(|e| anyhow::anyhow!("failed to watch configuration: {e}"))?;

    tracing::info!(host = %config.host, proto = %config.proto, "starting bulu gateway");

    Server::new(config, engine)
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("server error: {e}"))?;

    Ok(())
}
