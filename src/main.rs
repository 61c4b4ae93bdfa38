// src/main.rs
// ATLAS backend server: chat execution core with SSE streaming

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use atlas_backend::api::build_router;
use atlas_backend::config::AtlasConfig;
use atlas_backend::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "atlas-backend", about = "Multi-provider LLM chat backend")]
struct Args {
    /// Bind host
    #[arg(long, env = "ATLAS_HOST")]
    host: Option<String>,

    /// Bind port
    #[arg(long, env = "ATLAS_PORT")]
    port: Option<u16>,

    /// SQLite database URL
    #[arg(long, env = "ATLAS_DATABASE_URL")]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = AtlasConfig::from_env();
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(database_url) = args.database_url {
        config.server.database_url = database_url;
    }

    // SQLite creates the file but not its parent directory
    if let Some(path) = config.server.database_url.strip_prefix("sqlite://") {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }

    let state = AppState::new(config.clone()).await?;

    // Warm the worker pool in the background; async turns are available
    // immediately
    {
        let pool = state.dispatcher.pool().clone();
        tokio::spawn(async move {
            pool.warmup().await;
        });
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("ATLAS backend listening on {}", addr);

    axum::serve(listener, build_router(state)).await?;
    Ok(())
}
