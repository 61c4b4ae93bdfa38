// src/bin/worker.rs
// Worker subprocess entry point: speaks the framed pool protocol over
// stdin/stdout and runs chat turns in isolation

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use atlas_backend::engine::NullDomainExecutor;
use atlas_backend::tools::NullToolExecutor;
use atlas_backend::worker::child::run_worker;

#[derive(Parser, Debug)]
#[command(name = "atlas-worker", about = "ATLAS chat worker subprocess")]
struct Args {
    /// SQLite database URL shared with the parent
    #[arg(long, env = "ATLAS_DATABASE_URL")]
    database_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the frame protocol; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    run_worker(
        &args.database_url,
        Arc::new(NullDomainExecutor),
        Arc::new(NullToolExecutor),
    )
    .await
}
