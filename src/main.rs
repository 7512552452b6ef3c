use anyhow::Result;
use bookstand::{config, db, isbn::IsbnClient, server};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/bookstand.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let isbn_client = IsbnClient::new(&cfg.isbn.base_url, cfg.isbn.key.clone())?;
    let state = Arc::new(server::AppState::new(
        pool,
        Arc::new(isbn_client),
        cfg.app.api_key.clone(),
        cfg.app.data_dir.clone(),
        cfg.app.upload_dir.clone(),
        cfg.isbn.base_url.clone(),
    ));

    info!("starting book collection service");
    server::serve(state, &cfg.app.bind_addr).await?;

    Ok(())
}
