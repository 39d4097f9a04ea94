use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod cli;
mod clients;
mod config;
mod runtime;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("relaybridge=info"));
    if args.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = config::Config::load(&args.config)?;
    ensure_data_dirs(&config);

    let engine = relaybridge_db::DatabaseEngine::from(config.database.engine);
    let pool = relaybridge_db::create_pool_with_engine(
        &config.database.url,
        config.database.max_connections,
        Some(engine),
    )
    .await?;
    relaybridge_db::run_migrations(&pool).await?;
    tracing::info!("Database ready ({})", engine.as_str());

    tracing::warn!("No remote network client attached; backfill jobs will stay queued");
    let runtime = runtime::Runtime::start(
        &config,
        pool.clone(),
        Arc::new(clients::DetachedHistory),
        Arc::new(clients::StoreRedactor::new(pool)),
    );
    tracing::info!(
        backfill = runtime.backfill.is_some(),
        send_locks = runtime.bridge.send_locks().tracked_accounts(),
        "Relay bridge engine running"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down (ctrl-c)...");
    runtime.shutdown().await;
    Ok(())
}

fn ensure_data_dirs(config: &config::Config) {
    if let Some(db_path) = config
        .database
        .url
        .strip_prefix("sqlite://")
        .and_then(|s| s.split('?').next())
    {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    tracing::warn!("Could not create directory '{}': {}", parent.display(), e);
                }
            }
        }
    }
}
