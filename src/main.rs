use anyhow::{Context, Result};
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod auth;
mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
#[cfg(test)]
mod test_support;

use services::{catalog::CatalogClient, chunk_store::ChunkStore, map_service::MapService};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!(
        addr = %cfg.addr(),
        upload_dir = %cfg.upload_dir.display(),
        chunk_dir = %cfg.chunk_dir.display(),
        catalog = %cfg.catalog_url,
        workspace = %cfg.catalog_workspace,
        "Starting lunar-maps"
    );

    // --- Ensure storage directories exist ---
    for dir in [&cfg.upload_dir, &cfg.chunk_dir] {
        if !dir.exists() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating directory {}", dir.display()))?;
            tracing::info!("Created directory at {}", dir.display());
        }
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);

    // --- Handle migration mode ---
    db::run_migrations(&db).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let catalog = CatalogClient::new(cfg.catalog())?;
    let chunks = ChunkStore::new(cfg.chunk_dir.clone(), cfg.max_upload_bytes);
    let _sweeper = chunks
        .clone()
        .spawn_sweeper(cfg.session_ttl(), cfg.sweep_interval());
    let service = MapService::new(db, chunks, catalog, cfg.upload_dir.clone());

    // --- Build router ---
    let app = routes::routes::app(service);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
