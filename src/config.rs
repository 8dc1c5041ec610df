use anyhow::{Context, Result};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::services::catalog::CatalogConfig;

/// Per-session ceiling on accepted bytes (50 GiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub upload_dir: PathBuf,
    pub chunk_dir: PathBuf,
    pub database_url: String,
    pub catalog_url: String,
    pub catalog_user: String,
    pub catalog_password: String,
    pub catalog_workspace: String,
    pub catalog_timeout_secs: u64,
    pub max_upload_bytes: u64,
    pub session_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Lunar base map-layer upload and publish service")]
pub struct Args {
    /// Host to bind to (overrides LUNAR_MAPS_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides LUNAR_MAPS_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where published map files live (overrides LUNAR_MAPS_UPLOAD_DIR)
    #[arg(long)]
    pub upload_dir: Option<PathBuf>,

    /// Directory for in-flight upload parts (overrides LUNAR_MAPS_CHUNK_DIR)
    #[arg(long)]
    pub chunk_dir: Option<PathBuf>,

    /// Database URL (overrides LUNAR_MAPS_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Base URL of the GIS catalog, e.g. http://geoserver:8080/geoserver
    /// (overrides LUNAR_MAPS_CATALOG_URL)
    #[arg(long)]
    pub catalog_url: Option<String>,

    /// Catalog workspace to publish into (overrides LUNAR_MAPS_CATALOG_WORKSPACE)
    #[arg(long)]
    pub catalog_workspace: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let env_cfg = Self::from_env()?;

        let cfg = Self {
            host: args.host.unwrap_or(env_cfg.host),
            port: args.port.unwrap_or(env_cfg.port),
            upload_dir: args.upload_dir.unwrap_or(env_cfg.upload_dir),
            chunk_dir: args.chunk_dir.unwrap_or(env_cfg.chunk_dir),
            database_url: args.database_url.unwrap_or(env_cfg.database_url),
            catalog_url: args.catalog_url.unwrap_or(env_cfg.catalog_url),
            catalog_workspace: args.catalog_workspace.unwrap_or(env_cfg.catalog_workspace),
            ..env_cfg
        };

        Ok((cfg, args.migrate))
    }

    /// Build the configuration from `LUNAR_MAPS_*` variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env_or("LUNAR_MAPS_HOST", "0.0.0.0"),
            port: env_parse("LUNAR_MAPS_PORT", 8000)?,
            upload_dir: env_or("LUNAR_MAPS_UPLOAD_DIR", "./data/uploads").into(),
            chunk_dir: env_or("LUNAR_MAPS_CHUNK_DIR", "./data/chunks").into(),
            database_url: env_or(
                "LUNAR_MAPS_DATABASE_URL",
                "sqlite://./data/meta/lunar_maps.db",
            ),
            catalog_url: env_or("LUNAR_MAPS_CATALOG_URL", "http://localhost:8080/geoserver"),
            catalog_user: env_or("LUNAR_MAPS_CATALOG_USER", "admin"),
            catalog_password: env_or("LUNAR_MAPS_CATALOG_PASSWORD", "geoserver"),
            catalog_workspace: env_or("LUNAR_MAPS_CATALOG_WORKSPACE", "lunar"),
            catalog_timeout_secs: env_parse("LUNAR_MAPS_CATALOG_TIMEOUT_SECS", 300)?,
            max_upload_bytes: env_parse("LUNAR_MAPS_MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?,
            session_ttl_secs: env_parse("LUNAR_MAPS_SESSION_TTL_SECS", 86_400)?,
            sweep_interval_secs: env_parse("LUNAR_MAPS_SWEEP_INTERVAL_SECS", 600)?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Catalog connection settings handed to the publisher.
    pub fn catalog(&self) -> CatalogConfig {
        CatalogConfig {
            base_url: self.catalog_url.trim_end_matches('/').to_string(),
            username: self.catalog_user.clone(),
            password: self.catalog_password.clone(),
            workspace: self.catalog_workspace.clone(),
            timeout: Duration::from_secs(self.catalog_timeout_secs),
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.into())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
