use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};

use crate::seed::SeedGate;
use crate::store::{DbConfig, DocumentConfig};

/// Which drivers back the two stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Postgres + MongoDB.
    External,
    /// In-process stand-ins, for local development.
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub port: u16,
    pub environment: String,
    pub log_level: String,
    pub upload_dir: PathBuf,
    pub store_backend: StoreBackend,
    pub seed_gate: SeedGate,
    pub database: DbConfig,
    pub document: DocumentConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port: u16 = parse_var(&var, "PORT")?.unwrap_or(3000);

        let host: IpAddr = var("CATALOG_LISTEN_HOST")
            .unwrap_or_else(|| "0.0.0.0".to_string())
            .parse::<IpAddr>()
            .context("invalid CATALOG_LISTEN_HOST")?;

        let environment = var("APP_ENV").unwrap_or_else(|| "development".to_string());

        let log_level = var("CATALOG_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let upload_dir = var("CATALOG_UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("uploads"));

        let store_backend = match var("CATALOG_STORE_BACKEND").as_deref() {
            None | Some("external") => StoreBackend::External,
            Some("memory") => StoreBackend::Memory,
            Some(other) => return Err(anyhow!("unknown CATALOG_STORE_BACKEND '{other}'")),
        };

        let seed_gate = match var("CATALOG_SEED_GATE") {
            Some(raw) => raw.parse::<SeedGate>().map_err(|e| anyhow!(e))?,
            None => SeedGate::default(),
        };

        Ok(Self {
            listen_addr: SocketAddr::new(host, port),
            port,
            environment,
            log_level,
            upload_dir,
            store_backend,
            seed_gate,
            database: DbConfig::from_vars(&var)?,
            document: DocumentConfig::from_vars(&var)?,
        })
    }
}

/// Parse an optional variable, rejecting values that are set but malformed.
pub(crate) fn parse_var<T>(var: impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("invalid {key} '{raw}'"))
        })
        .transpose()
}
