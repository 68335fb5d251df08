//! MongoDB driver for the document store.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::options::ClientOptions;
use mongodb::Client;
use tracing::info;

use crate::config::parse_var;

use super::{StoreDriver, StoreError};

/// Document store configuration.
#[derive(Debug, Clone)]
pub struct DocumentConfig {
    /// Connection string.
    pub url: String,

    /// Database used for the connectivity check.
    pub database: String,

    /// Connect and server-selection timeout.
    pub connect_timeout: Duration,

    /// Application name reported to the server.
    pub app_name: String,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            url: "mongodb://localhost:27017".to_string(),
            database: "catalog".to_string(),
            connect_timeout: Duration::from_secs(5),
            app_name: "catalog-server".to_string(),
        }
    }
}

impl DocumentConfig {
    /// Build configuration from a variable lookup.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let connect_timeout = parse_var::<u64>(&var, "MONGO_CONNECT_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.connect_timeout);
        Ok(Self {
            url: var("MONGO_URL").unwrap_or(defaults.url),
            database: var("MONGO_DB").unwrap_or(defaults.database),
            connect_timeout,
            app_name: defaults.app_name,
        })
    }
}

/// MongoDB-backed document store.
///
/// The driver client is lazy, so `connect` issues a `ping` to surface an
/// unreachable server at startup instead of on first use.
pub struct MongoStore {
    config: DocumentConfig,
    client: RwLock<Option<Client>>,
}

impl MongoStore {
    pub fn new(config: DocumentConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
        }
    }

    fn client(&self) -> Result<Client, StoreError> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(StoreError::NotConnected)
    }

    async fn ping_client(&self, client: &Client) -> Result<(), mongodb::error::Error> {
        client
            .database(&self.config.database)
            .run_command(doc! { "ping": 1 })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StoreDriver for MongoStore {
    async fn connect(&self) -> Result<(), StoreError> {
        if self.client().is_ok() {
            return Ok(());
        }

        info!(database = %self.config.database, "Connecting to document store");

        let mut options = ClientOptions::parse(self.config.url.as_str())
            .await
            .map_err(StoreError::connect)?;
        options.app_name = Some(self.config.app_name.clone());
        options.connect_timeout = Some(self.config.connect_timeout);
        options.server_selection_timeout = Some(self.config.connect_timeout);

        let client = Client::with_options(options).map_err(StoreError::connect)?;
        if let Err(e) = self.ping_client(&client).await {
            client.shutdown().await;
            return Err(StoreError::connect(e));
        }

        *self.client.write().unwrap_or_else(PoisonError::into_inner) = Some(client);
        info!(database = %self.config.database, "Document store connection established");
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        let client = self
            .client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(client) = client {
            client.shutdown().await;
            info!("Document store connection closed");
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let client = self.client()?;
        self.ping_client(&client).await.map_err(StoreError::query)
    }
}
