//! Postgres driver for the relational store.
//!
//! The pool is built lazily on `connect` and dropped on `close`, so the
//! handle's state machine decides when connections exist.

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::info;

use crate::config::parse_var;

use super::{quote_ident, Record, RecordValue, ReferenceStore, StoreDriver, StoreError};

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout. This is the connect timeout policy.
    pub acquire_timeout: Duration,

    /// Idle connection timeout.
    pub idle_timeout: Duration,

    /// Maximum lifetime of a connection.
    pub max_lifetime: Duration,

    /// Apply pending migrations right after connecting.
    pub run_migrations: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/catalog".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
            run_migrations: true,
        }
    }
}

impl DbConfig {
    /// Build configuration from a variable lookup.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let database_url = var("DATABASE_URL").unwrap_or(defaults.database_url);

        let max_connections =
            parse_var(&var, "DB_MAX_CONNECTIONS")?.unwrap_or(defaults.max_connections);

        let min_connections =
            parse_var(&var, "DB_MIN_CONNECTIONS")?.unwrap_or(defaults.min_connections);

        let run_migrations = var("DB_RUN_MIGRATIONS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(defaults.run_migrations);

        Ok(Self {
            database_url,
            max_connections,
            min_connections,
            run_migrations,
            ..defaults
        })
    }
}

/// Postgres-backed relational store.
pub struct PostgresStore {
    config: DbConfig,
    pool: RwLock<Option<PgPool>>,
}

impl PostgresStore {
    pub fn new(config: DbConfig) -> Self {
        Self {
            config,
            pool: RwLock::new(None),
        }
    }

    /// Get a clone of the live pool.
    pub fn pool(&self) -> Result<PgPool, StoreError> {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(StoreError::NotConnected)
    }
}

/// Locate the reference schema: `./migrations` when run from the package,
/// otherwise the copy next to the manifest this binary was built from.
fn migration_dir() -> Result<PathBuf, StoreError> {
    let local = PathBuf::from("migrations");
    if local.is_dir() {
        return Ok(local);
    }
    let bundled = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
    if bundled.is_dir() {
        return Ok(bundled);
    }
    Err(StoreError::MigrationDirNotFound {
        tried: format!("{}, {}", local.display(), bundled.display()),
    })
}

async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    let dir = migration_dir()?;
    let migrator = Migrator::new(dir.as_path())
        .await
        .map_err(StoreError::Migration)?;
    info!(dir = %dir.display(), migrations = migrator.iter().count(), "Applying reference schema");
    migrator.run(pool).await.map_err(StoreError::Migration)
}

#[async_trait]
impl StoreDriver for PostgresStore {
    async fn connect(&self) -> Result<(), StoreError> {
        if self.pool().is_ok() {
            return Ok(());
        }

        info!(
            max_connections = self.config.max_connections,
            min_connections = self.config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .min_connections(self.config.min_connections)
            .acquire_timeout(self.config.acquire_timeout)
            .idle_timeout(Some(self.config.idle_timeout))
            .max_lifetime(Some(self.config.max_lifetime))
            .connect(&self.config.database_url)
            .await
            .map_err(StoreError::connect)?;

        if self.config.run_migrations {
            if let Err(e) = migrate(&pool).await {
                pool.close().await;
                return Err(e);
            }
        }

        *self.pool.write().unwrap_or_else(PoisonError::into_inner) = Some(pool);
        info!("Database connection pool established");
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        let pool = self
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pool) = pool {
            pool.close().await;
            info!("Database connection pool closed");
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool()?)
            .await
            .map_err(StoreError::query)?;
        Ok(())
    }
}

#[async_trait]
impl ReferenceStore for PostgresStore {
    async fn count_tables(&self) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM information_schema.tables
            WHERE table_schema = current_schema()
              AND table_type = 'BASE TABLE'
              AND table_name <> '_sqlx_migrations'
            "#,
        )
        .fetch_one(&self.pool()?)
        .await
        .map_err(StoreError::query)
    }

    async fn count_rows(&self, table: &str) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)))
            .fetch_one(&self.pool()?)
            .await
            .map_err(StoreError::query)
    }

    async fn fetch_keys(
        &self,
        table: &str,
        key_field: &str,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        let sql = format!(
            "SELECT {}::text, id FROM {} ORDER BY id",
            quote_ident(key_field),
            quote_ident(table)
        );
        sqlx::query_as::<_, (String, i64)>(&sql)
            .fetch_all(&self.pool()?)
            .await
            .map_err(StoreError::query)
    }

    async fn insert_rows(
        &self,
        table: &str,
        key_field: &str,
        rows: &[Record],
    ) -> Result<Vec<(String, i64)>, StoreError> {
        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let columns: Vec<&String> = first.keys().collect();

        let mut builder = QueryBuilder::<Postgres>::new("INSERT INTO ");
        builder.push(quote_ident(table)).push(" (");
        {
            let mut separated = builder.separated(", ");
            for column in &columns {
                separated.push(quote_ident(column));
            }
        }
        builder.push(") ");

        builder.push_values(rows, |mut values, row| {
            for column in &columns {
                match row.get(*column) {
                    Some(RecordValue::Text(v)) => {
                        values.push_bind(v.clone());
                    }
                    Some(RecordValue::Integer(v)) => {
                        values.push_bind(*v);
                    }
                    Some(RecordValue::Boolean(v)) => {
                        values.push_bind(*v);
                    }
                    None => {
                        values.push("NULL");
                    }
                }
            }
        });

        builder
            .push(" RETURNING ")
            .push(quote_ident(key_field))
            .push("::text, id");

        builder
            .build_query_as::<(String, i64)>()
            .fetch_all(&self.pool()?)
            .await
            .map_err(StoreError::query)
    }
}
