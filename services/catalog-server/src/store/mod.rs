//! Persistent store layer.
//!
//! This module provides:
//! - The driver seams both stores are reached through ([`StoreDriver`],
//!   [`ReferenceStore`])
//! - [`StoreHandle`], the connect/close/status state machine wrapped around a driver
//! - Postgres (relational) and MongoDB (document) drivers
//! - In-memory drivers for tests and local development

mod error;
mod handle;
pub mod memory;
mod mongo;
mod postgres;

pub use error::{BoxError, StoreError};
pub use handle::{ErrorInfo, StoreHandle, StoreStatus};
pub use memory::{MemoryDocumentStore, MemoryRelationalStore};
pub use mongo::{DocumentConfig, MongoStore};
pub use postgres::{DbConfig, PostgresStore};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

/// Which of the two stores a handle wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Relational,
    Document,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relational => f.write_str("relational"),
            Self::Document => f.write_str("document"),
        }
    }
}

/// Connection state of a store handle.
///
/// Moves forward only; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// A literal column value as stored in the relational store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RecordValue {
    Text(String),
    Integer(i64),
    Boolean(bool),
}

impl fmt::Display for RecordValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(v) => f.write_str(v),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Boolean(v) => write!(f, "{v}"),
        }
    }
}

/// A flat row: column name to value.
pub type Record = BTreeMap<String, RecordValue>;

/// Connection lifecycle of one store.
#[async_trait]
pub trait StoreDriver: Send + Sync {
    /// Establish the transport, honouring the driver's own retry/timeout policy.
    async fn connect(&self) -> Result<(), StoreError>;

    /// Release all connections. Must be safe to call when nothing is open.
    async fn close(&self) -> Result<(), StoreError>;

    /// Cheap round trip used by health probes.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Reference-entity API of the relational store.
///
/// Every inserted row gets a numeric `id`; rows are addressed by a text key
/// column so later sets can refer to them.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    /// Number of application tables in the store.
    async fn count_tables(&self) -> Result<i64, StoreError>;

    /// Number of rows in `table`.
    async fn count_rows(&self, table: &str) -> Result<i64, StoreError>;

    /// `(key, id)` for every row of `table`.
    async fn fetch_keys(&self, table: &str, key_field: &str)
        -> Result<Vec<(String, i64)>, StoreError>;

    /// Insert all `rows` in one operation, returning `(key, id)` per created row.
    async fn insert_rows(
        &self,
        table: &str,
        key_field: &str,
        rows: &[Record],
    ) -> Result<Vec<(String, i64)>, StoreError>;
}

/// The two store handles plus the relational store's reference API.
///
/// Handles are shared read-only with the health aggregator; only the
/// lifecycle orchestrator drives their transitions.
#[derive(Clone)]
pub struct Stores {
    relational: Arc<StoreHandle>,
    document: Arc<StoreHandle>,
    reference: Arc<dyn ReferenceStore>,
}

impl Stores {
    /// Wrap a relational driver (which also serves reference data) and a document driver.
    pub fn new<R>(relational: Arc<R>, document: Arc<dyn StoreDriver>) -> Self
    where
        R: StoreDriver + ReferenceStore + 'static,
    {
        let reference: Arc<dyn ReferenceStore> = relational.clone();
        Self {
            relational: Arc::new(StoreHandle::new(
                "relational",
                StoreKind::Relational,
                relational,
            )),
            document: Arc::new(StoreHandle::new("document", StoreKind::Document, document)),
            reference,
        }
    }

    pub fn relational(&self) -> &Arc<StoreHandle> {
        &self.relational
    }

    pub fn document(&self) -> &Arc<StoreHandle> {
        &self.document
    }

    pub fn reference(&self) -> Arc<dyn ReferenceStore> {
        Arc::clone(&self.reference)
    }
}

/// Quote a SQL identifier.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("genres"), "\"genres\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_stores_share_reference_driver() {
        let relational = Arc::new(MemoryRelationalStore::new());
        let stores = Stores::new(relational, Arc::new(MemoryDocumentStore::new()));
        assert_eq!(stores.relational().kind(), StoreKind::Relational);
        assert_eq!(stores.document().kind(), StoreKind::Document);
        assert_eq!(stores.relational().name(), "relational");
    }
}
