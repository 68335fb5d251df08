//! In-memory store drivers.
//!
//! Used by the test suites and by `CATALOG_STORE_BACKEND=memory` for local
//! development without Postgres or MongoDB. Failures can be injected per
//! operation and every driver call is counted.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{Record, RecordValue, ReferenceStore, StoreDriver, StoreError};

/// Connection bookkeeping and failure switches shared by both memory drivers.
#[derive(Debug, Default)]
pub struct ConnectionProbe {
    connected: AtomicBool,
    fail_connect: AtomicBool,
    fail_close: AtomicBool,
    unreachable: AtomicBool,
    connect_calls: AtomicUsize,
    close_calls: AtomicUsize,
    delay_ms: AtomicU64,
}

impl ConnectionProbe {
    /// Make subsequent `connect` calls fail.
    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `close` calls fail.
    pub fn fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Simulate the store becoming unreachable after connecting.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Delay applied to connect, close and ping.
    pub fn set_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.delay_ms.store(ms, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let ms = self.delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    async fn connect(&self, store: &str) -> Result<(), StoreError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(StoreError::connect(format!("{store} store refused connection")));
        }
        self.connected.store(true, Ordering::SeqCst);
        debug!(store, "[MEMORY] Connected");
        Ok(())
    }

    async fn close(&self, store: &str) -> Result<(), StoreError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.connected.store(false, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(StoreError::close(format!("{store} store failed to close")));
        }
        debug!(store, "[MEMORY] Closed");
        Ok(())
    }

    async fn ping(&self, store: &str) -> Result<(), StoreError> {
        self.pause().await;
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::query(format!("{store} store unreachable")));
        }
        self.ensure_connected()
    }

    fn ensure_connected(&self) -> Result<(), StoreError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(StoreError::NotConnected)
        }
    }
}

/// Document store stand-in.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    probe: ConnectionProbe,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe(&self) -> &ConnectionProbe {
        &self.probe
    }
}

#[async_trait]
impl StoreDriver for MemoryDocumentStore {
    async fn connect(&self) -> Result<(), StoreError> {
        self.probe.connect("document").await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.probe.close("document").await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.probe.ping("document").await
    }
}

#[derive(Debug, Default)]
struct Table {
    rows: Vec<(i64, Record)>,
}

/// Relational store stand-in with named tables and auto-increment ids.
///
/// Table contents survive close/connect cycles, so one instance can play the
/// persisted database across several simulated process starts.
#[derive(Debug, Default)]
pub struct MemoryRelationalStore {
    probe: ConnectionProbe,
    tables: Mutex<BTreeMap<String, Table>>,
    next_id: AtomicI64,
    failing_tables: Mutex<HashSet<String>>,
    insert_calls: AtomicUsize,
}

impl MemoryRelationalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with the given (empty) tables already present.
    pub fn with_tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        {
            let mut map = store.tables();
            for table in tables {
                map.insert(table.into(), Table::default());
            }
        }
        store
    }

    pub fn probe(&self) -> &ConnectionProbe {
        &self.probe
    }

    /// Make every count/insert against `table` fail.
    pub fn fail_table(&self, table: &str) {
        self.failing_tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.to_string());
    }

    /// Remove every injected table failure.
    pub fn clear_failures(&self) {
        self.failing_tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of bulk inserts executed.
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    /// Snapshot of a table's rows, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<(i64, Record)> {
        self.tables()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    fn tables(&self) -> MutexGuard<'_, BTreeMap<String, Table>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_table(&self, table: &str) -> Result<(), StoreError> {
        self.probe.ensure_connected()?;
        let failing = self
            .failing_tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(table);
        if failing {
            return Err(StoreError::query(format!("injected failure on {table}")));
        }
        Ok(())
    }
}

fn missing_table(table: &str) -> StoreError {
    StoreError::query(format!("relation \"{table}\" does not exist"))
}

#[async_trait]
impl StoreDriver for MemoryRelationalStore {
    async fn connect(&self) -> Result<(), StoreError> {
        self.probe.connect("relational").await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.probe.close("relational").await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.probe.ping("relational").await
    }
}

#[async_trait]
impl ReferenceStore for MemoryRelationalStore {
    async fn count_tables(&self) -> Result<i64, StoreError> {
        self.probe.ensure_connected()?;
        Ok(self.tables().len() as i64)
    }

    async fn count_rows(&self, table: &str) -> Result<i64, StoreError> {
        self.check_table(table)?;
        self.tables()
            .get(table)
            .map(|t| t.rows.len() as i64)
            .ok_or_else(|| missing_table(table))
    }

    async fn fetch_keys(
        &self,
        table: &str,
        key_field: &str,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        self.check_table(table)?;
        let tables = self.tables();
        let rows = &tables.get(table).ok_or_else(|| missing_table(table))?.rows;
        Ok(rows
            .iter()
            .filter_map(|(id, row)| row.get(key_field).map(|key| (key.to_string(), *id)))
            .collect())
    }

    async fn insert_rows(
        &self,
        table: &str,
        key_field: &str,
        rows: &[Record],
    ) -> Result<Vec<(String, i64)>, StoreError> {
        self.check_table(table)?;
        self.insert_calls.fetch_add(1, Ordering::SeqCst);

        let mut tables = self.tables();
        let target = tables.get_mut(table).ok_or_else(|| missing_table(table))?;

        let mut created = Vec::with_capacity(rows.len());
        for row in rows {
            let key = row
                .get(key_field)
                .map(RecordValue::to_string)
                .ok_or_else(|| StoreError::query(format!("missing key column {key_field}")))?;
            created.push((key, row.clone()));
        }

        // All-or-nothing, like a single INSERT statement.
        let mut ids = Vec::with_capacity(created.len());
        for (key, row) in created {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            target.rows.push((id, row));
            ids.push((key, id));
        }
        Ok(ids)
    }
}
