//! Aggregated health of both stores.
//!
//! A report is built fresh on every call and never cached. Both stores are
//! probed concurrently and each probe is bounded, so an unreachable store
//! shows up as `connected: false` instead of stalling or failing the report.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::store::{ReferenceStore, StoreHandle, StoreKind, StoreState, Stores};

/// Upper bound for a single store probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub kind: StoreKind,
    pub state: StoreState,
    pub connected: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub stores: BTreeMap<String, StoreHealth>,
    pub reference_table_count: i64,
    pub overall_ok: bool,
}

impl HealthReport {
    /// Health of the store of the given kind.
    pub fn store(&self, kind: StoreKind) -> Option<&StoreHealth> {
        self.stores.values().find(|s| s.kind == kind)
    }

    pub fn is_connected(&self, kind: StoreKind) -> bool {
        self.store(kind).is_some_and(|s| s.connected)
    }
}

pub struct HealthAggregator {
    relational: Arc<StoreHandle>,
    document: Arc<StoreHandle>,
    reference: Arc<dyn ReferenceStore>,
    probe_timeout: Duration,
}

impl HealthAggregator {
    pub fn new(stores: &Stores) -> Self {
        Self {
            relational: Arc::clone(stores.relational()),
            document: Arc::clone(stores.document()),
            reference: stores.reference(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// Build a report. Never fails.
    pub async fn report(&self) -> HealthReport {
        let (mut relational, document) =
            tokio::join!(self.probe(&self.relational), self.probe(&self.document));

        let mut reference_table_count = 0;
        if relational.connected {
            match tokio::time::timeout(self.probe_timeout, self.reference.count_tables()).await {
                Ok(Ok(count)) => reference_table_count = count,
                Ok(Err(e)) => {
                    relational.connected = false;
                    relational.detail = format!("table count failed: {e}");
                }
                Err(_) => {
                    relational.connected = false;
                    relational.detail = format!(
                        "table count timed out after {}ms",
                        self.probe_timeout.as_millis()
                    );
                }
            }
        }

        let overall_ok = relational.connected && document.connected;
        debug!(
            relational = relational.connected,
            document = document.connected,
            tables = reference_table_count,
            "Health report built"
        );

        let mut stores = BTreeMap::new();
        stores.insert(self.relational.name().to_string(), relational);
        stores.insert(self.document.name().to_string(), document);

        HealthReport {
            timestamp: Utc::now(),
            stores,
            reference_table_count,
            overall_ok,
        }
    }

    async fn probe(&self, handle: &StoreHandle) -> StoreHealth {
        let status = handle.status();
        let (connected, detail) = if status.state != StoreState::Connected {
            let detail = match status.last_error {
                Some(err) => format!("store is {}: {}", status.state, err.message),
                None => format!("store is {}", status.state),
            };
            (false, detail)
        } else {
            match tokio::time::timeout(self.probe_timeout, handle.ping()).await {
                Ok(Ok(())) => (true, "ok".to_string()),
                Ok(Err(e)) => (false, e.to_string()),
                Err(_) => (
                    false,
                    format!("ping timed out after {}ms", self.probe_timeout.as_millis()),
                ),
            }
        };

        StoreHealth {
            kind: status.kind,
            state: status.state,
            connected,
            detail,
        }
    }
}
