use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::{StoreDriver, StoreError, StoreKind, StoreState};

/// Last failure observed on a handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ErrorInfo {
    fn from_error(err: &StoreError) -> Self {
        Self {
            message: err.to_string(),
            at: Utc::now(),
        }
    }
}

/// Point-in-time view of a handle.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub name: String,
    pub kind: StoreKind,
    pub state: StoreState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorInfo>,
}

#[derive(Debug)]
struct HandleInner {
    state: StoreState,
    last_error: Option<ErrorInfo>,
}

/// Connect/close/status wrapper around one store driver.
pub struct StoreHandle {
    name: String,
    kind: StoreKind,
    driver: Arc<dyn StoreDriver>,
    inner: Mutex<HandleInner>,
}

impl StoreHandle {
    pub fn new(name: impl Into<String>, kind: StoreKind, driver: Arc<dyn StoreDriver>) -> Self {
        Self {
            name: name.into(),
            kind,
            driver,
            inner: Mutex::new(HandleInner {
                state: StoreState::Disconnected,
                last_error: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    /// Current state snapshot. Never blocks on I/O.
    pub fn status(&self) -> StoreStatus {
        let inner = self.lock();
        StoreStatus {
            name: self.name.clone(),
            kind: self.kind,
            state: inner.state,
            last_error: inner.last_error.clone(),
        }
    }

    pub fn state(&self) -> StoreState {
        self.lock().state
    }

    /// Connect the underlying driver.
    ///
    /// `Disconnected -> Connecting -> Connected`. On failure the handle returns
    /// to `Disconnected` with `last_error` set. Connecting a `Closed` handle is
    /// rejected; connecting a `Connected` one is a no-op.
    pub async fn connect(&self) -> Result<(), StoreError> {
        {
            let mut inner = self.lock();
            let current = inner.state;
            match current {
                StoreState::Connected => return Ok(()),
                StoreState::Disconnected => inner.state = StoreState::Connecting,
                from => {
                    return Err(StoreError::InvalidTransition {
                        from,
                        action: "connect",
                    })
                }
            }
        }

        info!(store = %self.name, kind = %self.kind, "Connecting store");
        let result = self.driver.connect().await;

        let closed_meanwhile = {
            let mut inner = self.lock();
            match &result {
                Ok(()) if inner.state == StoreState::Connecting => {
                    inner.state = StoreState::Connected;
                    inner.last_error = None;
                    None
                }
                Ok(()) => Some(inner.state),
                Err(e) => {
                    if inner.state == StoreState::Connecting {
                        inner.state = StoreState::Disconnected;
                    }
                    inner.last_error = Some(ErrorInfo::from_error(e));
                    None
                }
            }
        };

        if let Some(from) = closed_meanwhile {
            // Closed while the driver was still connecting; release what it opened.
            warn!(store = %self.name, state = %from, "Store closed during connect");
            if let Err(e) = self.driver.close().await {
                warn!(store = %self.name, error = %e, "Failed to release late connection");
            }
            return Err(StoreError::InvalidTransition {
                from,
                action: "connect",
            });
        }

        match &result {
            Ok(()) => info!(store = %self.name, kind = %self.kind, "Store connected"),
            Err(e) => error!(store = %self.name, kind = %self.kind, error = %e, "Store connection failed"),
        }
        result
    }

    /// Close the underlying driver.
    ///
    /// Idempotent. A handle that never reached `Connected` goes straight to
    /// `Closed` without touching the driver.
    pub async fn close(&self) -> Result<(), StoreError> {
        let previous = {
            let mut inner = self.lock();
            let previous = inner.state;
            inner.state = match previous {
                StoreState::Connected => StoreState::Closing,
                StoreState::Closing => return Ok(()),
                _ => StoreState::Closed,
            };
            previous
        };

        if previous != StoreState::Connected {
            debug!(store = %self.name, state = %previous, "Nothing to release");
            return Ok(());
        }

        info!(store = %self.name, kind = %self.kind, "Closing store");
        let result = self.driver.close().await;

        let mut inner = self.lock();
        inner.state = StoreState::Closed;
        if let Err(e) = &result {
            inner.last_error = Some(ErrorInfo::from_error(e));
        }
        result
    }

    /// Round trip to the store. Fails fast when the handle is not connected.
    pub async fn ping(&self) -> Result<(), StoreError> {
        if self.state() != StoreState::Connected {
            return Err(StoreError::NotConnected);
        }
        self.driver.ping().await
    }

    fn lock(&self) -> MutexGuard<'_, HandleInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDocumentStore;

    fn handle(driver: Arc<MemoryDocumentStore>) -> StoreHandle {
        StoreHandle::new("document", StoreKind::Document, driver)
    }

    #[tokio::test]
    async fn test_connect_then_close() {
        let driver = Arc::new(MemoryDocumentStore::new());
        let handle = handle(driver.clone());
        assert_eq!(handle.state(), StoreState::Disconnected);

        handle.connect().await.unwrap();
        assert_eq!(handle.state(), StoreState::Connected);

        handle.close().await.unwrap();
        assert_eq!(handle.state(), StoreState::Closed);
        assert_eq!(driver.probe().close_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_records_error() {
        let driver = Arc::new(MemoryDocumentStore::new());
        driver.probe().fail_connect(true);
        let handle = handle(driver);

        let err = handle.connect().await.unwrap_err();
        assert!(matches!(err, StoreError::Connect(_)));

        let status = handle.status();
        assert_eq!(status.state, StoreState::Disconnected);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn test_close_before_connect_skips_driver() {
        let driver = Arc::new(MemoryDocumentStore::new());
        let handle = handle(driver.clone());

        handle.close().await.unwrap();
        assert_eq!(handle.state(), StoreState::Closed);
        assert_eq!(driver.probe().close_calls(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let driver = Arc::new(MemoryDocumentStore::new());
        let handle = handle(driver.clone());
        handle.connect().await.unwrap();

        handle.close().await.unwrap();
        handle.close().await.unwrap();
        assert_eq!(driver.probe().close_calls(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_after_close_rejected() {
        let driver = Arc::new(MemoryDocumentStore::new());
        let handle = handle(driver.clone());
        handle.connect().await.unwrap();
        handle.close().await.unwrap();

        let err = handle.connect().await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: StoreState::Closed,
                ..
            }
        ));
        assert_eq!(driver.probe().connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_close_failure_still_terminal() {
        let driver = Arc::new(MemoryDocumentStore::new());
        driver.probe().fail_close(true);
        let handle = handle(driver);
        handle.connect().await.unwrap();

        assert!(handle.close().await.is_err());
        let status = handle.status();
        assert_eq!(status.state, StoreState::Closed);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn test_ping_requires_connection() {
        let handle = handle(Arc::new(MemoryDocumentStore::new()));
        assert!(matches!(
            handle.ping().await,
            Err(StoreError::NotConnected)
        ));
        handle.connect().await.unwrap();
        handle.ping().await.unwrap();
    }
}
