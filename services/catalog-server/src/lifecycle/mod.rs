//! Process lifecycle: ordered startup, guarded shutdown.
//!
//! ```text
//! Idle -> PreparingFilesystem -> ConnectingStores -> Seeding -> Verifying -> Serving
//!   any state --stop--> ShuttingDown -> Stopped
//! ```
//!
//! Filesystem and store-connection failures abort startup. Seeding and
//! verification problems are logged and startup continues. Shutdown is
//! entered through [`LifecycleOrchestrator::stop`] only, whatever the trigger,
//! and runs at most once.

mod events;
mod shutdown;

pub use events::{
    channel, install_panic_hook, spawn_signal_listener, supervise, LifecycleEvent,
    LifecycleEvents, ShutdownSignal,
};
pub use shutdown::{ShutdownSnapshot, ShutdownState};

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, instrument, warn};

use crate::health::HealthAggregator;
use crate::report::StartupReporter;
use crate::seed::SeedCatalog;
use crate::store::{StoreError, StoreHandle, Stores};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecyclePhase {
    Idle,
    PreparingFilesystem,
    ConnectingStores,
    Seeding,
    Verifying,
    Serving,
    ShuttingDown,
    Stopped,
}

impl LifecyclePhase {
    pub fn is_terminating(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Stopped)
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::PreparingFilesystem => "preparing-filesystem",
            Self::ConnectingStores => "connecting-stores",
            Self::Seeding => "seeding",
            Self::Verifying => "verifying",
            Self::Serving => "serving",
            Self::ShuttingDown => "shutting-down",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Fatal startup errors.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("cannot prepare upload directory {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot connect {store} store: {source}")]
    Connection {
        store: String,
        #[source]
        source: StoreError,
    },

    #[error("cannot start accepting connections: {0}")]
    Listen(#[source] io::Error),

    #[error("startup interrupted by shutdown")]
    Interrupted,
}

/// Why shutdown was entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownTrigger {
    Signal(ShutdownSignal),
    UncaughtError(String),
    UnhandledRejection(String),
    /// A fatal startup error; always exits non-zero.
    StartupFailure(String),
    /// Programmatic request.
    Requested,
    /// Every event source went away.
    EventsClosed,
}

impl From<LifecycleEvent> for ShutdownTrigger {
    fn from(event: LifecycleEvent) -> Self {
        match event {
            LifecycleEvent::Signal(signal) => Self::Signal(signal),
            LifecycleEvent::UncaughtError(msg) => Self::UncaughtError(msg),
            LifecycleEvent::UnhandledRejection(msg) => Self::UnhandledRejection(msg),
        }
    }
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(signal) => write!(f, "{signal}"),
            Self::UncaughtError(msg) => write!(f, "uncaught error: {msg}"),
            Self::UnhandledRejection(msg) => write!(f, "unhandled rejection: {msg}"),
            Self::StartupFailure(msg) => write!(f, "startup failure: {msg}"),
            Self::Requested => f.write_str("requested"),
            Self::EventsClosed => f.write_str("event sources closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownOutcome {
    pub trigger: ShutdownTrigger,
    pub relational_closed: bool,
    pub document_closed: bool,
}

impl ShutdownOutcome {
    /// 0 when both stores closed cleanly after a non-fatal trigger, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        let startup_failed = matches!(self.trigger, ShutdownTrigger::StartupFailure(_));
        if self.relational_closed && self.document_closed && !startup_failed {
            0
        } else {
            1
        }
    }
}

pub struct LifecycleOrchestrator {
    relational: Arc<StoreHandle>,
    document: Arc<StoreHandle>,
    seeds: SeedCatalog,
    health: Arc<HealthAggregator>,
    reporter: StartupReporter,
    upload_dir: PathBuf,
    phase: watch::Sender<LifecyclePhase>,
    shutdown: ShutdownState,
    outcome: watch::Sender<Option<ShutdownOutcome>>,
}

impl LifecycleOrchestrator {
    pub fn new(
        stores: Stores,
        seeds: SeedCatalog,
        reporter: StartupReporter,
        upload_dir: impl Into<PathBuf>,
    ) -> Self {
        let health = Arc::new(HealthAggregator::new(&stores));
        Self {
            relational: Arc::clone(stores.relational()),
            document: Arc::clone(stores.document()),
            seeds,
            health,
            reporter,
            upload_dir: upload_dir.into(),
            phase: watch::Sender::new(LifecyclePhase::Idle),
            shutdown: ShutdownState::new(),
            outcome: watch::Sender::new(None),
        }
    }

    /// Replace the health aggregator (e.g. to tune probe timeouts).
    pub fn with_health(mut self, health: HealthAggregator) -> Self {
        self.health = Arc::new(health);
        self
    }

    pub fn phase(&self) -> LifecyclePhase {
        *self.phase.borrow()
    }

    /// Observe phase changes, e.g. to drive an HTTP server's graceful shutdown.
    pub fn subscribe(&self) -> watch::Receiver<LifecyclePhase> {
        self.phase.subscribe()
    }

    pub fn health(&self) -> Arc<HealthAggregator> {
        Arc::clone(&self.health)
    }

    pub fn shutdown_state(&self) -> ShutdownSnapshot {
        self.shutdown.snapshot()
    }

    /// Run every startup phase, then call `accept_connections`.
    ///
    /// On a fatal error the stores opened so far are released, the
    /// orchestrator ends in `Stopped` and the error is returned. If `stop`
    /// was requested meanwhile, returns [`LifecycleError::Interrupted`] and
    /// leaves teardown to that `stop` call.
    #[instrument(skip_all)]
    pub async fn start<F>(&self, accept_connections: F) -> Result<(), LifecycleError>
    where
        F: FnOnce() -> io::Result<()>,
    {
        match self.run_startup(accept_connections).await {
            Ok(()) => Ok(()),
            Err(LifecycleError::Interrupted) => Err(LifecycleError::Interrupted),
            Err(e) if self.shutdown.in_progress() => {
                debug!(error = %e, "Startup failed after shutdown began");
                Err(LifecycleError::Interrupted)
            }
            Err(e) => {
                self.reporter.startup_failed(&e);
                self.shutdown_with(ShutdownTrigger::StartupFailure(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    async fn run_startup<F>(&self, accept_connections: F) -> Result<(), LifecycleError>
    where
        F: FnOnce() -> io::Result<()>,
    {
        self.advance(LifecyclePhase::PreparingFilesystem)?;
        let created = prepare_upload_dir(&self.upload_dir).await?;
        self.reporter.upload_dir(&self.upload_dir, created);

        self.advance(LifecyclePhase::ConnectingStores)?;
        self.connect_stores().await?;

        self.advance(LifecyclePhase::Seeding)?;
        let seeded = self.seeds.populate().await;
        self.reporter.seed_summary(&seeded);

        self.advance(LifecyclePhase::Verifying)?;
        let report = self.health.report().await;
        self.reporter.verification(&report);

        self.advance(LifecyclePhase::Serving)?;
        accept_connections().map_err(LifecycleError::Listen)?;
        self.reporter.serving();
        Ok(())
    }

    /// Connect both stores concurrently and wait for both to settle.
    async fn connect_stores(&self) -> Result<(), LifecycleError> {
        let (relational, document) =
            tokio::join!(self.relational.connect(), self.document.connect());

        let mut first_failure = None;
        for (handle, result) in [(&self.relational, relational), (&self.document, document)] {
            if let Err(source) = result {
                if first_failure.is_none() {
                    first_failure = Some(LifecycleError::Connection {
                        store: handle.name().to_string(),
                        source,
                    });
                }
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Enter shutdown. Returns `None` when another caller already did.
    pub async fn stop(&self, trigger: ShutdownTrigger) -> Option<ShutdownOutcome> {
        self.shutdown_with(trigger).await
    }

    /// Feed one external event into the state machine.
    ///
    /// Returns `None` when shutdown was already entered by an earlier trigger.
    pub async fn handle(&self, event: LifecycleEvent) -> Option<ShutdownOutcome> {
        self.stop(ShutdownTrigger::from(event)).await
    }

    /// Wait for the first event, stop, and return the outcome.
    ///
    /// If another caller wins the shutdown guard, waits for that shutdown to
    /// finish and returns its outcome instead.
    pub async fn run_until_stopped(
        &self,
        mut events: mpsc::UnboundedReceiver<LifecycleEvent>,
    ) -> ShutdownOutcome {
        let event = tokio::select! {
            event = events.recv() => event,
            outcome = self.stopped() => return outcome,
        };

        let stopped = match event {
            Some(event) => self.handle(event).await,
            None => self.stop(ShutdownTrigger::EventsClosed).await,
        };
        match stopped {
            Some(outcome) => outcome,
            None => self.stopped().await,
        }
    }

    /// Resolves once shutdown has completed.
    pub async fn stopped(&self) -> ShutdownOutcome {
        let mut rx = self.outcome.subscribe();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // The sender lives in `self`, so this cannot happen while borrowed.
                std::future::pending::<()>().await;
            }
        }
    }

    async fn shutdown_with(&self, trigger: ShutdownTrigger) -> Option<ShutdownOutcome> {
        if !self.shutdown.try_begin() {
            debug!(trigger = %trigger, "Shutdown already in progress");
            return None;
        }

        let from = self.force_phase(LifecyclePhase::ShuttingDown);
        self.reporter.shutdown_started(&trigger, from);

        let (relational, document) =
            tokio::join!(self.relational.close(), self.document.close());
        self.reporter.store_closed(&self.relational, &relational);
        self.reporter.store_closed(&self.document, &document);

        let outcome = ShutdownOutcome {
            trigger,
            relational_closed: relational.is_ok(),
            document_closed: document.is_ok(),
        };
        self.reporter.shutdown_complete(&outcome);

        self.outcome.send_replace(Some(outcome.clone()));
        self.shutdown.complete();
        self.force_phase(LifecyclePhase::Stopped);
        Some(outcome)
    }

    /// Move forward to `to`, unless shutdown has taken over.
    fn advance(&self, to: LifecyclePhase) -> Result<(), LifecycleError> {
        let mut from = None;
        self.phase.send_if_modified(|phase| {
            if phase.is_terminating() || *phase >= to {
                return false;
            }
            from = Some(*phase);
            *phase = to;
            true
        });

        match from {
            Some(from) => {
                self.reporter.transition(from, to);
                Ok(())
            }
            None => {
                warn!(phase = %self.phase(), target = %to, "Startup interrupted");
                Err(LifecycleError::Interrupted)
            }
        }
    }

    /// Unconditional transition used by the shutdown path.
    fn force_phase(&self, to: LifecyclePhase) -> LifecyclePhase {
        let from = self.phase.send_replace(to);
        if from != to {
            self.reporter.transition(from, to);
        }
        from
    }
}

/// Make sure `dir` exists. Returns whether it had to be created.
async fn prepare_upload_dir(dir: &Path) -> Result<bool, LifecycleError> {
    let fs_error = |source| LifecycleError::Filesystem {
        path: dir.to_path_buf(),
        source,
    };

    match tokio::fs::metadata(dir).await {
        Ok(meta) if meta.is_dir() => Ok(false),
        Ok(_) => Err(fs_error(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "path exists and is not a directory",
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(dir).await.map_err(fs_error)?;
            Ok(true)
        }
        Err(e) => Err(fs_error(e)),
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use super::*;
    use crate::report::ServiceInfo;
    use crate::seed::{catalog, SeedGate};
    use crate::store::{MemoryDocumentStore, MemoryRelationalStore, StoreState};

    fn scratch_dir(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0))
            .as_nanos();
        std::env::temp_dir().join(format!("catalog-lifecycle-{tag}-{nanos}"))
    }

    struct Fixture {
        relational: Arc<MemoryRelationalStore>,
        document: Arc<MemoryDocumentStore>,
        orchestrator: LifecycleOrchestrator,
    }

    fn fixture(tag: &str) -> Fixture {
        let relational = Arc::new(MemoryRelationalStore::with_tables(catalog::REFERENCE_TABLES));
        let document = Arc::new(MemoryDocumentStore::new());
        let stores = Stores::new(relational.clone(), document.clone());
        let seeds =
            SeedCatalog::new(stores.reference(), catalog::reference_sets(), SeedGate::PerSet)
                .unwrap();
        let reporter = StartupReporter::new(ServiceInfo::new("test", 0));
        let orchestrator = LifecycleOrchestrator::new(stores, seeds, reporter, scratch_dir(tag));
        Fixture {
            relational,
            document,
            orchestrator,
        }
    }

    #[test]
    fn test_phase_order() {
        assert!(LifecyclePhase::Idle < LifecyclePhase::PreparingFilesystem);
        assert!(LifecyclePhase::Verifying < LifecyclePhase::Serving);
        assert!(LifecyclePhase::Serving < LifecyclePhase::ShuttingDown);
        assert!(LifecyclePhase::ShuttingDown.is_terminating());
    }

    #[test]
    fn test_exit_codes() {
        let clean = ShutdownOutcome {
            trigger: ShutdownTrigger::Signal(ShutdownSignal::Interrupt),
            relational_closed: true,
            document_closed: true,
        };
        assert_eq!(clean.exit_code(), 0);

        let failed_close = ShutdownOutcome {
            document_closed: false,
            ..clean.clone()
        };
        assert_eq!(failed_close.exit_code(), 1);

        let aborted = ShutdownOutcome {
            trigger: ShutdownTrigger::StartupFailure("x".into()),
            ..clean
        };
        assert_eq!(aborted.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_start_reaches_serving() {
        let f = fixture("serving");
        let mut accepted = false;

        f.orchestrator
            .start(|| {
                accepted = true;
                Ok(())
            })
            .await
            .unwrap();

        assert!(accepted);
        assert_eq!(f.orchestrator.phase(), LifecyclePhase::Serving);
        assert_eq!(f.relational.rows("statuses").len(), 5);
        assert_eq!(f.relational.rows("countries").len(), 10);
    }

    #[tokio::test]
    async fn test_connect_failure_aborts_before_serving() {
        let f = fixture("connect-fail");
        f.document.probe().fail_connect(true);
        let mut accepted = false;

        let err = f
            .orchestrator
            .start(|| {
                accepted = true;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::Connection { ref store, .. } if store == "document"));
        assert!(!accepted);
        assert_eq!(f.orchestrator.phase(), LifecyclePhase::Stopped);
        // The relational store did connect and must have been released.
        assert_eq!(f.relational.probe().close_calls(), 1);
        assert_eq!(f.orchestrator.stopped().await.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_seed_failure_still_serves() {
        let f = fixture("seed-fail");
        f.relational.fail_table("statuses");

        f.orchestrator.start(|| Ok(())).await.unwrap();
        assert_eq!(f.orchestrator.phase(), LifecyclePhase::Serving);
    }

    #[tokio::test]
    async fn test_listen_failure_is_fatal() {
        let f = fixture("listen-fail");
        let err = f
            .orchestrator
            .start(|| Err(io::Error::new(io::ErrorKind::AddrInUse, "port taken")))
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::Listen(_)));
        assert_eq!(f.orchestrator.phase(), LifecyclePhase::Stopped);
        assert_eq!(f.relational.probe().close_calls(), 1);
        assert_eq!(f.document.probe().close_calls(), 1);
    }

    #[tokio::test]
    async fn test_upload_path_is_a_file() {
        let f = fixture("file-in-the-way");
        let path = f.orchestrator.upload_dir.clone();
        std::fs::write(&path, b"not a dir").unwrap();

        let err = f.orchestrator.start(|| Ok(())).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Filesystem { .. }));
        assert_eq!(f.relational.probe().connect_calls(), 0);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_existing_upload_dir_is_kept() {
        let dir = scratch_dir("existing");
        std::fs::create_dir_all(&dir).unwrap();
        let marker = dir.join("keep.txt");
        std::fs::write(&marker, b"x").unwrap();

        assert!(!prepare_upload_dir(&dir).await.unwrap());
        assert!(marker.exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_stop_closes_each_store_once() {
        let f = fixture("stop-once");
        f.orchestrator.start(|| Ok(())).await.unwrap();

        let (a, b) = tokio::join!(
            f.orchestrator.stop(ShutdownTrigger::Signal(ShutdownSignal::Terminate)),
            f.orchestrator
                .stop(ShutdownTrigger::UncaughtError("boom".to_string())),
        );

        assert_eq!(a.is_some() as u8 + b.is_some() as u8, 1);
        assert_eq!(f.relational.probe().close_calls(), 1);
        assert_eq!(f.document.probe().close_calls(), 1);
        assert_eq!(f.orchestrator.phase(), LifecyclePhase::Stopped);
        assert_eq!(
            f.orchestrator.shutdown_state(),
            ShutdownSnapshot {
                in_progress: true,
                completed: true
            }
        );
    }

    #[tokio::test]
    async fn test_one_close_failure_does_not_block_other() {
        let f = fixture("close-fail");
        f.orchestrator.start(|| Ok(())).await.unwrap();
        f.relational.probe().fail_close(true);

        let outcome = f.orchestrator.stop(ShutdownTrigger::Requested).await.unwrap();
        assert!(!outcome.relational_closed);
        assert!(outcome.document_closed);
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(f.orchestrator.relational.state(), StoreState::Closed);
        assert_eq!(f.orchestrator.document.state(), StoreState::Closed);
    }

    #[tokio::test]
    async fn test_run_until_stopped_uses_first_event() {
        let f = fixture("events");
        f.orchestrator.start(|| Ok(())).await.unwrap();

        let (events, rx) = channel();
        events.signal(ShutdownSignal::Interrupt);
        events.uncaught_error("late panic");

        let outcome = f.orchestrator.run_until_stopped(rx).await;
        assert_eq!(outcome.trigger, ShutdownTrigger::Signal(ShutdownSignal::Interrupt));
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(f.document.probe().close_calls(), 1);
    }

    #[tokio::test]
    async fn test_handle_only_first_event_stops() {
        let f = fixture("handle");
        f.orchestrator.start(|| Ok(())).await.unwrap();

        let first = f
            .orchestrator
            .handle(LifecycleEvent::UnhandledRejection("http-server: reset".to_string()))
            .await
            .unwrap();
        assert_eq!(
            first.trigger,
            ShutdownTrigger::UnhandledRejection("http-server: reset".to_string())
        );

        let second = f
            .orchestrator
            .handle(LifecycleEvent::Signal(ShutdownSignal::Terminate))
            .await;
        assert!(second.is_none());
        assert_eq!(f.relational.probe().close_calls(), 1);
        assert_eq!(f.orchestrator.stopped().await, first);
    }

    #[tokio::test]
    async fn test_run_until_stopped_when_sources_close() {
        let f = fixture("events-closed");
        f.orchestrator.start(|| Ok(())).await.unwrap();

        let (events, rx) = channel();
        drop(events);

        let outcome = f.orchestrator.run_until_stopped(rx).await;
        assert_eq!(outcome.trigger, ShutdownTrigger::EventsClosed);
        assert_eq!(f.orchestrator.phase(), LifecyclePhase::Stopped);
    }

    #[tokio::test]
    async fn test_stop_during_startup_interrupts() {
        let f = fixture("interrupt");
        f.document.probe().set_delay(Duration::from_millis(200));

        let mut accepted = false;
        let start = f.orchestrator.start(|| {
            accepted = true;
            Ok(())
        });
        let stop = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            f.orchestrator
                .stop(ShutdownTrigger::Signal(ShutdownSignal::Terminate))
                .await
        };

        let (started, stopped) = tokio::join!(start, stop);
        assert!(matches!(started, Err(LifecycleError::Interrupted)));
        assert!(stopped.is_some());
        assert!(!accepted);
        assert_eq!(f.orchestrator.phase(), LifecyclePhase::Stopped);
        assert!(!f.document.probe().is_connected());
    }
}
