//! Catalog API server
//!
//! Prepares the upload directory, connects the relational and document
//! stores, seeds reference data and serves the HTTP API until a signal or a
//! fatal error stops the process.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use catalog_server::{
    api,
    config::{self, StoreBackend},
    lifecycle::{self, LifecycleError, LifecycleOrchestrator},
    report::{ServiceInfo, StartupReporter},
    seed::{catalog, SeedCatalog},
    state::AppState,
    store::{MemoryDocumentStore, MemoryRelationalStore, MongoStore, PostgresStore, Stores},
};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to CATALOG_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let service = ServiceInfo::new(config.environment.clone(), config.port);
    let reporter = StartupReporter::new(service.clone());
    reporter.banner();
    info!(listen_addr = %config.listen_addr, backend = ?config.store_backend, "Configuration loaded");

    // Route signals, panics and failed tasks into one channel
    let (events, rx) = lifecycle::channel();
    lifecycle::install_panic_hook(events.clone());
    lifecycle::spawn_signal_listener(events.clone());

    let stores = match config.store_backend {
        StoreBackend::External => Stores::new(
            Arc::new(PostgresStore::new(config.database.clone())),
            Arc::new(MongoStore::new(config.document.clone())),
        ),
        StoreBackend::Memory => {
            warn!("Using in-memory stores; data is lost on exit");
            Stores::new(
                Arc::new(MemoryRelationalStore::with_tables(catalog::REFERENCE_TABLES)),
                Arc::new(MemoryDocumentStore::new()),
            )
        }
    };

    let seeds = SeedCatalog::new(stores.reference(), catalog::reference_sets(), config.seed_gate)?;
    let orchestrator = Arc::new(LifecycleOrchestrator::new(
        stores,
        seeds,
        reporter,
        config.upload_dir.clone(),
    ));

    let app = api::create_router(AppState::new(orchestrator.health(), service));

    let mut server: Option<JoinHandle<()>> = None;
    let accept = || -> std::io::Result<()> {
        let listener = std::net::TcpListener::bind(config.listen_addr)?;
        listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(listener)?;
        info!(addr = %config.listen_addr, "Listening for connections");

        let mut phase = orchestrator.subscribe();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = phase.wait_for(|p| p.is_terminating()).await;
                    info!("HTTP server shutting down");
                })
                .await
        });
        server = Some(lifecycle::supervise(events.clone(), "http-server", handle));
        Ok(())
    };

    let stop = orchestrator.run_until_stopped(rx);
    tokio::pin!(stop);

    let stopped = tokio::select! {
        started = orchestrator.start(accept) => {
            match started {
                Ok(()) => info!("Startup complete"),
                Err(LifecycleError::Interrupted) => info!("Startup interrupted by shutdown"),
                Err(e) => error!(error = %e, "Startup failed"),
            }
            None
        }
        outcome = &mut stop => Some(outcome),
    };
    let outcome = match stopped {
        Some(outcome) => outcome,
        None => stop.await,
    };

    // Wait for in-flight requests to drain
    if let Some(handle) = server {
        if tokio::time::timeout(Duration::from_secs(10), handle).await.is_err() {
            warn!("HTTP server did not shut down in time");
        }
    }

    info!(exit_code = outcome.exit_code(), "Catalog server exiting");
    Ok(ExitCode::from(outcome.exit_code()))
}
