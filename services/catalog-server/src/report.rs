//! Human-readable startup and shutdown lines.
//!
//! Every method logs its line through `tracing` and also returns it.

use std::path::Path;

use tracing::{error, info, warn};

use crate::health::HealthReport;
use crate::lifecycle::{LifecycleError, LifecyclePhase, ShutdownOutcome, ShutdownTrigger};
use crate::seed::{SeedReport, SetOutcome};
use crate::store::{StoreError, StoreHandle};

/// Static facts about the running service.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub environment: String,
    pub port: u16,
}

impl ServiceInfo {
    pub fn new(environment: impl Into<String>, port: u16) -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: environment.into(),
            port,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StartupReporter {
    service: ServiceInfo,
}

impl StartupReporter {
    pub fn new(service: ServiceInfo) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &ServiceInfo {
        &self.service
    }

    pub fn banner(&self) -> String {
        let line = format!(
            "Starting {} v{} (environment: {}, port: {})",
            self.service.name, self.service.version, self.service.environment, self.service.port
        );
        info!("{line}");
        line
    }

    pub fn transition(&self, from: LifecyclePhase, to: LifecyclePhase) -> String {
        let line = format!("Lifecycle {from} -> {to}");
        info!(from = %from, to = %to, "{line}");
        line
    }

    pub fn upload_dir(&self, path: &Path, created: bool) -> String {
        let line = if created {
            format!("Created upload directory {}", path.display())
        } else {
            format!("Upload directory {} already exists", path.display())
        };
        info!(path = %path.display(), created, "{line}");
        line
    }

    pub fn seed_summary(&self, report: &SeedReport) -> String {
        let parts: Vec<String> = report
            .outcomes
            .iter()
            .map(|(entity, outcome)| match outcome {
                SetOutcome::Inserted(n) => format!("{entity}: {n} created"),
                SetOutcome::AlreadyPopulated => format!("{entity}: present"),
                SetOutcome::Failed(_) => format!("{entity}: failed"),
            })
            .collect();
        let line = format!("Reference data: {}", parts.join(", "));

        if report.is_clean() {
            info!(created = report.inserted_total(), "{line}");
        } else {
            for (entity, message) in report.failures() {
                warn!(entity, error = message, "Reference data set not seeded");
            }
            warn!(created = report.inserted_total(), "{line}");
        }
        line
    }

    /// Post-seed verification. Zero reference tables is a warning, not an error.
    pub fn verification(&self, report: &HealthReport) -> String {
        if report.reference_table_count == 0 {
            let line = "No reference tables found after seeding".to_string();
            warn!(overall_ok = report.overall_ok, "{line}");
            return line;
        }
        let line = format!(
            "Verified {} reference tables (stores healthy: {})",
            report.reference_table_count, report.overall_ok
        );
        info!("{line}");
        line
    }

    pub fn serving(&self) -> Vec<String> {
        let port = self.service.port;
        let lines = vec![
            format!("{} listening on port {port}", self.service.name),
            format!("Environment: {}", self.service.environment),
            format!("Health check: http://localhost:{port}/api/health"),
            format!("API info: http://localhost:{port}/api"),
        ];
        for line in &lines {
            info!("{line}");
        }
        lines
    }

    pub fn startup_failed(&self, err: &LifecycleError) -> String {
        let line = format!("Startup aborted: {err}");
        error!(error = %err, "{line}");
        line
    }

    pub fn shutdown_started(&self, trigger: &ShutdownTrigger, from: LifecyclePhase) -> String {
        let line = format!("Shutting down ({trigger}) from {from}");
        match trigger {
            ShutdownTrigger::UncaughtError(_) | ShutdownTrigger::UnhandledRejection(_) => {
                error!(trigger = %trigger, "{line}")
            }
            _ => info!(trigger = %trigger, "{line}"),
        }
        line
    }

    pub fn store_closed(&self, handle: &StoreHandle, result: &Result<(), StoreError>) -> String {
        match result {
            Ok(()) => {
                let line = format!("{} store closed", handle.name());
                info!(store = handle.name(), "{line}");
                line
            }
            Err(e) => {
                let line = format!("{} store failed to close: {e}", handle.name());
                error!(store = handle.name(), error = %e, "{line}");
                line
            }
        }
    }

    pub fn shutdown_complete(&self, outcome: &ShutdownOutcome) -> String {
        let line = format!(
            "Shutdown complete (exit code {})",
            outcome.exit_code()
        );
        info!(
            relational_closed = outcome.relational_closed,
            document_closed = outcome.document_closed,
            "{line}"
        );
        line
    }
}
