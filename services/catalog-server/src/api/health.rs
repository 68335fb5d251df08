//! Health check endpoint.
//!
//! Used by load balancers and orchestration systems to determine whether
//! both stores are reachable.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

use super::error::ApiError;
use crate::health::{HealthReport, StoreHealth};
use crate::state::AppState;
use crate::store::StoreKind;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Both stores reachable.
    pub success: bool,

    pub message: String,

    /// Report timestamp (ISO 8601).
    pub timestamp: String,

    /// Service version.
    pub version: String,

    pub environment: String,

    pub database: DatabaseHealth,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct DatabaseHealth {
    pub relational: RelationalHealth,
    pub document: DocumentHealth,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct RelationalHealth {
    pub connected: bool,
    /// Number of tables in the relational store.
    pub tables: i64,
    pub detail: String,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct DocumentHealth {
    pub connected: bool,
    pub detail: String,
}

/// Create health check routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

/// Readiness of both stores.
///
/// Returns 503 when either store is unreachable and 500 only if the report
/// itself could not be produced.
async fn health(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<HealthResponse>), ApiError> {
    let aggregator = state.health();
    let report = tokio::spawn(async move { aggregator.report().await })
        .await
        .map_err(|e| ApiError::internal("Health check failed", e.to_string()))?;

    let status = if report.overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((status, Json(to_response(&report, &state))))
}

fn to_response(report: &HealthReport, state: &AppState) -> HealthResponse {
    let detail = |kind| {
        report
            .store(kind)
            .map(|s: &StoreHealth| (s.connected, s.detail.clone()))
            .unwrap_or((false, "store not registered".to_string()))
    };
    let (relational_connected, relational_detail) = detail(StoreKind::Relational);
    let (document_connected, document_detail) = detail(StoreKind::Document);

    HealthResponse {
        success: report.overall_ok,
        message: if report.overall_ok {
            "Service healthy".to_string()
        } else {
            "Service degraded".to_string()
        },
        timestamp: report.timestamp.to_rfc3339(),
        version: state.service().version.clone(),
        environment: state.service().environment.clone(),
        database: DatabaseHealth {
            relational: RelationalHealth {
                connected: relational_connected,
                tables: report.reference_table_count,
                detail: relational_detail,
            },
            document: DocumentHealth {
                connected: document_connected,
                detail: document_detail,
            },
        },
    }
}
