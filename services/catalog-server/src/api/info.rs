//! Static informational document and the unmatched-route fallback.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::state::AppState;

/// Entry points advertised by `/api` and by the 404 fallback.
pub const ENDPOINTS: [&str; 2] = ["/api", "/api/health"];

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct InfoResponse {
    pub name: String,
    pub version: String,
    pub environment: String,
    pub description: String,
    pub endpoints: Vec<String>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct NotFoundResponse {
    pub success: bool,
    pub message: String,
    pub endpoints: Vec<String>,
}

pub async fn info(State(state): State<AppState>) -> Json<InfoResponse> {
    let service = state.service();
    Json(InfoResponse {
        name: service.name.clone(),
        version: service.version.clone(),
        environment: service.environment.clone(),
        description: "Catalog API: reference data and store health".to_string(),
        endpoints: ENDPOINTS.iter().map(|e| e.to_string()).collect(),
    })
}

pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(NotFoundResponse {
            success: false,
            message: "Route not found".to_string(),
            endpoints: ENDPOINTS.iter().map(|e| e.to_string()).collect(),
        }),
    )
}
