//! HTTP handlers for the operator endpoints

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use tracing::instrument;

use crate::controller::{OperatorState, MANAGED_KINDS};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Readiness response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub leader: bool,
    pub controllers_started: usize,
}

/// Health check endpoint
#[instrument]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Ready once every controller watches its kind and this replica leads.
pub async fn readyz(State(state): State<Arc<OperatorState>>) -> impl IntoResponse {
    readiness(state.is_leader(), state.controllers_started())
}

fn readiness(leader: bool, controllers_started: usize) -> (StatusCode, Json<ReadyResponse>) {
    let (code, status) = if !leader {
        (StatusCode::SERVICE_UNAVAILABLE, "not leader")
    } else if controllers_started < MANAGED_KINDS {
        (StatusCode::SERVICE_UNAVAILABLE, "controllers starting")
    } else {
        (StatusCode::OK, "ready")
    };
    (
        code,
        Json(ReadyResponse {
            status: status.to_string(),
            leader,
            controllers_started,
        }),
    )
}

/// Metrics endpoint handler
#[cfg(feature = "metrics")]
pub async fn metrics() -> impl IntoResponse {
    use prometheus_client::encoding::text::encode;

    let mut buffer = String::new();
    match encode(&mut buffer, &crate::controller::metrics::REGISTRY) {
        Ok(()) => (StatusCode::OK, buffer),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {}", e),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health() {
        let Json(resp) = health().await;
        assert_eq!(resp.status, "healthy");
        assert_eq!(resp.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_readiness_requires_leadership() {
        let (code, Json(resp)) = readiness(false, MANAGED_KINDS);
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.status, "not leader");
    }

    #[test]
    fn test_readiness_waits_for_controllers() {
        let (code, _) = readiness(true, MANAGED_KINDS - 1);
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);

        let (code, Json(resp)) = readiness(true, MANAGED_KINDS);
        assert_eq!(code, StatusCode::OK);
        assert_eq!(resp.status, "ready");
    }
}
