use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;

/// State for the plain-HTTP operations listener.
pub struct OpsState {
    pub registry: Arc<Registry>,
    /// Set once the HTTPS webhook listener is bound.
    pub ready: Arc<AtomicBool>,
}

pub type SharedOpsState = Arc<OpsState>;

/// Liveness probe on the webhook listener. Success with an empty body.
pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn readyz(State(state): State<SharedOpsState>) -> impl IntoResponse {
    if state.ready.load(Ordering::Relaxed) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "webhook listener not bound")
    }
}

pub async fn metrics(State(state): State<SharedOpsState>) -> impl IntoResponse {
    let mut buffer = String::new();
    match encode(&mut buffer, &state.registry) {
        Ok(()) => (
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buffer,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {e}"),
        )
            .into_response(),
    }
}
