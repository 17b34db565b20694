//! HTTP surface: the module execution data plane and the health/metrics
//! plane.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use sidecar_lib::models::{
    PhaseTimings, ResourceLimits, RunRequest, DEFAULT_CPU_QUOTA_MILLICORES,
    DEFAULT_MEMORY_LIMIT_MB,
};
use sidecar_lib::observability::SidecarMetrics;
use sidecar_lib::readiness::ReadinessController;
use sidecar_lib::RequestExecutor;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Header carrying the CPU quota in millicores.
pub const CPU_QUOTA_HEADER: &str = "cpu_quota";
/// Header carrying the memory limit in MB.
pub const MEMORY_REQUEST_HEADER: &str = "Memory-Request";

/// Shared application state
pub struct AppState {
    pub executor: Arc<RequestExecutor>,
    pub readiness: Arc<ReadinessController>,
    pub metrics: SidecarMetrics,
    pub pod_uid: String,
    pub strict_validation: bool,
}

#[derive(Debug, Deserialize)]
struct PostRequestBody {
    #[serde(default)]
    parameter: String,
}

/// Create the data-plane router.
pub fn data_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/:wasm_file", get(handle_get).post(handle_post))
        .with_state(state)
}

/// Create the health/metrics router.
pub fn health_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/live", get(live))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Start the data-plane server.
pub async fn serve_data(addr: String, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = data_router(state);
    info!(addr = %addr, "starting web server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Start the health/metrics server.
pub async fn serve_health(addr: String, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = health_router(state);
    info!(addr = %addr, "starting healthcheck server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_get(
    State(state): State<Arc<AppState>>,
    Path(wasm_file): Path<String>,
    headers: HeaderMap,
) -> Response {
    handle_request(state, wasm_file, headers, String::new()).await
}

async fn handle_post(
    State(state): State<Arc<AppState>>,
    Path(wasm_file): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let parameter = match serde_json::from_str::<PostRequestBody>(&body) {
        Ok(body) => body.parameter,
        Err(e) => {
            debug!(reason = %e, "invalid JSON body, using empty parameter");
            String::new()
        }
    };
    handle_request(state, wasm_file, headers, parameter).await
}

async fn handle_request(
    state: Arc<AppState>,
    wasm_file: String,
    headers: HeaderMap,
    parameter: String,
) -> Response {
    info!("received a request");

    let (limits, valid) = parse_resource_headers(&headers);
    if !valid {
        info!(wasm_file = %wasm_file, "request did not specify resources");
        if state.strict_validation {
            return (StatusCode::BAD_REQUEST, "Invalid request\n").into_response();
        }
        debug!("falling back to default resource limits");
    }

    state.metrics.request_started();
    let result = state
        .executor
        .execute(RunRequest {
            wasm_file,
            parameter,
            limits,
        })
        .await;

    match result {
        Ok(outcome) => {
            state.metrics.request_finished("success");
            observe_phases(&state.metrics, &outcome.timings);

            let body = format!("WASM output: {}", outcome.output.trim_end_matches('\0'));
            let mut response = (StatusCode::OK, body).into_response();
            let headers = response.headers_mut();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            headers.insert(
                HeaderName::from_static("cgroup-creation-time"),
                decimal_value(outcome.timings.cgroup_create_ms),
            );
            headers.insert(
                HeaderName::from_static("cgroup-assign-time"),
                decimal_value(outcome.timings.cgroup_assign_ms),
            );
            headers.insert(
                HeaderName::from_static("execution-time"),
                decimal_value(outcome.timings.execution_ms),
            );
            headers.insert(
                HeaderName::from_static("num-current-requests"),
                decimal_value(outcome.in_flight),
            );
            if let Ok(pod) = HeaderValue::from_str(&state.pod_uid) {
                headers.insert(HeaderName::from_static("pod"), pod);
            }
            response
        }
        Err(e) => {
            state.metrics.request_finished("error");
            error!(reason = %e, "failed to run WASM thread");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to run WASM module").into_response()
        }
    }
}

async fn live() -> impl IntoResponse {
    Json(serde_json::json!({}))
}

async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.readiness.check().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder.encode(&metric_families, &mut buffer).unwrap();

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

fn parse_resource_headers(headers: &HeaderMap) -> (ResourceLimits, bool) {
    let cpu = header_u64(headers, CPU_QUOTA_HEADER);
    let memory = header_u64(headers, MEMORY_REQUEST_HEADER);
    let valid = cpu.is_some() && memory.is_some();

    (
        ResourceLimits {
            cpu_quota_millicores: cpu.unwrap_or(DEFAULT_CPU_QUOTA_MILLICORES),
            memory_limit_mb: memory.unwrap_or(DEFAULT_MEMORY_LIMIT_MB),
        },
        valid,
    )
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

fn decimal_value(value: impl ToString) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).expect("decimal strings are valid header values")
}

fn observe_phases(metrics: &SidecarMetrics, timings: &PhaseTimings) {
    metrics.observe_phase("cgroup_create", timings.cgroup_create_ms as f64 / 1000.0);
    metrics.observe_phase("cgroup_assign", timings.cgroup_assign_ms as f64 / 1000.0);
    metrics.observe_phase("execution", timings.execution_ms as f64 / 1000.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_parse_into_limits() {
        let mut headers = HeaderMap::new();
        headers.insert(CPU_QUOTA_HEADER, HeaderValue::from_static("1000"));
        headers.insert(MEMORY_REQUEST_HEADER, HeaderValue::from_static("128"));

        let (limits, valid) = parse_resource_headers(&headers);
        assert!(valid);
        assert_eq!(limits.cpu_quota_millicores, 1000);
        assert_eq!(limits.memory_limit_mb, 128);
    }

    #[test]
    fn missing_headers_are_invalid_and_default() {
        let (limits, valid) = parse_resource_headers(&HeaderMap::new());
        assert!(!valid);
        assert_eq!(limits.cpu_quota_millicores, DEFAULT_CPU_QUOTA_MILLICORES);
        assert_eq!(limits.memory_limit_mb, DEFAULT_MEMORY_LIMIT_MB);
    }

    #[test]
    fn unparseable_headers_are_invalid_and_default() {
        let mut headers = HeaderMap::new();
        headers.insert(CPU_QUOTA_HEADER, HeaderValue::from_static("lots"));
        headers.insert(MEMORY_REQUEST_HEADER, HeaderValue::from_static("128"));

        let (limits, valid) = parse_resource_headers(&headers);
        assert!(!valid);
        assert_eq!(limits.cpu_quota_millicores, DEFAULT_CPU_QUOTA_MILLICORES);
        assert_eq!(limits.memory_limit_mb, 128);
    }
}
