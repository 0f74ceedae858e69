//! Status and administration API
//!
//! Read routes never arm a cooldown or count a visit; only proxied
//! connections do that.

use axum::{
    extract::{Json as AxumJson, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use log::error;
use proxycop_core::host::normalize_host;
use proxycop_core::{AdmissionController, FailurePolicy, HostPolicy, PolicyError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Common response type that can be either data or an error
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ApiResponse<T> {
    Success(T),
    Error { error: String },
}

/// Response for the stats endpoint
#[derive(Debug, Serialize)]
struct StatsResponse {
    #[serde(rename = "Host")]
    host: String,
    #[serde(rename = "Visits")]
    visits: u64,
}

/// Response for the config endpoint
#[derive(Debug, Serialize)]
struct ConfigResponse {
    blacklist: Vec<String>,
    hosts: Vec<HostPolicy>,
    failure_policy: FailurePolicy,
}

/// Body of a host policy update
#[derive(Debug, Deserialize)]
struct PolicyUpdate {
    #[serde(default)]
    cooldown_minutes: u32,
    #[serde(default)]
    blacklisted: bool,
}

/// Create the API router over a shared controller
pub fn create_router(controller: Arc<AdmissionController>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/url/:hostname/status", get(get_status))
        .route("/url/:hostname/stats", get(get_stats))
        .route("/api/config", get(get_config))
        .route("/api/hosts/:hostname", get(get_host).put(put_host))
        .layer(TraceLayer::new_for_http())
        .with_state(controller)
}

fn error_status(error: &PolicyError) -> StatusCode {
    match error {
        PolicyError::InvalidHost(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond<T: Serialize>(result: Result<T, PolicyError>) -> (StatusCode, Json<ApiResponse<T>>) {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::Success(data))),
        Err(e) => {
            let status = error_status(&e);
            if status.is_server_error() {
                error!("API request failed: {}", e);
            }
            (status, Json(ApiResponse::Error { error: e.to_string() }))
        }
    }
}

/// Run a store-backed controller call on the blocking pool
async fn with_controller<T, F>(
    controller: Arc<AdmissionController>,
    call: F,
) -> (StatusCode, Json<ApiResponse<T>>)
where
    T: Serialize + Send + 'static,
    F: FnOnce(&AdmissionController) -> Result<T, PolicyError> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || call(&controller)).await {
        Ok(result) => respond(result),
        Err(e) => {
            error!("API worker task failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::Error { error: "internal error".to_string() }),
            )
        }
    }
}

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Blacklist membership and cooldown seconds left for a host
async fn get_status(
    State(controller): State<Arc<AdmissionController>>,
    Path(hostname): Path<String>,
) -> impl IntoResponse {
    with_controller(controller, move |c| c.status(&hostname)).await
}

async fn get_stats(
    State(controller): State<Arc<AdmissionController>>,
    Path(hostname): Path<String>,
) -> impl IntoResponse {
    with_controller(controller, move |c| {
        let host = normalize_host(&hostname)?;
        let visits = c.visit_count(&host)?;
        Ok(StatsResponse { host, visits })
    })
    .await
}

async fn get_config(State(controller): State<Arc<AdmissionController>>) -> impl IntoResponse {
    with_controller(controller, |c| {
        Ok(ConfigResponse {
            blacklist: c.blacklist(),
            hosts: c.policies()?,
            failure_policy: c.failure_policy(),
        })
    })
    .await
}

async fn get_host(
    State(controller): State<Arc<AdmissionController>>,
    Path(hostname): Path<String>,
) -> impl IntoResponse {
    with_controller(controller, move |c| c.policy(&hostname)).await
}

async fn put_host(
    State(controller): State<Arc<AdmissionController>>,
    Path(hostname): Path<String>,
    AxumJson(update): AxumJson<PolicyUpdate>,
) -> impl IntoResponse {
    with_controller(controller, move |c| {
        c.apply_policy(&HostPolicy {
            hostname,
            cooldown_minutes: update.cooldown_minutes,
            blacklisted: update.blacklisted,
        })
    })
    .await
}
