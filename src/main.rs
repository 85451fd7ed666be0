mod adapters;
mod config;
mod events;
mod grid;
mod http;
mod metrics;
mod models;
mod pricing;
mod retry;
mod runner;
mod scheduler;
mod security;
mod store;
mod variants;

use adapters::demo::{DemoDriver, DemoSource};
use adapters::jsonld::JsonLdSource;
use adapters::{ListingDriver, SourceExtractor};
use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use config::{EngineConfig, SourceKind};
use events::EventBus;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, Batch, JobStatus, MappingOverride};
use scheduler::{BatchAccepted, BatchRequest, BatchStatus, Scheduler, SchedulerError};
use security::{AuthState, Operator, require_api_auth};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{convert::Infallible, net::SocketAddr, sync::Arc};
use store::{ProgressStore, RedisKv};
use tokio_stream::{StreamExt, wrappers::BroadcastStream, wrappers::errors::BroadcastStreamRecvError};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "crosslist.api", "engine crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = EngineConfig::from_env()?;
    let store = match config.redis_url.as_deref() {
        Some(url) => {
            info!(target = "crosslist.api", namespace = %config.store_namespace, "using redis progress store");
            ProgressStore::new(Arc::new(RedisKv::open(url, &config.store_namespace)?))
        }
        None => {
            warn!(
                target = "crosslist.api",
                "REDIS_URL not set; progress lives in memory and will not survive a restart"
            );
            ProgressStore::in_memory()
        }
    };
    let source: Arc<dyn SourceExtractor> = match config.source {
        SourceKind::Demo => Arc::new(DemoSource::new()),
        SourceKind::JsonLd => Arc::new(JsonLdSource::new(
            http::build_client(),
            config.jsonld_assumed_stock,
        )),
    };
    let driver: Arc<dyn ListingDriver> = Arc::new(DemoDriver::default());
    let events = EventBus::new(config.event_buffer);

    let (scheduler, _housekeeping) = Scheduler::spawn(
        store,
        source,
        driver,
        events,
        config.runner_config(),
        config.scheduler_config(),
    );
    let recovered = scheduler.recover().await?;
    info!(
        target = "crosslist.api",
        instance_id = scheduler.instance_id(),
        resumed = recovered.resumed,
        queued = recovered.queued,
        parked = recovered.parked,
        "recovery complete"
    );

    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    let state = AppState {
        scheduler: scheduler.clone(),
        prometheus_handle,
        metrics_key: std::env::var("METRICS_KEY").ok().map(Arc::from),
    };
    let app = router(state, AuthState::from_env(), config.request_max_bytes);

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "crosslist.api", "listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    scheduler.shutdown().await;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    scheduler: Scheduler,
    prometheus_handle: PrometheusHandle,
    metrics_key: Option<Arc<str>>,
}

fn router(state: AppState, auth_state: AuthState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/batches", post(start_batch).get(list_batches))
        .route("/batches/{id}", get(batch_status))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(job_status))
        .route("/jobs/{id}/terminate", post(terminate_job))
        .route("/jobs/{id}/review", post(resolve_review))
        .nest(
            "/control",
            Router::new()
                .route("/pause", post(pause))
                .route("/resume", post(resume))
                .route("/terminate", post(terminate_all)),
        )
        .route("/events", get(progress_stream))
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "crosslist-engine",
        "instance_id": state.scheduler.instance_id(),
        "paused": state.scheduler.is_paused(),
    }))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = state.metrics_key.as_deref() {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Start a bulk cross-listing batch.
///
/// - Method: `POST`
/// - Path: `/batches`
/// - Auth: `Authorization: Bearer <key>` or `X-Engine-Key: <key>`
/// - Headers: optional `Idempotency-Key`; a repeated key returns the original batch
/// - Body: `BatchRequest`
async fn start_batch(
    State(state): State<AppState>,
    Extension(operator): Extension<Operator>,
    headers: HeaderMap,
    Json(mut payload): Json<BatchRequest>,
) -> Result<Json<BatchAccepted>, AppError> {
    crate::metrics::inc_requests("/batches");
    payload.idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    info!(
        target = "crosslist.api",
        operator = %operator.name,
        api_key = %operator.key_id,
        links = payload.links.len(),
        "batch requested",
    );
    let accepted = state.scheduler.start_batch(payload).await?;
    Ok(Json(accepted))
}

async fn list_batches(State(state): State<AppState>) -> Result<Json<Vec<Batch>>, AppError> {
    crate::metrics::inc_requests("/batches");
    Ok(Json(state.scheduler.batches().await?))
}

async fn batch_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BatchStatus>, AppError> {
    crate::metrics::inc_requests("/batches/{id}");
    Ok(Json(state.scheduler.batch_status(&id).await?))
}

async fn list_jobs(State(state): State<AppState>) -> Result<Json<Vec<JobStatus>>, AppError> {
    crate::metrics::inc_requests("/jobs");
    Ok(Json(state.scheduler.jobs().await?))
}

async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobStatus>, AppError> {
    crate::metrics::inc_requests("/jobs/{id}");
    Ok(Json(state.scheduler.job_status(&id).await?))
}

#[derive(Debug, Serialize)]
struct ControlResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    aborted: Option<Vec<String>>,
}

async fn pause(State(state): State<AppState>) -> Json<ControlResponse> {
    crate::metrics::inc_requests("/control/pause");
    state.scheduler.pause();
    Json(ControlResponse {
        ok: true,
        aborted: None,
    })
}

async fn resume(State(state): State<AppState>) -> Json<ControlResponse> {
    crate::metrics::inc_requests("/control/resume");
    state.scheduler.resume();
    Json(ControlResponse {
        ok: true,
        aborted: None,
    })
}

async fn terminate_all(
    State(state): State<AppState>,
    Extension(operator): Extension<Operator>,
) -> Result<Json<ControlResponse>, AppError> {
    crate::metrics::inc_requests("/control/terminate");
    info!(target = "crosslist.api", operator = %operator.name, "terminate all requested");
    let aborted = state.scheduler.terminate(None).await?;
    Ok(Json(ControlResponse {
        ok: true,
        aborted: Some(aborted),
    }))
}

async fn terminate_job(
    State(state): State<AppState>,
    Extension(operator): Extension<Operator>,
    Path(id): Path<String>,
) -> Result<Json<ControlResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/{id}/terminate");
    info!(target = "crosslist.api", operator = %operator.name, job_id = %id, "terminate requested");
    let aborted = state.scheduler.terminate(Some(&id)).await?;
    Ok(Json(ControlResponse {
        ok: true,
        aborted: Some(aborted),
    }))
}

#[derive(Debug, Deserialize)]
struct ReviewRequest {
    overrides: Vec<MappingOverride>,
}

/// Resume a job parked for manual review.
///
/// - Method: `POST`
/// - Path: `/jobs/{id}/review`
/// - Body: `{ "overrides": [MappingOverride] }`
/// - Errors: 409 when the job is not waiting for review
async fn resolve_review(
    State(state): State<AppState>,
    Extension(operator): Extension<Operator>,
    Path(id): Path<String>,
    Json(payload): Json<ReviewRequest>,
) -> Result<Json<JobStatus>, AppError> {
    crate::metrics::inc_requests("/jobs/{id}/review");
    info!(
        target = "crosslist.api",
        operator = %operator.name,
        job_id = %id,
        overrides = payload.overrides.len(),
        "review resolution submitted",
    );
    Ok(Json(
        state
            .scheduler
            .resolve_review(&id, payload.overrides)
            .await?,
    ))
}

/// Server-sent `progress` events, one per stage transition.
async fn progress_stream(State(state): State<AppState>) -> impl IntoResponse {
    crate::metrics::inc_requests("/events");
    let rx = state.scheduler.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => {
            let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            Some(Ok::<_, Infallible>(
                Event::default().event("progress").data(data),
            ))
        }
        Err(BroadcastStreamRecvError::Lagged(missed)) => Some(Ok(Event::default()
            .event("lagged")
            .data(json!({ "missed": missed }).to_string()))),
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug)]
enum AppError {
    Scheduler(SchedulerError),
}

impl From<SchedulerError> for AppError {
    fn from(value: SchedulerError) -> Self {
        Self::Scheduler(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Scheduler(err) => {
                let (status, code) = match &err {
                    SchedulerError::InvalidRequest(_) | SchedulerError::Policy(_) => {
                        (StatusCode::BAD_REQUEST, "invalid_request")
                    }
                    SchedulerError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                    SchedulerError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
                    SchedulerError::Store(_) | SchedulerError::Closed => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "internal")
                    }
                };
                if status.is_server_error() {
                    error!(target = "crosslist.api", error = %err, "request failed");
                }
                let payload = ApiError {
                    error: code.to_string(),
                    detail: Some(err.to_string()),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
