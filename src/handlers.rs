use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

use crate::auth;
use crate::config::Config;
use crate::error::BenchError;
use crate::evaluation::{Halt, Orchestrator};
use crate::metrics::Metrics;
use crate::report::ReportFormat;
use crate::router::RoutedEvent;
use crate::types::{RunConfig, RunId};
use crate::ws;

pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: Orchestrator,
    pub metrics: Arc<Metrics>,
    pub events_tx: broadcast::Sender<RoutedEvent>,
    pub started_at: chrono::DateTime<Utc>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/models", get(list_models))
        .route("/runs", post(start_run).get(list_runs))
        .route("/runs/:id", get(get_run).delete(delete_run))
        .route("/runs/:id/resume", post(resume_run))
        .route("/runs/:id/results", get(run_results))
        .route("/runs/:id/report", get(run_report))
        .route("/pause", post(pause))
        .route("/stop", post(stop))
        .route("/progress", get(progress))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Bench(BenchError),
}

impl From<BenchError> for ApiError {
    fn from(e: BenchError) -> Self {
        ApiError::Bench(e)
    }
}

pub fn status_for(err: &BenchError) -> StatusCode {
    match err {
        BenchError::Config(_) => StatusCode::BAD_REQUEST,
        BenchError::NotFound(_) => StatusCode::NOT_FOUND,
        BenchError::InvalidState(_) => StatusCode::CONFLICT,
        BenchError::Dataset(_) => StatusCode::UNPROCESSABLE_ENTITY,
        BenchError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        BenchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        BenchError::Inference(_) | BenchError::JudgeParse(_) => StatusCode::BAD_GATEWAY,
        BenchError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Invalid token".to_string(),
            ),
            ApiError::Bench(e) => {
                let status = status_for(&e);
                if status.is_server_error() {
                    warn!(code = e.code(), error = %e, "Request failed");
                }
                (status, e.code(), e.to_string())
            }
        };
        (
            status,
            Json(serde_json::json!({ "error": code, "message": message })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn require_auth(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    if auth::authorized(headers, state.config.auth_token.as_deref()) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_secs: i64,
    active_run: Option<RunId>,
    capacity: usize,
    available_slots: usize,
    queued: usize,
    in_flight: usize,
    ws_clients: usize,
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let scheduler = state.orchestrator.scheduler();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        active_run: state.orchestrator.active_run(),
        capacity: scheduler.concurrency(),
        available_slots: scheduler.available_slots(),
        queued: scheduler.queued(),
        in_flight: scheduler.in_flight(),
        ws_clients: state.events_tx.receiver_count(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let body = state.metrics.render_prometheus();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

async fn list_models(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.orchestrator.list_models().await?))
}

async fn start_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<RunConfig>,
) -> ApiResult<impl IntoResponse> {
    require_auth(&state, &headers)?;
    let run_id = state.orchestrator.start(payload)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "run_id": run_id })),
    ))
}

async fn list_runs(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.list_runs()?))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RunId>,
) -> ApiResult<Json<serde_json::Value>> {
    let orch = &state.orchestrator;
    let run = orch.run(id)?;
    Ok(Json(serde_json::json!({
        "run": run,
        "progress": orch.progress(id)?,
        "transitions": orch.transitions(id),
        "active": orch.active_run() == Some(id),
    })))
}

async fn delete_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<RunId>,
) -> ApiResult<StatusCode> {
    require_auth(&state, &headers)?;
    state.orchestrator.delete_run(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resume_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<RunId>,
) -> ApiResult<impl IntoResponse> {
    require_auth(&state, &headers)?;
    state.orchestrator.resume(id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "run_id": id })),
    ))
}

async fn run_results(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RunId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.results(id)?))
}

#[derive(Deserialize)]
struct ReportQuery {
    #[serde(default)]
    format: ReportFormat,
}

async fn run_report(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RunId>,
    Query(query): Query<ReportQuery>,
) -> ApiResult<Response> {
    let artifact = state.orchestrator.generate_report(id, query.format)?;
    let disposition = format!("inline; filename=\"{}\"", artifact.file_name);
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, artifact.format.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        artifact.body,
    )
        .into_response())
}

fn request_halt(state: &AppState, headers: &HeaderMap, halt: Halt) -> ApiResult<impl IntoResponse> {
    require_auth(state, headers)?;
    let run_id = state.orchestrator.request_halt(halt)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "run_id": run_id, "requested": halt })),
    ))
}

async fn pause(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    request_halt(&state, &headers, Halt::Pause)
}

async fn stop(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    request_halt(&state, &headers, Halt::Stop)
}

async fn progress(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.get_progress()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::{Collaborators, Settings};
    use crate::report::TableReporter;
    use crate::router::EventRouter;
    use crate::store::{MemoryStore, ResultStore};
    use crate::testkit::{tasks, MockBackend, StaticTaskSource};
    use crate::types::RunStatus;
    use tokio_test::{assert_err, assert_ok};

    fn state(auth_token: Option<&str>) -> Arc<AppState> {
        let store: Arc<dyn ResultStore> = Arc::new(MemoryStore::new());
        let metrics = Metrics::new();
        let orchestrator = Orchestrator::new(
            Collaborators {
                backend: Arc::new(MockBackend::new()),
                store: store.clone(),
                tasks: Arc::new(StaticTaskSource(tasks(2))),
                reporter: Arc::new(TableReporter::new(store)),
            },
            Settings::default(),
            EventRouter::spawn(),
            metrics.clone(),
        );
        let mut config = Config::from_env();
        config.auth_token = auth_token.map(String::from);
        Arc::new(AppState {
            config: Arc::new(config),
            orchestrator,
            metrics,
            events_tx: broadcast::channel(16).0,
            started_at: Utc::now(),
        })
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {}", token).parse().unwrap(),
        );
        headers
    }

    fn config() -> RunConfig {
        RunConfig::new(vec!["model-a".into()], "judge")
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(status_for(&BenchError::Config("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&BenchError::InvalidState("x".into())), StatusCode::CONFLICT);
        assert_eq!(status_for(&BenchError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&BenchError::Timeout(5)), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_for(&BenchError::Persistence("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let response = ApiError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_mutating_endpoints_require_token() {
        let state = state(Some("secret"));
        let denied = start_run(State(state.clone()), HeaderMap::new(), Json(config())).await;
        assert_eq!(
            denied.map(|r| r.into_response().status()).unwrap_or_else(|e| e.into_response().status()),
            StatusCode::UNAUTHORIZED
        );
        assert!(state.orchestrator.list_runs().unwrap().is_empty());

        let accepted = start_run(State(state.clone()), bearer("secret"), Json(config())).await;
        let response = assert_ok!(accepted).into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        state.orchestrator.wait_for_idle().await;
    }

    #[tokio::test]
    async fn test_run_lifecycle_over_handlers() {
        let state = state(None);
        assert_ok!(start_run(State(state.clone()), HeaderMap::new(), Json(config())).await);
        state.orchestrator.wait_for_idle().await;

        let runs = state.orchestrator.list_runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Completed);
        let id = runs[0].id;

        let Json(detail) = assert_ok!(get_run(State(state.clone()), Path(id)).await);
        assert_eq!(detail["progress"]["percent"], 100.0);
        assert_eq!(detail["run"]["status"], "COMPLETED");

        let report = assert_ok!(
            run_report(
                State(state.clone()),
                Path(id),
                Query(ReportQuery {
                    format: ReportFormat::Csv
                })
            )
            .await
        );
        assert_eq!(report.status(), StatusCode::OK);
        assert_eq!(
            report.headers()[header::CONTENT_TYPE],
            "text/csv; charset=utf-8"
        );

        match pause(State(state.clone()), HeaderMap::new()).await {
            Ok(_) => panic!("pause accepted without an active run"),
            Err(e) => assert_eq!(e.into_response().status(), StatusCode::CONFLICT),
        }

        let status = assert_ok!(delete_run(State(state.clone()), HeaderMap::new(), Path(id)).await);
        assert_eq!(status, StatusCode::NO_CONTENT);
        let err = assert_err!(get_run(State(state), Path(id)).await);
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }
}
