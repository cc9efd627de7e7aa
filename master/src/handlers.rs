use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use common::{
    FailoverStats, GridError, JobAssignmentRequest, JobAssignmentResponse, JobCompleteRequest,
    JobCompleteResponse, StealRequest, StealResponse, TaskInfo, TaskRequest,
    WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerMetrics, WorkerRegisterRequest,
    WorkerRegisterResponse,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::sessions::{self, status_for_session};
use crate::state::AppState;
use crate::{scheduler, stealing, workers};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/tasks", post(create_task))
        .route("/api/v1/tasks/:id", get(get_task))
        .route("/api/v1/tasks/:id/cancel", post(cancel_task))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/jobs/next", post(assign_job))
        .route("/api/v1/jobs/complete", post(complete_job))
        .route("/api/v1/jobs/steal", post(steal_jobs))
        .route("/api/v1/failover/stats", get(failover_stats))
        .route(
            "/api/v1/sessions/:task_id/attributes",
            get(sessions::list_attributes),
        )
        .route(
            "/api/v1/sessions/:task_id/attributes/:key",
            get(sessions::get_attribute).put(sessions::set_attribute),
        )
        .route(
            "/api/v1/sessions/:task_id/attributes/:key/wait",
            post(sessions::wait_attribute),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn status_for(err: &GridError) -> StatusCode {
    match err {
        GridError::TaskNotFound(_) | GridError::JobNotFound(_) | GridError::WorkerNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        GridError::NoWorkersAvailable => StatusCode::SERVICE_UNAVAILABLE,
        GridError::TaskFinished(_) | GridError::Config(_) => StatusCode::CONFLICT,
        GridError::EmptyTask => StatusCode::BAD_REQUEST,
        GridError::Session(e) => status_for_session(e),
    }
}

fn reject(err: GridError) -> StatusCode {
    let status = status_for(&err);
    if status.is_server_error() || status == StatusCode::CONFLICT {
        warn!("{}", err);
    }
    status
}

/* ---------------- handlers HTTP ---------------- */

#[derive(Serialize)]
struct Health {
    status: &'static str,
    open_sessions: usize,
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        open_sessions: state.sessions.len(),
    })
}

async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<TaskRequest>,
) -> Result<Json<TaskInfo>, StatusCode> {
    scheduler::submit_task(&state, req).map(Json).map_err(reject)
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskInfo>, StatusCode> {
    scheduler::task_info(&state, &id).map(Json).map_err(reject)
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskInfo>, StatusCode> {
    scheduler::cancel_task(&state, &id).map(Json).map_err(reject)
}

async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> Result<Json<WorkerRegisterResponse>, StatusCode> {
    let worker_id = workers::register(&state, req).map_err(reject)?;
    Ok(Json(WorkerRegisterResponse { worker_id }))
}

async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> Result<Json<WorkerHeartbeatResponse>, StatusCode> {
    let cancelled_tasks = workers::heartbeat(&state, req).map_err(reject)?;
    Ok(Json(WorkerHeartbeatResponse {
        ok: true,
        cancelled_tasks,
    }))
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerMetrics>> {
    Json(workers::list_workers(&state))
}

async fn assign_job(
    State(state): State<AppState>,
    Json(req): Json<JobAssignmentRequest>,
) -> Result<Json<JobAssignmentResponse>, StatusCode> {
    let job = scheduler::next_job(&state, &req.worker_id).map_err(reject)?;
    Ok(Json(JobAssignmentResponse { job }))
}

async fn complete_job(
    State(state): State<AppState>,
    Json(req): Json<JobCompleteRequest>,
) -> Result<Json<JobCompleteResponse>, StatusCode> {
    scheduler::complete_job(&state, req).map_err(reject)?;
    Ok(Json(JobCompleteResponse { ok: true }))
}

async fn steal_jobs(
    State(state): State<AppState>,
    Json(req): Json<StealRequest>,
) -> Result<Json<StealResponse>, StatusCode> {
    let stolen = stealing::steal_jobs(&state, &req.worker_id, req.max_jobs).map_err(reject)?;
    Ok(Json(StealResponse { stolen }))
}

async fn failover_stats(State(state): State<AppState>) -> Json<FailoverStats> {
    Json(state.failover.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{ConfigError, SessionError};

    #[test]
    fn errores_se_traducen_a_status_http() {
        assert_eq!(
            status_for(&GridError::TaskNotFound("t".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&GridError::NoWorkersAvailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_for(&GridError::EmptyTask), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&GridError::Config(ConfigError::Inconsistent {
                name: "failover:max_attempts".into(),
                local: "5".into(),
                remote: "3".into(),
            })),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&GridError::Session(SessionError::Timeout {
                key: "k".into(),
                timeout_ms: 10,
            })),
            StatusCode::REQUEST_TIMEOUT
        );
    }
}
