//! HTTP request handlers.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use uuid::Uuid;

use crate::api::types::*;
use crate::domain::{
    ExecutionTrace, ExperimentStats, IsolationMode, RequestEnvelope, RequestMetadata, RunFailure,
    RunOutcome,
};
use crate::error::{PipelineError, ShieldResult};
use crate::storage::TraceStore;
use crate::AppState;

/// Run one input through the defense pipeline and store the trace.
///
/// POST /v1/pipeline/process
#[utoipa::path(
    post,
    path = "/v1/pipeline/process",
    request_body = ProcessRequest,
    responses(
        (status = 200, description = "Run complete", body = ProcessResponse),
        (status = 400, description = "Invalid request"),
        (status = 502, description = "Protected system error"),
        (status = 504, description = "Protected system timed out"),
        (status = 500, description = "Internal error")
    ),
    tag = "pipeline"
)]
pub async fn process_request(
    State(state): State<AppState>,
    Json(request): Json<ProcessRequest>,
) -> ShieldResult<Json<ProcessResponse>> {
    let isolation = match request.isolation_mode.as_deref() {
        Some(mode) => mode
            .parse::<IsolationMode>()
            .map_err(PipelineError::InvalidConfiguration)?,
        None => state.isolation,
    };
    let coordination = request
        .coordination_enabled
        .unwrap_or(state.coordination_enabled);
    let arm = if coordination { "coordinated" } else { "isolated" };

    let envelope = RequestEnvelope::new(
        request.user_input,
        request.attack_label,
        RequestMetadata::new(request.experiment_id.clone(), arm, 1, 0),
    );

    tracing::info!(
        request_id = %envelope.id,
        experiment = %request.experiment_id,
        isolation = %isolation,
        coordination,
        "Processing request"
    );

    let result = state
        .pipeline
        .process(&envelope, isolation, coordination, &request.experiment_id)
        .await;

    match result {
        Ok(trace) => {
            state.repository.store(&trace).await?;
            Ok(Json(ProcessResponse {
                outcome: RunOutcome::from_trace(&trace),
                trace,
            }))
        }
        Err(e) => {
            // Malformed requests never became runs.
            if !matches!(e, PipelineError::InvalidRequest(_)) {
                tracing::error!(
                    request_id = %envelope.id,
                    kind = e.kind(),
                    error = %e,
                    "Run failed"
                );
                let failure = RunFailure::new(&request.experiment_id, &envelope, &e);
                state.repository.record_failure(&failure).await?;
            }
            Err(e.into())
        }
    }
}

/// Get a stored execution trace.
///
/// GET /v1/traces/{id}
#[utoipa::path(
    get,
    path = "/v1/traces/{id}",
    params(
        ("id" = Uuid, Path, description = "Trace ID")
    ),
    responses(
        (status = 200, description = "Execution trace", body = ExecutionTrace),
        (status = 404, description = "Trace not found"),
        (status = 500, description = "Internal error")
    ),
    tag = "traces"
)]
pub async fn get_trace(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ShieldResult<Json<ExecutionTrace>> {
    let trace = state.repository.get_trace(id).await?;
    Ok(Json(trace))
}

/// List the traces of one experiment.
///
/// GET /v1/experiments/{id}/traces
#[utoipa::path(
    get,
    path = "/v1/experiments/{id}/traces",
    params(
        ("id" = String, Path, description = "Experiment ID"),
        ("limit" = Option<i64>, Query, description = "Maximum results (default 50)"),
        ("offset" = Option<i64>, Query, description = "Pagination offset")
    ),
    responses(
        (status = 200, description = "Trace listing", body = ListTracesResponse),
        (status = 500, description = "Internal error")
    ),
    tag = "experiments"
)]
pub async fn list_experiment_traces(
    State(state): State<AppState>,
    Path(experiment_id): Path<String>,
    Query(query): Query<ListTracesQuery>,
) -> ShieldResult<Json<ListTracesResponse>> {
    let limit = query.limit.clamp(1, 500);
    let offset = query.offset.max(0);

    let traces = state
        .repository
        .list_traces(&experiment_id, limit, offset)
        .await?;

    Ok(Json(ListTracesResponse {
        experiment_id,
        total: traces.len(),
        traces,
        limit,
        offset,
    }))
}

/// Attack success statistics of one experiment.
///
/// GET /v1/experiments/{id}/summary
#[utoipa::path(
    get,
    path = "/v1/experiments/{id}/summary",
    params(
        ("id" = String, Path, description = "Experiment ID")
    ),
    responses(
        (status = 200, description = "Experiment statistics", body = ExperimentStats),
        (status = 404, description = "No runs recorded for the experiment"),
        (status = 500, description = "Internal error")
    ),
    tag = "experiments"
)]
pub async fn get_experiment_summary(
    State(state): State<AppState>,
    Path(experiment_id): Path<String>,
) -> ShieldResult<Json<ExperimentStats>> {
    let stats = state.repository.experiment_stats(&experiment_id).await?;
    Ok(Json(stats))
}

/// Health check endpoint.
///
/// GET /v1/health
#[utoipa::path(
    get,
    path = "/v1/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    // Check database connectivity
    let db_status = match sqlx::query("SELECT 1")
        .fetch_one(state.repository.pool())
        .await
    {
        Ok(_) => "connected".to_string(),
        Err(e) => format!("error: {}", e),
    };

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: db_status,
        target: state.pipeline.target_name().to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}
