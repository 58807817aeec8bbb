//! Route definitions for the API.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api::handlers;
use crate::AppState;

/// OpenAPI documentation.
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::process_request,
        handlers::get_trace,
        handlers::list_experiment_traces,
        handlers::get_experiment_summary,
        handlers::health_check,
    ),
    components(schemas(
        crate::api::types::ProcessRequest,
        crate::api::types::ProcessResponse,
        crate::api::types::ListTracesQuery,
        crate::api::types::ListTracesResponse,
        crate::api::types::HealthResponse,
        crate::domain::ExecutionTrace,
        crate::domain::TraceSummary,
        crate::domain::PropagationStep,
        crate::domain::BypassMechanism,
        crate::domain::LayerVerdict,
        crate::domain::LayerId,
        crate::domain::Decision,
        crate::domain::CoordinationContext,
        crate::domain::AdaptiveAdjustment,
        crate::domain::GrantedContext,
        crate::domain::TrustBoundaryViolation,
        crate::domain::ViolationCategory,
        crate::domain::RequestEnvelope,
        crate::domain::RequestMetadata,
        crate::domain::IsolationMode,
        crate::domain::RunOutcome,
        crate::domain::ExperimentStats,
    )),
    tags(
        (name = "pipeline", description = "Defense pipeline runs"),
        (name = "traces", description = "Stored execution traces"),
        (name = "experiments", description = "Per-experiment listings and statistics"),
        (name = "health", description = "Health and status endpoints")
    ),
    info(
        title = "Shield Stack API",
        version = "0.1.0",
        description = "Layered prompt-injection defense - runs inputs through five defense layers and records how they interact",
        license(name = "MIT")
    )
)]
pub struct ApiDoc;

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/pipeline/process", post(handlers::process_request))
        .route("/v1/traces/:id", get(handlers::get_trace))
        .route(
            "/v1/experiments/:id/traces",
            get(handlers::list_experiment_traces),
        )
        .route(
            "/v1/experiments/:id/summary",
            get(handlers::get_experiment_summary),
        )
        .route("/v1/health", get(handlers::health_check))
        .with_state(state)
        // OpenAPI docs
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
