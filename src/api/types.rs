//! API request and response types.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::domain::{ExecutionTrace, RunOutcome, TraceSummary};

// ==================== Pipeline ====================

/// Request to run one input through the defense pipeline.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ProcessRequest {
    /// The adversarial input.
    pub user_input: String,
    /// Attack type label, stored with the trace.
    #[serde(default = "default_attack_label")]
    pub attack_label: String,
    /// Experiment the run is filed under.
    #[serde(default = "default_experiment_id")]
    pub experiment_id: String,
    /// Overrides the configured isolation mode (`good` or `bad`).
    #[serde(default)]
    #[schema(example = "good")]
    pub isolation_mode: Option<String>,
    /// Overrides the configured coordination default.
    #[serde(default)]
    pub coordination_enabled: Option<bool>,
}

fn default_attack_label() -> String {
    "unlabeled".to_string()
}

fn default_experiment_id() -> String {
    "api".to_string()
}

/// Response from a pipeline run.
#[derive(Debug, Serialize, ToSchema)]
pub struct ProcessResponse {
    pub outcome: RunOutcome,
    /// The stored execution trace.
    pub trace: ExecutionTrace,
}

// ==================== Traces ====================

/// Query parameters for listing traces.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ListTracesQuery {
    /// Maximum number of results.
    #[serde(default = "default_limit")]
    pub limit: i64,
    /// Offset for pagination.
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// Response for listing traces of one experiment.
#[derive(Debug, Serialize, ToSchema)]
pub struct ListTracesResponse {
    pub experiment_id: String,
    pub traces: Vec<TraceSummary>,
    /// Number of traces returned.
    pub total: usize,
    pub limit: i64,
    pub offset: i64,
}

// ==================== Health ====================

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
    /// Service version.
    pub version: String,
    /// Database connectivity.
    pub database: String,
    /// Name of the protected system.
    pub target: String,
    /// Timestamp.
    pub timestamp: String,
}
