//! Database models for Shield Stack.
//!
//! These are the row types returned by SQLx queries.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::domain::{ExecutionTrace, RunFailure, TraceSummary};
use crate::error::ShieldError;

fn parse_uuid(value: &str) -> Result<Uuid, ShieldError> {
    Uuid::parse_str(value).map_err(|e| ShieldError::Internal(e.to_string()))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, ShieldError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ShieldError::Internal(e.to_string()))
}

/// Database row for the full trace document.
#[derive(Debug, Clone, FromRow)]
pub struct TraceDocumentRow {
    pub trace_id: String,
    pub trace_json: String,
}

impl TryFrom<TraceDocumentRow> for ExecutionTrace {
    type Error = ShieldError;

    fn try_from(row: TraceDocumentRow) -> Result<Self, Self::Error> {
        let trace: ExecutionTrace = serde_json::from_str(&row.trace_json)?;
        if trace.trace_id.to_string() != row.trace_id {
            return Err(ShieldError::Internal(format!(
                "Stored trace {} carries id {}",
                row.trace_id, trace.trace_id
            )));
        }
        Ok(trace)
    }
}

/// Database row for execution_traces listings.
#[derive(Debug, Clone, FromRow)]
pub struct TraceSummaryRow {
    pub trace_id: String,
    pub experiment_id: String,
    pub attack_label: String,
    pub isolation_mode: String,
    pub coordination_enabled: bool,
    pub blocked_at_layer: Option<String>,
    pub attack_successful: bool,
    pub violations: i64,
    pub duration_ms: i64,
    pub completed_at: String,
}

impl TryFrom<TraceSummaryRow> for TraceSummary {
    type Error = ShieldError;

    fn try_from(row: TraceSummaryRow) -> Result<Self, Self::Error> {
        Ok(TraceSummary {
            trace_id: parse_uuid(&row.trace_id)?,
            experiment_id: row.experiment_id,
            attack_label: row.attack_label,
            isolation_mode: row.isolation_mode.parse().map_err(ShieldError::Internal)?,
            coordination_enabled: row.coordination_enabled,
            blocked_at_layer: row
                .blocked_at_layer
                .map(|layer| layer.parse().map_err(ShieldError::Internal))
                .transpose()?,
            attack_successful: row.attack_successful,
            violations: row.violations.max(0) as u64,
            duration_ms: row.duration_ms.max(0) as u64,
            completed_at: parse_timestamp(&row.completed_at)?,
        })
    }
}

/// Database row for run_errors table.
#[derive(Debug, Clone, FromRow)]
pub struct RunFailureRow {
    pub id: String,
    pub experiment_id: String,
    pub request_id: String,
    pub attack_label: String,
    pub trial: i64,
    pub kind: String,
    pub detail: String,
    pub retryable: bool,
    pub created_at: String,
}

impl TryFrom<RunFailureRow> for RunFailure {
    type Error = ShieldError;

    fn try_from(row: RunFailureRow) -> Result<Self, Self::Error> {
        Ok(RunFailure {
            id: parse_uuid(&row.id)?,
            experiment_id: row.experiment_id,
            request_id: parse_uuid(&row.request_id)?,
            attack_label: row.attack_label,
            trial: u32::try_from(row.trial).map_err(|e| ShieldError::Internal(e.to_string()))?,
            kind: row.kind,
            detail: row.detail,
            retryable: row.retryable,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}
