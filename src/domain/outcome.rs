//! Run outcome and experiment summary types.
//!
//! Keeps "attack succeeded", "attack blocked" and "run errored" apart so the
//! attack success rate is never computed over infrastructure failures.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{ExecutionTrace, IsolationMode, LayerId, RequestEnvelope};
use crate::error::PipelineError;

/// The three mutually exclusive outcomes of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The input got through every enabled layer.
    AttackSucceeded,
    /// A layer blocked the input.
    AttackBlocked { layer: LayerId },
    /// The run failed before a verdict could be rendered.
    Errored { kind: String, retryable: bool },
}

impl RunOutcome {
    pub fn from_trace(trace: &ExecutionTrace) -> Self {
        match trace.blocked_at_layer {
            Some(layer) => RunOutcome::AttackBlocked { layer },
            None => RunOutcome::AttackSucceeded,
        }
    }

    pub fn from_error(error: &PipelineError) -> Self {
        RunOutcome::Errored {
            kind: error.kind().to_string(),
            retryable: error.is_retryable(),
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::AttackSucceeded => write!(f, "attack_succeeded"),
            RunOutcome::AttackBlocked { layer } => write!(f, "attack_blocked:{}", layer),
            RunOutcome::Errored { kind, .. } => write!(f, "errored:{}", kind),
        }
    }
}

/// A run that ended in an error instead of a trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RunFailure {
    pub id: Uuid,
    pub experiment_id: String,
    pub request_id: Uuid,
    pub attack_label: String,
    pub trial: u32,
    /// Stable error kind (e.g. `upstream_timeout`).
    pub kind: String,
    pub detail: String,
    pub retryable: bool,
    pub created_at: DateTime<Utc>,
}

impl RunFailure {
    pub fn new(experiment_id: &str, request: &RequestEnvelope, error: &PipelineError) -> Self {
        Self {
            id: Uuid::new_v4(),
            experiment_id: experiment_id.to_string(),
            request_id: request.id,
            attack_label: request.attack_label.clone(),
            trial: request.metadata.trial,
            kind: error.kind().to_string(),
            detail: error.to_string(),
            retryable: error.is_retryable(),
            created_at: Utc::now(),
        }
    }
}

/// Stored-run statistics for one experiment id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ExperimentStats {
    pub experiment_id: String,
    pub total_traces: i64,
    pub successful_attacks: i64,
    pub blocked_attacks: i64,
    pub errors: i64,
    /// Percentage (0-100) over completed runs.
    pub attack_success_rate: f64,
}

impl ExperimentStats {
    pub fn new(
        experiment_id: impl Into<String>,
        successful_attacks: i64,
        blocked_attacks: i64,
        errors: i64,
    ) -> Self {
        let completed = successful_attacks + blocked_attacks;
        Self {
            experiment_id: experiment_id.into(),
            total_traces: completed,
            successful_attacks,
            blocked_attacks,
            errors,
            attack_success_rate: success_rate(successful_attacks as u64, completed as u64),
        }
    }
}

fn success_rate(successes: u64, completed: u64) -> f64 {
    if completed == 0 {
        0.0
    } else {
        successes as f64 / completed as f64 * 100.0
    }
}

/// Summary report written at the end of an experiment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ExperimentSummary {
    pub experiment: String,
    pub config: String,
    pub coordination_enabled: bool,
    pub isolation_mode: IsolationMode,
    /// Runs attempted, including errored ones.
    pub total_runs: u64,
    pub successful_attacks: u64,
    pub blocked_attacks: u64,
    pub errors: u64,
    /// Percentage (0-100) over completed runs.
    pub attack_success_rate: f64,
    pub blocked_by_layer: BTreeMap<String, u64>,
    pub errors_by_kind: BTreeMap<String, u64>,
    pub adaptive_adjustments: u64,
    pub trust_boundary_violations: BTreeMap<String, u64>,
    pub bypass_mechanisms: u64,
    pub elapsed_time_seconds: f64,
    pub database: String,
    pub timestamp: DateTime<Utc>,
}

impl ExperimentSummary {
    pub fn new(
        experiment: impl Into<String>,
        config: impl Into<String>,
        coordination_enabled: bool,
        isolation_mode: IsolationMode,
        database: impl Into<String>,
    ) -> Self {
        Self {
            experiment: experiment.into(),
            config: config.into(),
            coordination_enabled,
            isolation_mode,
            total_runs: 0,
            successful_attacks: 0,
            blocked_attacks: 0,
            errors: 0,
            attack_success_rate: 0.0,
            blocked_by_layer: BTreeMap::new(),
            errors_by_kind: BTreeMap::new(),
            adaptive_adjustments: 0,
            trust_boundary_violations: BTreeMap::new(),
            bypass_mechanisms: 0,
            elapsed_time_seconds: 0.0,
            database: database.into(),
            timestamp: Utc::now(),
        }
    }

    /// Count a completed run.
    pub fn record_trace(&mut self, trace: &ExecutionTrace) {
        self.total_runs += 1;
        match RunOutcome::from_trace(trace) {
            RunOutcome::AttackBlocked { layer } => {
                self.blocked_attacks += 1;
                *self.blocked_by_layer.entry(layer.to_string()).or_insert(0) += 1;
            }
            _ => self.successful_attacks += 1,
        }
        self.adaptive_adjustments += trace.adjustment_count() as u64;
        self.bypass_mechanisms += trace.bypass_mechanisms.len() as u64;
        for violation in &trace.trust_boundary_violations {
            *self
                .trust_boundary_violations
                .entry(violation.category.to_string())
                .or_insert(0) += 1;
        }
        self.refresh_rate();
    }

    /// Count an errored run.
    pub fn record_error(&mut self, error: &PipelineError) {
        self.total_runs += 1;
        self.errors += 1;
        *self
            .errors_by_kind
            .entry(error.kind().to_string())
            .or_insert(0) += 1;
    }

    pub fn completed_runs(&self) -> u64 {
        self.successful_attacks + self.blocked_attacks
    }

    /// Stamp elapsed time and completion timestamp.
    pub fn finish(&mut self, elapsed_time_seconds: f64) {
        self.elapsed_time_seconds = elapsed_time_seconds;
        self.timestamp = Utc::now();
        self.refresh_rate();
    }

    fn refresh_rate(&mut self) {
        self.attack_success_rate = success_rate(self.successful_attacks, self.completed_runs());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_stats_rate_excludes_errors() {
        let stats = ExperimentStats::new("exp5_isolated", 3, 1, 6);
        assert_eq!(stats.total_traces, 4);
        assert!((stats.attack_success_rate - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_stats_empty_rate_is_zero() {
        let stats = ExperimentStats::new("exp5_isolated", 0, 0, 2);
        assert_eq!(stats.attack_success_rate, 0.0);
    }

    #[test]
    fn test_summary_counts_errors_separately() {
        let mut summary = ExperimentSummary::new(
            "exp5_coordination",
            "coordinated",
            true,
            IsolationMode::Good,
            "results/exp5.db",
        );
        summary.record_error(&PipelineError::UpstreamTimeout {
            timeout: Duration::from_secs(5),
        });
        summary.record_error(&PipelineError::Cancelled { completed_layers: 2 });

        assert_eq!(summary.total_runs, 2);
        assert_eq!(summary.errors, 2);
        assert_eq!(summary.completed_runs(), 0);
        assert_eq!(summary.attack_success_rate, 0.0);
        assert_eq!(summary.errors_by_kind.get("upstream_timeout"), Some(&1));
        assert_eq!(summary.errors_by_kind.get("cancelled"), Some(&1));
    }

    #[test]
    fn test_outcome_from_error_is_distinct() {
        let outcome = RunOutcome::from_error(&PipelineError::UpstreamTimeout {
            timeout: Duration::from_millis(10),
        });
        assert_eq!(
            outcome,
            RunOutcome::Errored {
                kind: "upstream_timeout".to_string(),
                retryable: true
            }
        );
        assert_ne!(outcome, RunOutcome::AttackSucceeded);
    }
}
