//! Execution trace domain types.
//!
//! The terminal, immutable record of one pipeline run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{
    CoordinationContext, Decision, LayerId, LayerVerdict, RequestEnvelope, TrustBoundaryViolation,
};

/// How much of one layer's state other layers may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Role-based separation: layers see sanitized input and reduced
    /// upstream verdicts only.
    Good,
    /// Shared state: layers see raw input and full upstream verdicts.
    Bad,
}

impl std::fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IsolationMode::Good => write!(f, "good"),
            IsolationMode::Bad => write!(f, "bad"),
        }
    }
}

impl std::str::FromStr for IsolationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "good" => Ok(IsolationMode::Good),
            "bad" => Ok(IsolationMode::Bad),
            _ => Err(format!("Unknown isolation mode: {}. Use good or bad", s)),
        }
    }
}

/// One entry of the propagation path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PropagationStep {
    /// 1-based position in the path.
    pub position: usize,
    pub layer: LayerId,
    pub decision: Decision,
    /// Risk contributed by this layer.
    pub risk_score: f64,
    /// Threshold the layer applied.
    pub threshold: f64,
    /// Upstream risk the layer saw in the coordination context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_risk: Option<f64>,
    pub coordination_read: bool,
    pub coordination_written: bool,
    /// Violations recorded in the context once this layer finished.
    pub violations_recorded: usize,
}

/// A layer that flagged the input but let it through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BypassMechanism {
    pub layer: LayerId,
    /// `<layer>:<signal>` name of the evading technique.
    pub technique: String,
    pub risk_score: f64,
    pub threshold: f64,
}

impl BypassMechanism {
    /// Derive a bypass entry from a flagged, non-blocking verdict.
    pub fn from_verdict(verdict: &LayerVerdict) -> Option<Self> {
        if verdict.is_block() || !verdict.flagged {
            return None;
        }
        let signal = verdict.primary_signal().unwrap_or("below_threshold");
        Some(Self {
            layer: verdict.layer,
            technique: format!("{}:{}", verdict.layer, signal),
            risk_score: verdict.risk_score,
            threshold: verdict.threshold,
        })
    }
}

impl std::fmt::Display for BypassMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.technique)
    }
}

/// Record of one complete pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ExecutionTrace {
    /// Derived from the request and run configuration.
    pub trace_id: Uuid,

    pub experiment_id: String,

    /// The originating request.
    pub request: RequestEnvelope,

    pub isolation_mode: IsolationMode,

    pub coordination_enabled: bool,

    /// Layers that were enabled for this run, in order.
    pub enabled_layers: Vec<LayerId>,

    /// Final coordination state; absent when coordination was disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordination_context: Option<CoordinationContext>,

    /// Ordered log of executed layers.
    pub propagation_path: Vec<PropagationStep>,

    /// Full verdict of every executed layer.
    pub layer_verdicts: Vec<LayerVerdict>,

    pub bypass_mechanisms: Vec<BypassMechanism>,

    pub trust_boundary_violations: Vec<TrustBoundaryViolation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_at_layer: Option<LayerId>,

    /// Protected system response; absent if it was never called.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protected_response: Option<String>,

    pub attack_successful: bool,

    pub started_at: DateTime<Utc>,

    pub completed_at: DateTime<Utc>,

    pub duration_ms: u64,
}

/// Listing entry for a stored trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TraceSummary {
    pub trace_id: Uuid,
    pub experiment_id: String,
    pub attack_label: String,
    pub isolation_mode: IsolationMode,
    pub coordination_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_at_layer: Option<LayerId>,
    pub attack_successful: bool,
    pub violations: u64,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// Everything in a trace except timing fields.
#[derive(Serialize)]
struct FingerprintView<'a> {
    trace_id: &'a Uuid,
    experiment_id: &'a str,
    request: &'a RequestEnvelope,
    isolation_mode: IsolationMode,
    coordination_enabled: bool,
    enabled_layers: &'a [LayerId],
    coordination_context: &'a Option<CoordinationContext>,
    propagation_path: &'a [PropagationStep],
    layer_verdicts: &'a [LayerVerdict],
    bypass_mechanisms: &'a [BypassMechanism],
    trust_boundary_violations: &'a [TrustBoundaryViolation],
    blocked_at_layer: Option<LayerId>,
    protected_response: &'a Option<String>,
    attack_successful: bool,
}

impl ExecutionTrace {
    /// Deterministic trace id for a request under one run configuration:
    /// a name-based (v5) UUID in the request id's namespace.
    pub fn derive_id(
        request_id: Uuid,
        experiment_id: &str,
        isolation_mode: IsolationMode,
        coordination_enabled: bool,
    ) -> Uuid {
        let name = format!(
            "{}|{}|{}",
            experiment_id, isolation_mode, coordination_enabled
        );
        Uuid::new_v5(&request_id, name.as_bytes())
    }

    /// SHA-256 hex over the trace with timing fields left out.
    ///
    /// Two runs of the same request and configuration against a
    /// deterministic protected system produce the same fingerprint.
    pub fn fingerprint(&self) -> Result<String, serde_json::Error> {
        let view = FingerprintView {
            trace_id: &self.trace_id,
            experiment_id: &self.experiment_id,
            request: &self.request,
            isolation_mode: self.isolation_mode,
            coordination_enabled: self.coordination_enabled,
            enabled_layers: &self.enabled_layers,
            coordination_context: &self.coordination_context,
            propagation_path: &self.propagation_path,
            layer_verdicts: &self.layer_verdicts,
            bypass_mechanisms: &self.bypass_mechanisms,
            trust_boundary_violations: &self.trust_boundary_violations,
            blocked_at_layer: self.blocked_at_layer,
            protected_response: &self.protected_response,
            attack_successful: self.attack_successful,
        };
        let bytes = serde_json::to_vec(&view)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Number of adaptive adjustments made during the run.
    pub fn adjustment_count(&self) -> usize {
        self.coordination_context
            .as_ref()
            .map(|c| c.adaptive_adjustments().len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_mode_parsing() {
        assert_eq!("good".parse::<IsolationMode>().unwrap(), IsolationMode::Good);
        assert_eq!(" BAD ".parse::<IsolationMode>().unwrap(), IsolationMode::Bad);
        assert!("strict".parse::<IsolationMode>().is_err());
    }

    #[test]
    fn test_derive_id_is_deterministic() {
        let request_id = Uuid::new_v4();
        let a = ExecutionTrace::derive_id(request_id, "exp5", IsolationMode::Good, true);
        let b = ExecutionTrace::derive_id(request_id, "exp5", IsolationMode::Good, true);
        let c = ExecutionTrace::derive_id(request_id, "exp5", IsolationMode::Good, false);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.get_version(), Some(uuid::Version::Sha1));
        assert_eq!(a.get_variant(), uuid::Variant::RFC4122);
    }

    #[test]
    fn test_bypass_only_for_flagged_pass() {
        let passed = LayerVerdict::from_score(
            LayerId::PatternAnalysis,
            0.4,
            0.7,
            0.3,
            vec!["bypass".to_string()],
        );
        let bypass = BypassMechanism::from_verdict(&passed).unwrap();
        assert_eq!(bypass.technique, "pattern_analysis:bypass");

        let blocked = LayerVerdict::from_score(LayerId::PatternAnalysis, 0.9, 0.7, 0.3, vec![]);
        assert!(BypassMechanism::from_verdict(&blocked).is_none());

        let clean = LayerVerdict::from_score(LayerId::PatternAnalysis, 0.1, 0.7, 0.3, vec![]);
        assert!(BypassMechanism::from_verdict(&clean).is_none());
    }
}
