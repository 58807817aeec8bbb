//! Coordination domain types.
//!
//! The per-run state layers share when coordination is enabled, plus the
//! records of context transfers and trust-boundary violations.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

use super::LayerId;

/// SHA-256 hex digest of transferred content.
pub fn content_digest(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Trust level attached to a piece of context. Ordered from least to most
/// trusted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Raw user-originated content.
    Untrusted,
    /// Content that went through normalization.
    Sanitized,
    /// Content a layer vouches for.
    Verified,
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrustLevel::Untrusted => write!(f, "untrusted"),
            TrustLevel::Sanitized => write!(f, "sanitized"),
            TrustLevel::Verified => write!(f, "verified"),
        }
    }
}

/// Channel a transfer is delivered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Carries user-originated content as-is.
    UserContent,
    /// Reserved for normalized content.
    Sanitized,
    /// Reserved for system-originated content.
    System,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::UserContent => write!(f, "user_content"),
            Channel::Sanitized => write!(f, "sanitized"),
            Channel::System => write!(f, "system"),
        }
    }
}

/// Where transferred content claims to come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ContentOrigin {
    /// The end user.
    User,
    /// The serving system itself.
    System,
    /// A defense layer.
    Layer(LayerId),
}

impl std::fmt::Display for ContentOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentOrigin::User => write!(f, "user"),
            ContentOrigin::System => write!(f, "system"),
            ContentOrigin::Layer(layer) => write!(f, "layer:{}", layer),
        }
    }
}

/// A proposed hand-off of context from one layer to a later one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ContextTransfer {
    pub source: LayerId,
    pub target: LayerId,
    pub channel: Channel,
    /// Trust level the transfer asks the target to assume.
    pub trust: TrustLevel,
    pub origin: ContentOrigin,
    /// Earlier granted context whose trust this transfer relies on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reuses: Option<u32>,
    pub content: String,
    /// Whether user-originated content was normalized again before transfer.
    #[serde(default)]
    pub resanitized: bool,
    /// Number of detection signals the content summarizes.
    #[serde(default)]
    pub signal_count: usize,
}

/// A transfer the validator approved and the context committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct GrantedContext {
    /// 1-based id, unique within one run.
    pub id: u32,
    pub source: LayerId,
    pub target: LayerId,
    pub channel: Channel,
    pub trust: TrustLevel,
    pub origin: ContentOrigin,
    pub content: String,
    /// SHA-256 of `content`.
    pub digest: String,
    #[serde(default)]
    pub signal_count: usize,
}

/// Threshold change a layer made in response to upstream risk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AdaptiveAdjustment {
    pub layer: LayerId,
    /// Name of the threshold that changed.
    pub threshold: String,
    pub old_value: f64,
    pub new_value: f64,
    /// Upstream risk that triggered the change.
    pub triggering_risk: f64,
}

/// Category of a rejected transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCategory {
    /// Content tried to borrow trust it never earned.
    PrivilegeEscalation,
    /// Untrusted content routed into a reserved channel.
    ContextContamination,
    /// Claimed origin does not match the propagation path.
    OriginViolation,
}

impl std::fmt::Display for ViolationCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationCategory::PrivilegeEscalation => write!(f, "privilege_escalation"),
            ViolationCategory::ContextContamination => write!(f, "context_contamination"),
            ViolationCategory::OriginViolation => write!(f, "origin_violation"),
        }
    }
}

/// Record of one rejected transfer. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TrustBoundaryViolation {
    pub category: ViolationCategory,
    pub source_layer: LayerId,
    pub target_layer: LayerId,
    pub justification: String,
}

/// Shared state for one coordinated pipeline run.
///
/// Only the pipeline mutates it, and only after the trust boundary
/// validator approved the update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CoordinationContext {
    upstream_risk_score: f64,
    adaptive_adjustments: Vec<AdaptiveAdjustment>,
    granted_contexts: Vec<GrantedContext>,
    trust_boundary_violations: Vec<TrustBoundaryViolation>,
    visited_layers: Vec<LayerId>,
}

impl CoordinationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of risk committed by the layers executed so far.
    pub fn upstream_risk_score(&self) -> f64 {
        self.upstream_risk_score
    }

    pub fn adaptive_adjustments(&self) -> &[AdaptiveAdjustment] {
        &self.adaptive_adjustments
    }

    pub fn granted_contexts(&self) -> &[GrantedContext] {
        &self.granted_contexts
    }

    pub fn trust_boundary_violations(&self) -> &[TrustBoundaryViolation] {
        &self.trust_boundary_violations
    }

    /// The layer currently executing.
    pub fn active_layer(&self) -> Option<LayerId> {
        self.visited_layers.last().copied()
    }

    pub fn has_visited(&self, layer: LayerId) -> bool {
        self.visited_layers.contains(&layer)
    }

    pub fn granted(&self, id: u32) -> Option<&GrantedContext> {
        self.granted_contexts.iter().find(|c| c.id == id)
    }

    /// Granted contexts addressed to `target`, in grant order.
    pub fn contexts_for(&self, target: LayerId) -> impl Iterator<Item = &GrantedContext> {
        self.granted_contexts
            .iter()
            .filter(move |c| c.target == target)
    }

    /// Highest-trust granted context; the earliest one wins ties.
    pub fn most_trusted(&self) -> Option<&GrantedContext> {
        self.granted_contexts
            .iter()
            .max_by(|a, b| a.trust.cmp(&b.trust).then(b.id.cmp(&a.id)))
    }

    pub(crate) fn enter(&mut self, layer: LayerId) {
        self.visited_layers.push(layer);
    }

    /// Upstream risk never decreases; negative contributions are ignored.
    pub(crate) fn add_risk(&mut self, risk: f64) {
        if risk > 0.0 {
            self.upstream_risk_score += risk;
        }
    }

    pub(crate) fn record_adjustment(&mut self, adjustment: AdaptiveAdjustment) {
        self.adaptive_adjustments.push(adjustment);
    }

    pub(crate) fn record_violation(&mut self, violation: TrustBoundaryViolation) {
        self.trust_boundary_violations.push(violation);
    }

    /// Commit an approved transfer and return its id.
    pub(crate) fn grant(&mut self, transfer: ContextTransfer) -> u32 {
        let id = self.granted_contexts.len() as u32 + 1;
        let digest = content_digest(&transfer.content);
        self.granted_contexts.push(GrantedContext {
            id,
            source: transfer.source,
            target: transfer.target,
            channel: transfer.channel,
            trust: transfer.trust,
            origin: transfer.origin,
            content: transfer.content,
            digest,
            signal_count: transfer.signal_count,
        });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(trust: TrustLevel, content: &str) -> ContextTransfer {
        ContextTransfer {
            source: LayerId::InputSanitization,
            target: LayerId::PatternAnalysis,
            channel: Channel::Sanitized,
            trust,
            origin: ContentOrigin::Layer(LayerId::InputSanitization),
            reuses: None,
            content: content.to_string(),
            resanitized: false,
            signal_count: 0,
        }
    }

    #[test]
    fn test_upstream_risk_never_decreases() {
        let mut context = CoordinationContext::new();
        context.add_risk(0.4);
        context.add_risk(-0.2);
        context.add_risk(0.1);
        assert!((context.upstream_risk_score() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_grant_assigns_ids_and_digests() {
        let mut context = CoordinationContext::new();
        let first = context.grant(transfer(TrustLevel::Sanitized, "a"));
        let second = context.grant(transfer(TrustLevel::Verified, "b"));

        assert_eq!((first, second), (1, 2));
        assert_eq!(context.granted(2).unwrap().digest, content_digest("b"));
        assert_eq!(context.most_trusted().unwrap().id, 2);
        assert_eq!(context.contexts_for(LayerId::PatternAnalysis).count(), 2);
        assert_eq!(context.contexts_for(LayerId::ContextAnalysis).count(), 0);
    }

    #[test]
    fn test_most_trusted_prefers_earliest_on_tie() {
        let mut context = CoordinationContext::new();
        context.grant(transfer(TrustLevel::Verified, "a"));
        context.grant(transfer(TrustLevel::Verified, "b"));
        assert_eq!(context.most_trusted().unwrap().id, 1);
    }

    #[test]
    fn test_violation_category_serialization() {
        let json = serde_json::to_string(&ViolationCategory::ContextContamination).unwrap();
        assert_eq!(json, "\"context_contamination\"");
        // Stored violation rows use the Display form.
        assert_eq!(ViolationCategory::OriginViolation.to_string(), "origin_violation");
    }

    #[test]
    fn test_origin_serialization() {
        let json = serde_json::to_value(ContentOrigin::Layer(LayerId::ContextAnalysis)).unwrap();
        assert_eq!(json, serde_json::json!({"layer": "context_analysis"}));
        let json = serde_json::to_value(ContentOrigin::User).unwrap();
        assert_eq!(json, serde_json::json!("user"));
    }
}
