//! Layer contract shared by the five defense layers.
//!
//! A layer sees a scoped [`LayerView`] and, when coordination is enabled, a
//! [`CoordinationHandle`]. The handle is the only way to touch the shared
//! coordination context, and every write it makes is checked by the
//! [`TrustBoundaryValidator`] first.

use thiserror::Error;

use crate::config::{LayerPolicy, PipelineConfig};
use crate::domain::{
    AdaptiveAdjustment, Channel, ContentOrigin, ContextTransfer, CoordinationContext,
    GrantedContext, IsolationMode, LayerId, LayerVerdict, TrustBoundaryViolation, TrustLevel,
    UpstreamVerdict, ViolationCategory,
};
use crate::engine::{
    ContextAnalyzer, CoordinationUpdate, InputSanitizer, OutputVerifier, PatternAnalyzer,
    ResponseVerifier, TrustBoundaryValidator, ValidationResult,
};

/// Failure inside a single layer. The pipeline wraps it with the layer id.
#[derive(Debug, Error)]
pub enum LayerError {
    #[error("no protected-system response in view")]
    MissingResponse,

    #[error("transfer from {from} to {to} does not point downstream")]
    InvalidTransferTarget { from: LayerId, to: LayerId },

    #[error("{0}")]
    Evaluation(String),
}

/// What a layer is allowed to see of the current run.
#[derive(Debug, Clone, Copy)]
pub struct LayerView<'a> {
    pub layer: LayerId,
    pub isolation: IsolationMode,
    /// Raw input for layer 1 and under `bad` isolation, sanitized otherwise.
    pub input: &'a str,
    /// Reduced verdicts of every upstream layer.
    pub upstream: &'a [UpstreamVerdict],
    /// Full upstream verdicts; only present under `bad` isolation.
    pub upstream_detail: Option<&'a [LayerVerdict]>,
    /// Protected-system response; only present for output-stage layers.
    pub response: Option<&'a str>,
}

impl<'a> LayerView<'a> {
    pub fn require_response(&self) -> Result<&'a str, LayerError> {
        self.response.ok_or(LayerError::MissingResponse)
    }
}

/// A context hand-off as a layer proposes it. The handle fills in the
/// source layer.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub target: LayerId,
    pub channel: Channel,
    pub trust: TrustLevel,
    pub origin: ContentOrigin,
    pub reuses: Option<u32>,
    pub content: String,
    pub resanitized: bool,
    pub signal_count: usize,
}

impl TransferRequest {
    pub fn new(
        target: LayerId,
        channel: Channel,
        trust: TrustLevel,
        origin: ContentOrigin,
        content: impl Into<String>,
    ) -> Self {
        Self {
            target,
            channel,
            trust,
            origin,
            reuses: None,
            content: content.into(),
            resanitized: false,
            signal_count: 0,
        }
    }

    /// Rely on the trust of an earlier granted context.
    pub fn reusing(mut self, id: u32) -> Self {
        self.reuses = Some(id);
        self
    }

    /// Mark user content as normalized again before the hand-off.
    pub fn resanitized(mut self) -> Self {
        self.resanitized = true;
        self
    }

    pub fn summarizing(mut self, signal_count: usize) -> Self {
        self.signal_count = signal_count;
        self
    }
}

/// Result of a proposed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Granted(u32),
    Rejected(ViolationCategory),
}

impl TransferOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, TransferOutcome::Granted(_))
    }
}

/// Exclusive, validated access to the coordination context for one layer.
pub struct CoordinationHandle<'a> {
    context: &'a mut CoordinationContext,
    validator: &'a TrustBoundaryValidator,
    layer: LayerId,
    read: bool,
    written: bool,
}

impl<'a> CoordinationHandle<'a> {
    pub(crate) fn new(
        context: &'a mut CoordinationContext,
        validator: &'a TrustBoundaryValidator,
        layer: LayerId,
    ) -> Self {
        Self {
            context,
            validator,
            layer,
            read: false,
            written: false,
        }
    }

    pub fn upstream_risk(&mut self) -> f64 {
        self.read = true;
        self.context.upstream_risk_score()
    }

    /// Granted contexts addressed to this layer.
    pub fn received_contexts(&mut self) -> Vec<GrantedContext> {
        self.read = true;
        self.context.contexts_for(self.layer).cloned().collect()
    }

    pub fn most_trusted_context(&mut self) -> Option<GrantedContext> {
        self.read = true;
        self.context.most_trusted().cloned()
    }

    /// Ask to change one of this layer's thresholds.
    ///
    /// Returns `true` once the change is approved and logged; the layer must
    /// keep its configured value otherwise.
    ///
    /// A rejected adjustment is logged and dropped. Unlike a rejected
    /// transfer it is not added to the trust-boundary violations, which only
    /// describe content crossing from one layer to another.
    pub fn propose_adjustment(
        &mut self,
        threshold: &str,
        old_value: f64,
        new_value: f64,
        triggering_risk: f64,
    ) -> bool {
        let adjustment = AdaptiveAdjustment {
            layer: self.layer,
            threshold: threshold.to_string(),
            old_value,
            new_value,
            triggering_risk,
        };

        let result = self
            .validator
            .validate(&CoordinationUpdate::Adjustment(&adjustment), self.context);
        match result {
            ValidationResult::Approved => {
                tracing::debug!(
                    layer = %self.layer,
                    threshold,
                    old_value,
                    new_value,
                    triggering_risk,
                    "Adaptive adjustment applied"
                );
                self.context.record_adjustment(adjustment);
                self.written = true;
                true
            }
            ValidationResult::Violation {
                category,
                justification,
            } => {
                tracing::warn!(
                    layer = %self.layer,
                    category = %category,
                    reason = %justification,
                    "Adaptive adjustment rejected"
                );
                false
            }
        }
    }

    /// Offer context to a later layer.
    ///
    /// A rejected transfer is recorded as a trust-boundary violation and
    /// never reaches the target.
    pub fn propose_transfer(
        &mut self,
        request: TransferRequest,
    ) -> Result<TransferOutcome, LayerError> {
        if request.target <= self.layer {
            return Err(LayerError::InvalidTransferTarget {
                from: self.layer,
                to: request.target,
            });
        }

        let transfer = ContextTransfer {
            source: self.layer,
            target: request.target,
            channel: request.channel,
            trust: request.trust,
            origin: request.origin,
            reuses: request.reuses,
            content: request.content,
            resanitized: request.resanitized,
            signal_count: request.signal_count,
        };

        let result = self
            .validator
            .validate(&CoordinationUpdate::Transfer(&transfer), self.context);
        match result {
            ValidationResult::Approved => {
                let target = transfer.target;
                let id = self.context.grant(transfer);
                self.written = true;
                tracing::debug!(
                    source = %self.layer,
                    target = %target,
                    context_id = id,
                    "Context transfer granted"
                );
                Ok(TransferOutcome::Granted(id))
            }
            ValidationResult::Violation {
                category,
                justification,
            } => {
                tracing::warn!(
                    source = %self.layer,
                    target = %transfer.target,
                    category = %category,
                    reason = %justification,
                    "Trust boundary violation"
                );
                self.context.record_violation(TrustBoundaryViolation {
                    category,
                    source_layer: self.layer,
                    target_layer: transfer.target,
                    justification,
                });
                Ok(TransferOutcome::Rejected(category))
            }
        }
    }

    pub(crate) fn was_read(&self) -> bool {
        self.read
    }

    pub(crate) fn was_written(&self) -> bool {
        self.written
    }
}

/// Contract every defense layer implements.
pub trait DefenseLayer: Send + Sync {
    fn id(&self) -> LayerId;

    /// Evaluate the view. `handle` is `None` when coordination is off.
    fn evaluate(
        &self,
        view: &LayerView<'_>,
        handle: Option<&mut CoordinationHandle<'_>>,
    ) -> Result<LayerVerdict, LayerError>;
}

/// Blocking threshold a layer applies for this run.
///
/// Adapts only with a handle, once upstream risk reached the policy's
/// ceiling and the adjustment was approved.
pub(crate) fn effective_threshold(
    policy: &LayerPolicy,
    handle: Option<&mut CoordinationHandle<'_>>,
) -> f64 {
    let Some(handle) = handle else {
        return policy.block_threshold;
    };
    if !policy.is_adaptive() {
        return policy.block_threshold;
    }

    let upstream = handle.upstream_risk();
    if upstream < policy.adaptive_ceiling {
        return policy.block_threshold;
    }

    if handle.propose_adjustment(
        "block_threshold",
        policy.block_threshold,
        policy.adaptive_threshold,
        upstream,
    ) {
        policy.adaptive_threshold
    } else {
        policy.block_threshold
    }
}

/// Human-readable summary of a verdict.
pub(crate) fn context_summary(verdict: &LayerVerdict) -> String {
    format!(
        "{} risk={:.2} signals=[{}]",
        verdict.layer,
        verdict.risk_score,
        verdict.signals.join(",")
    )
}

/// Transfer carrying a layer's summary to response verification. The signal
/// count travels alongside the text so layer 5 never parses it back.
pub(crate) fn summary_transfer(verdict: &LayerVerdict) -> TransferRequest {
    TransferRequest::new(
        LayerId::ResponseVerification,
        Channel::Sanitized,
        TrustLevel::Sanitized,
        ContentOrigin::Layer(verdict.layer),
        context_summary(verdict),
    )
    .summarizing(verdict.signals.len())
}

/// The closed set of defense layers.
pub enum Layer {
    InputSanitization(InputSanitizer),
    PatternAnalysis(PatternAnalyzer),
    ContextAnalysis(ContextAnalyzer),
    OutputVerification(OutputVerifier),
    ResponseVerification(ResponseVerifier),
}

impl Layer {
    /// Build the layer for `id` from pipeline configuration.
    pub fn build(id: LayerId, config: &PipelineConfig) -> Self {
        let policy = config.policies.get(id);
        match id {
            LayerId::InputSanitization => Layer::InputSanitization(InputSanitizer::new(policy)),
            LayerId::PatternAnalysis => Layer::PatternAnalysis(PatternAnalyzer::new(
                policy,
                config.suspicious_keywords.clone(),
            )),
            LayerId::ContextAnalysis => Layer::ContextAnalysis(ContextAnalyzer::new(policy)),
            LayerId::OutputVerification => Layer::OutputVerification(OutputVerifier::new(
                policy,
                config.max_response_chars,
            )),
            LayerId::ResponseVerification => {
                Layer::ResponseVerification(ResponseVerifier::new(policy))
            }
        }
    }

    fn inner(&self) -> &dyn DefenseLayer {
        match self {
            Layer::InputSanitization(layer) => layer,
            Layer::PatternAnalysis(layer) => layer,
            Layer::ContextAnalysis(layer) => layer,
            Layer::OutputVerification(layer) => layer,
            Layer::ResponseVerification(layer) => layer,
        }
    }
}

impl DefenseLayer for Layer {
    fn id(&self) -> LayerId {
        self.inner().id()
    }

    fn evaluate(
        &self,
        view: &LayerView<'_>,
        handle: Option<&mut CoordinationHandle<'_>>,
    ) -> Result<LayerVerdict, LayerError> {
        self.inner().evaluate(view, handle)
    }
}
