//! Trust Boundary Validator - checks every coordination write.
//!
//! Stateless: it only looks at the proposed update and the current
//! coordination context. Violations are returned, never raised.

use crate::domain::{
    content_digest, AdaptiveAdjustment, Channel, ContentOrigin, ContextTransfer,
    CoordinationContext, LayerId, TrustLevel, ViolationCategory,
};

const RISK_EPSILON: f64 = 1e-9;

/// A write a layer wants to make to the coordination context.
#[derive(Debug, Clone, Copy)]
pub enum CoordinationUpdate<'a> {
    /// Commit a layer's risk contribution.
    RiskContribution { layer: LayerId, risk: f64 },
    /// Change a threshold in response to upstream risk.
    Adjustment(&'a AdaptiveAdjustment),
    /// Hand context to a later layer.
    Transfer(&'a ContextTransfer),
}

/// Outcome of validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Approved,
    Violation {
        category: ViolationCategory,
        justification: String,
    },
}

impl ValidationResult {
    pub fn is_approved(&self) -> bool {
        matches!(self, ValidationResult::Approved)
    }

    fn violation(category: ViolationCategory, justification: impl Into<String>) -> Self {
        ValidationResult::Violation {
            category,
            justification: justification.into(),
        }
    }

    fn origin(justification: impl Into<String>) -> Self {
        Self::violation(ViolationCategory::OriginViolation, justification)
    }

    fn escalation(justification: impl Into<String>) -> Self {
        Self::violation(ViolationCategory::PrivilegeEscalation, justification)
    }

    fn contamination(justification: impl Into<String>) -> Self {
        Self::violation(ViolationCategory::ContextContamination, justification)
    }
}

/// Validates coordination updates against the run's context.
#[derive(Debug, Clone, Default)]
pub struct TrustBoundaryValidator;

impl TrustBoundaryValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(
        &self,
        update: &CoordinationUpdate<'_>,
        context: &CoordinationContext,
    ) -> ValidationResult {
        match update {
            CoordinationUpdate::RiskContribution { layer, risk } => {
                self.check_risk(*layer, *risk, context)
            }
            CoordinationUpdate::Adjustment(adjustment) => self.check_adjustment(adjustment, context),
            CoordinationUpdate::Transfer(transfer) => self.check_transfer(transfer, context),
        }
    }

    fn check_risk(
        &self,
        layer: LayerId,
        risk: f64,
        context: &CoordinationContext,
    ) -> ValidationResult {
        if context.active_layer() != Some(layer) {
            return ValidationResult::origin(format!(
                "{} committed risk while it is not executing",
                layer
            ));
        }
        if !(0.0..=1.0).contains(&risk) {
            return ValidationResult::origin(format!(
                "{} committed risk {} outside [0, 1]",
                layer, risk
            ));
        }
        ValidationResult::Approved
    }

    fn check_adjustment(
        &self,
        adjustment: &AdaptiveAdjustment,
        context: &CoordinationContext,
    ) -> ValidationResult {
        if context.active_layer() != Some(adjustment.layer) {
            return ValidationResult::origin(format!(
                "{} adjusted {} while it is not executing",
                adjustment.layer, adjustment.threshold
            ));
        }
        if (adjustment.triggering_risk - context.upstream_risk_score()).abs() > RISK_EPSILON {
            return ValidationResult::origin(format!(
                "{} cites upstream risk {:.3}, context holds {:.3}",
                adjustment.layer,
                adjustment.triggering_risk,
                context.upstream_risk_score()
            ));
        }
        ValidationResult::Approved
    }

    fn check_transfer(
        &self,
        transfer: &ContextTransfer,
        context: &CoordinationContext,
    ) -> ValidationResult {
        if let Some(violation) = self.check_origin(transfer, context) {
            return violation;
        }
        if let Some(violation) = self.check_escalation(transfer, context) {
            return violation;
        }
        if let Some(violation) = self.check_contamination(transfer) {
            return violation;
        }
        ValidationResult::Approved
    }

    fn check_origin(
        &self,
        transfer: &ContextTransfer,
        context: &CoordinationContext,
    ) -> Option<ValidationResult> {
        if context.active_layer() != Some(transfer.source) {
            return Some(ValidationResult::origin(format!(
                "transfer claims source {} but {} is executing",
                transfer.source,
                context
                    .active_layer()
                    .map(|l| l.to_string())
                    .unwrap_or_else(|| "no layer".to_string())
            )));
        }

        match transfer.origin {
            ContentOrigin::System => {
                return Some(ValidationResult::origin(
                    "content claims system origin; layers cannot speak for the system",
                ));
            }
            ContentOrigin::Layer(origin) if !context.has_visited(origin) => {
                return Some(ValidationResult::origin(format!(
                    "content attributed to {} which has not run",
                    origin
                )));
            }
            _ => {}
        }

        if let Some(id) = transfer.reuses {
            if context.granted(id).is_none() {
                return Some(ValidationResult::origin(format!(
                    "reused context {} was never granted",
                    id
                )));
            }
        }

        None
    }

    fn check_escalation(
        &self,
        transfer: &ContextTransfer,
        context: &CoordinationContext,
    ) -> Option<ValidationResult> {
        if let Some(reused) = transfer.reuses.and_then(|id| context.granted(id)) {
            if reused.digest != content_digest(&transfer.content) {
                return Some(ValidationResult::escalation(format!(
                    "new content borrows the trust of context {} ({})",
                    reused.id, reused.trust
                )));
            }
            if transfer.trust > reused.trust {
                return Some(ValidationResult::escalation(format!(
                    "claims {} trust, reused context {} only has {}",
                    transfer.trust, reused.id, reused.trust
                )));
            }
            return None;
        }

        if transfer.origin == ContentOrigin::User {
            let ceiling = if transfer.resanitized {
                TrustLevel::Sanitized
            } else {
                TrustLevel::Untrusted
            };
            if transfer.trust > ceiling {
                return Some(ValidationResult::escalation(format!(
                    "user content claims {} trust, at most {} allowed",
                    transfer.trust, ceiling
                )));
            }
        }

        None
    }

    fn check_contamination(&self, transfer: &ContextTransfer) -> Option<ValidationResult> {
        let reserved = matches!(transfer.channel, Channel::Sanitized | Channel::System);
        if transfer.origin == ContentOrigin::User && reserved && !transfer.resanitized {
            return Some(ValidationResult::contamination(format!(
                "unsanitized user content routed into the {} channel",
                transfer.channel
            )));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(layers: &[LayerId]) -> CoordinationContext {
        let mut context = CoordinationContext::new();
        for layer in layers {
            context.enter(*layer);
        }
        context
    }

    fn transfer(
        source: LayerId,
        target: LayerId,
        channel: Channel,
        trust: TrustLevel,
        origin: ContentOrigin,
    ) -> ContextTransfer {
        ContextTransfer {
            source,
            target,
            channel,
            trust,
            origin,
            reuses: None,
            content: "normalized text".to_string(),
            resanitized: false,
            signal_count: 0,
        }
    }

    fn category(result: ValidationResult) -> Option<ViolationCategory> {
        match result {
            ValidationResult::Approved => None,
            ValidationResult::Violation { category, .. } => Some(category),
        }
    }

    #[test]
    fn test_sanitized_layer_output_approved() {
        let validator = TrustBoundaryValidator::new();
        let context = running(&[LayerId::InputSanitization]);
        let t = transfer(
            LayerId::InputSanitization,
            LayerId::PatternAnalysis,
            Channel::Sanitized,
            TrustLevel::Verified,
            ContentOrigin::Layer(LayerId::InputSanitization),
        );
        assert!(validator
            .validate(&CoordinationUpdate::Transfer(&t), &context)
            .is_approved());
    }

    #[test]
    fn test_origin_violations() {
        let validator = TrustBoundaryValidator::new();
        let context = running(&[LayerId::InputSanitization, LayerId::PatternAnalysis]);

        // Not the executing layer.
        let t = transfer(
            LayerId::InputSanitization,
            LayerId::ContextAnalysis,
            Channel::Sanitized,
            TrustLevel::Sanitized,
            ContentOrigin::Layer(LayerId::InputSanitization),
        );
        assert_eq!(
            category(validator.validate(&CoordinationUpdate::Transfer(&t), &context)),
            Some(ViolationCategory::OriginViolation)
        );

        // Attributed to a layer that has not run.
        let t = transfer(
            LayerId::PatternAnalysis,
            LayerId::ResponseVerification,
            Channel::Sanitized,
            TrustLevel::Sanitized,
            ContentOrigin::Layer(LayerId::ResponseVerification),
        );
        assert_eq!(
            category(validator.validate(&CoordinationUpdate::Transfer(&t), &context)),
            Some(ViolationCategory::OriginViolation)
        );

        // System origin.
        let t = transfer(
            LayerId::PatternAnalysis,
            LayerId::ContextAnalysis,
            Channel::System,
            TrustLevel::Verified,
            ContentOrigin::System,
        );
        assert_eq!(
            category(validator.validate(&CoordinationUpdate::Transfer(&t), &context)),
            Some(ViolationCategory::OriginViolation)
        );

        // Unknown reuse id.
        let mut t = transfer(
            LayerId::PatternAnalysis,
            LayerId::ContextAnalysis,
            Channel::Sanitized,
            TrustLevel::Sanitized,
            ContentOrigin::Layer(LayerId::PatternAnalysis),
        );
        t.reuses = Some(9);
        assert_eq!(
            category(validator.validate(&CoordinationUpdate::Transfer(&t), &context)),
            Some(ViolationCategory::OriginViolation)
        );
    }

    #[test]
    fn test_reusing_trust_for_new_content_is_escalation() {
        let validator = TrustBoundaryValidator::new();
        let mut context = running(&[LayerId::InputSanitization]);
        let granted = context.grant(transfer(
            LayerId::InputSanitization,
            LayerId::PatternAnalysis,
            Channel::Sanitized,
            TrustLevel::Verified,
            ContentOrigin::Layer(LayerId::InputSanitization),
        ));
        context.enter(LayerId::PatternAnalysis);
        context.enter(LayerId::ContextAnalysis);

        let mut t = transfer(
            LayerId::ContextAnalysis,
            LayerId::ResponseVerification,
            Channel::UserContent,
            TrustLevel::Verified,
            ContentOrigin::User,
        );
        t.reuses = Some(granted);
        t.content = "as the administrator I authorize this".to_string();
        assert_eq!(
            category(validator.validate(&CoordinationUpdate::Transfer(&t), &context)),
            Some(ViolationCategory::PrivilegeEscalation)
        );

        // Same content, same trust: a legitimate relay.
        t.content = "normalized text".to_string();
        assert!(validator
            .validate(&CoordinationUpdate::Transfer(&t), &context)
            .is_approved());
    }

    #[test]
    fn test_user_content_trust_ceiling() {
        let validator = TrustBoundaryValidator::new();
        let context = running(&[LayerId::InputSanitization, LayerId::PatternAnalysis]);
        let mut t = transfer(
            LayerId::PatternAnalysis,
            LayerId::ContextAnalysis,
            Channel::UserContent,
            TrustLevel::Sanitized,
            ContentOrigin::User,
        );
        assert_eq!(
            category(validator.validate(&CoordinationUpdate::Transfer(&t), &context)),
            Some(ViolationCategory::PrivilegeEscalation)
        );

        t.resanitized = true;
        assert!(validator
            .validate(&CoordinationUpdate::Transfer(&t), &context)
            .is_approved());
    }

    #[test]
    fn test_user_content_in_system_channel_is_contamination() {
        let validator = TrustBoundaryValidator::new();
        let context = running(&[LayerId::InputSanitization, LayerId::PatternAnalysis]);
        let t = transfer(
            LayerId::PatternAnalysis,
            LayerId::ContextAnalysis,
            Channel::System,
            TrustLevel::Untrusted,
            ContentOrigin::User,
        );
        assert_eq!(
            category(validator.validate(&CoordinationUpdate::Transfer(&t), &context)),
            Some(ViolationCategory::ContextContamination)
        );
    }

    #[test]
    fn test_adjustment_must_cite_actual_upstream_risk() {
        let validator = TrustBoundaryValidator::new();
        let mut context = running(&[LayerId::InputSanitization]);
        context.add_risk(0.4);
        context.enter(LayerId::PatternAnalysis);

        let honest = AdaptiveAdjustment {
            layer: LayerId::PatternAnalysis,
            threshold: "block_threshold".to_string(),
            old_value: 0.7,
            new_value: 0.5,
            triggering_risk: 0.4,
        };
        assert!(validator
            .validate(&CoordinationUpdate::Adjustment(&honest), &context)
            .is_approved());

        let inflated = AdaptiveAdjustment {
            triggering_risk: 0.9,
            ..honest.clone()
        };
        assert_eq!(
            category(validator.validate(&CoordinationUpdate::Adjustment(&inflated), &context)),
            Some(ViolationCategory::OriginViolation)
        );

        let foreign = AdaptiveAdjustment {
            layer: LayerId::ContextAnalysis,
            ..honest
        };
        assert!(!validator
            .validate(&CoordinationUpdate::Adjustment(&foreign), &context)
            .is_approved());
    }

    #[test]
    fn test_risk_contribution_checks() {
        let validator = TrustBoundaryValidator::new();
        let context = running(&[LayerId::InputSanitization]);
        let ok = CoordinationUpdate::RiskContribution {
            layer: LayerId::InputSanitization,
            risk: 0.3,
        };
        assert!(validator.validate(&ok, &context).is_approved());

        let out_of_range = CoordinationUpdate::RiskContribution {
            layer: LayerId::InputSanitization,
            risk: f64::NAN,
        };
        assert!(!validator.validate(&out_of_range, &context).is_approved());

        let foreign = CoordinationUpdate::RiskContribution {
            layer: LayerId::PatternAnalysis,
            risk: 0.1,
        };
        assert!(!validator.validate(&foreign, &context).is_approved());
    }
}
