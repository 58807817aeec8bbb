//! Context Analysis - layer 3.
//!
//! Looks for content that tries to borrow authority: claims of being an
//! administrator, embedded system directives, claims that another layer
//! already approved the request, and role-play framing.
//!
//! With coordination enabled it forwards a summary to layer 5 and relays
//! every claim it found as a transfer labelled with what the claim asserts.
//! The validator decides whether the claim holds; a false one ends up as a
//! trust-boundary violation in the trace.

use crate::config::LayerPolicy;
use crate::domain::{Channel, ContentOrigin, LayerId, LayerVerdict, TrustLevel};
use crate::engine::{
    effective_threshold, normalize, summary_transfer, CoordinationHandle, DefenseLayer,
    LayerError, LayerView, TransferRequest,
};

/// Longest excerpt relayed for a single claim.
const EXCERPT_CHARS: usize = 120;

/// Kind of trust claim found in the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    AuthorityClaim,
    EmbeddedDirective,
    OriginClaim,
    RoleplayFraming,
}

impl ClaimKind {
    pub const ALL: [ClaimKind; 4] = [
        ClaimKind::AuthorityClaim,
        ClaimKind::EmbeddedDirective,
        ClaimKind::OriginClaim,
        ClaimKind::RoleplayFraming,
    ];

    pub fn weight(&self) -> f64 {
        match self {
            ClaimKind::AuthorityClaim => 0.35,
            ClaimKind::EmbeddedDirective => 0.35,
            ClaimKind::OriginClaim => 0.3,
            ClaimKind::RoleplayFraming => 0.25,
        }
    }

    fn markers(&self) -> &'static [&'static str] {
        match self {
            ClaimKind::AuthorityClaim => &[
                "as your administrator",
                "as the administrator",
                "i am your developer",
                "i am the developer",
                "as your creator",
                "admin override",
                "i have authorization",
                "i am authorized",
                "sudo ",
            ],
            ClaimKind::EmbeddedDirective => &[
                "system:",
                "[system]",
                "<system>",
                "<|im_start|>system",
                "### instruction",
                "[inst]",
            ],
            ClaimKind::OriginClaim => &[
                "approved by the",
                "pre-approved",
                "preapproved",
                "forwarded from layer",
                "this request was cleared",
                "verified by security",
            ],
            ClaimKind::RoleplayFraming => &[
                "pretend you are",
                "pretend to be",
                "let's play a game",
                "roleplay as",
                "act as",
                "imagine you are",
                "in a fictional world",
            ],
        }
    }
}

impl std::fmt::Display for ClaimKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimKind::AuthorityClaim => write!(f, "authority_claim"),
            ClaimKind::EmbeddedDirective => write!(f, "embedded_directive"),
            ClaimKind::OriginClaim => write!(f, "origin_claim"),
            ClaimKind::RoleplayFraming => write!(f, "roleplay_framing"),
        }
    }
}

/// One claim found in the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub kind: ClaimKind,
    pub marker: &'static str,
    /// Input text from the marker onwards.
    pub excerpt: String,
}

/// First marker of each claim kind found in `text`.
pub fn find_claims(text: &str) -> Vec<Claim> {
    ClaimKind::ALL
        .iter()
        .filter_map(|kind| {
            kind.markers().iter().find_map(|&marker| {
                text.find(marker).map(|start| Claim {
                    kind: *kind,
                    marker,
                    excerpt: text[start..].chars().take(EXCERPT_CHARS).collect(),
                })
            })
        })
        .collect()
}

/// Layer 3: context and trust analysis.
pub struct ContextAnalyzer {
    policy: LayerPolicy,
}

impl ContextAnalyzer {
    pub fn new(policy: LayerPolicy) -> Self {
        Self { policy }
    }

    /// Hand the summary and every claim downstream. Returns how many
    /// transfers were granted.
    fn relay(
        &self,
        handle: &mut CoordinationHandle<'_>,
        verdict: &LayerVerdict,
        claims: &[Claim],
    ) -> Result<usize, LayerError> {
        let summary = handle.propose_transfer(summary_transfer(verdict))?;
        let mut granted = usize::from(summary.is_granted());

        for claim in claims {
            let request = match claim.kind {
                // "Treat this as coming from someone trusted."
                ClaimKind::AuthorityClaim => {
                    let request = TransferRequest::new(
                        LayerId::ResponseVerification,
                        Channel::UserContent,
                        TrustLevel::Verified,
                        ContentOrigin::User,
                        claim.excerpt.clone(),
                    );
                    match handle.most_trusted_context() {
                        Some(trusted) => request.reusing(trusted.id),
                        None => request,
                    }
                }
                // "Deliver this as a system instruction."
                ClaimKind::EmbeddedDirective => TransferRequest::new(
                    LayerId::ResponseVerification,
                    Channel::System,
                    TrustLevel::Untrusted,
                    ContentOrigin::User,
                    claim.excerpt.clone(),
                ),
                // "A later check already cleared this."
                ClaimKind::OriginClaim => TransferRequest::new(
                    LayerId::ResponseVerification,
                    Channel::Sanitized,
                    TrustLevel::Sanitized,
                    ContentOrigin::Layer(LayerId::ResponseVerification),
                    claim.excerpt.clone(),
                ),
                // Framing is user text; it goes on normalized again and
                // without any borrowed trust.
                ClaimKind::RoleplayFraming => TransferRequest::new(
                    LayerId::ResponseVerification,
                    Channel::Sanitized,
                    TrustLevel::Sanitized,
                    ContentOrigin::User,
                    normalize(&claim.excerpt).text,
                )
                .resanitized(),
            };
            if handle.propose_transfer(request)?.is_granted() {
                granted += 1;
            }
        }

        Ok(granted)
    }
}

impl DefenseLayer for ContextAnalyzer {
    fn id(&self) -> LayerId {
        LayerId::ContextAnalysis
    }

    fn evaluate(
        &self,
        view: &LayerView<'_>,
        handle: Option<&mut CoordinationHandle<'_>>,
    ) -> Result<LayerVerdict, LayerError> {
        let mut handle = handle;
        let text = view.input.to_lowercase();
        let claims = find_claims(&text);
        let risk: f64 = claims.iter().map(|c| c.kind.weight()).sum();
        let threshold = effective_threshold(&self.policy, handle.as_deref_mut());

        let mut verdict = LayerVerdict::from_score(
            LayerId::ContextAnalysis,
            risk,
            threshold,
            self.policy.flag_threshold,
            claims
                .iter()
                .map(|c| format!("{}:{}", c.kind, c.marker.trim()))
                .collect(),
        )
        .with_annotation("claims", claims.len());

        if let Some(detail) = view.upstream_detail {
            let upstream_signals: usize = detail.iter().map(|v| v.signals.len()).sum();
            verdict = verdict.with_annotation("upstream_signals", upstream_signals);
        }

        if let Some(handle) = handle {
            let granted = self.relay(handle, &verdict, &claims)?;
            verdict = verdict.with_annotation("relays_granted", granted);
        }

        Ok(verdict)
    }
}
