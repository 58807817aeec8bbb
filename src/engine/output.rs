//! Output Verification - layer 4.
//!
//! Applies deterministic rules to the protected system's response: did it
//! leak its instructions, break character, emit something executable, or
//! come back in an unexpected shape.

use crate::config::LayerPolicy;
use crate::domain::{LayerId, LayerVerdict};
use crate::engine::{
    effective_threshold, summary_transfer, CoordinationHandle, DefenseLayer, LayerError, LayerView,
};

/// A rule that matched the response.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggeredRule {
    /// Unique identifier for the rule.
    pub rule_id: &'static str,
    /// Human-readable description.
    pub description: String,
    /// Risk this rule contributes.
    pub weight: f64,
}

const SYSTEM_PROMPT_MARKERS: &[&str] = &[
    "my system prompt",
    "system prompt:",
    "my instructions are",
    "here are my instructions",
    "<<sys>>",
    "you are a helpful assistant. never",
];

const ROLE_BREAK_MARKERS: &[&str] = &[
    "i am dan",
    "as dan",
    "developer mode enabled",
    "i am no longer bound",
    "i have no restrictions",
    "jailbroken",
];

const EXECUTABLE_MARKERS: &[&str] = &[
    "<script",
    "rm -rf",
    "```bash",
    "```sh",
    "eval(",
    "powershell -",
    "| sh",
];

/// Layer 4: output verification.
pub struct OutputVerifier {
    policy: LayerPolicy,
    max_response_chars: usize,
}

impl OutputVerifier {
    pub fn new(policy: LayerPolicy, max_response_chars: usize) -> Self {
        Self {
            policy,
            max_response_chars,
        }
    }

    /// Run every rule against the response.
    pub fn check_rules(&self, response: &str) -> Vec<TriggeredRule> {
        let mut rules = Vec::new();
        let lower = response.to_lowercase();

        if response.trim().is_empty() {
            rules.push(TriggeredRule {
                rule_id: "EMPTY_RESPONSE",
                description: "Protected system returned an empty response".to_string(),
                weight: 0.2,
            });
            return rules;
        }

        if let Some(marker) = first_match(&lower, SYSTEM_PROMPT_MARKERS) {
            rules.push(TriggeredRule {
                rule_id: "SYSTEM_PROMPT_LEAK",
                description: format!("Response discloses instructions ('{}')", marker),
                weight: 0.6,
            });
        }

        if let Some(marker) = first_match(&lower, ROLE_BREAK_MARKERS) {
            rules.push(TriggeredRule {
                rule_id: "ROLE_BREAK",
                description: format!("Response abandons its role ('{}')", marker),
                weight: 0.5,
            });
        }

        if let Some(marker) = first_match(&lower, EXECUTABLE_MARKERS) {
            rules.push(TriggeredRule {
                rule_id: "EXECUTABLE_PAYLOAD",
                description: format!("Response carries executable content ('{}')", marker),
                weight: 0.4,
            });
        }

        let chars = response.chars().count();
        if chars > self.max_response_chars {
            rules.push(TriggeredRule {
                rule_id: "OVERSIZED_RESPONSE",
                description: format!(
                    "Response has {} characters, limit is {}",
                    chars, self.max_response_chars
                ),
                weight: 0.3,
            });
        }

        rules
    }
}

fn first_match(text: &str, markers: &[&'static str]) -> Option<&'static str> {
    markers.iter().copied().find(|marker| text.contains(marker))
}

impl DefenseLayer for OutputVerifier {
    fn id(&self) -> LayerId {
        LayerId::OutputVerification
    }

    fn evaluate(
        &self,
        view: &LayerView<'_>,
        handle: Option<&mut CoordinationHandle<'_>>,
    ) -> Result<LayerVerdict, LayerError> {
        let mut handle = handle;
        let response = view.require_response()?;
        let rules = self.check_rules(response);
        let risk: f64 = rules.iter().map(|r| r.weight).sum();
        let threshold = effective_threshold(&self.policy, handle.as_deref_mut());

        let verdict = LayerVerdict::from_score(
            LayerId::OutputVerification,
            risk,
            threshold,
            self.policy.flag_threshold,
            rules.iter().map(|r| r.rule_id.to_string()).collect(),
        )
        .with_annotation(
            "rules",
            rules
                .iter()
                .map(|r| serde_json::Value::from(r.description.clone()))
                .collect::<Vec<_>>(),
        );

        if let Some(handle) = handle {
            handle.propose_transfer(summary_transfer(&verdict))?;
        }

        Ok(verdict)
    }
}
