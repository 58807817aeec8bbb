//! Layer verdict domain types.
//!
//! Identifies the five defense layers and the decision each one returns.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// The five defense layers, in execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum LayerId {
    /// Layer 1: input normalization and obfuscation scoring.
    InputSanitization,
    /// Layer 2: structural and pattern analysis.
    PatternAnalysis,
    /// Layer 3: contextual and trust analysis.
    ContextAnalysis,
    /// Layer 4: output shape and format verification.
    OutputVerification,
    /// Layer 5: final response-safety verification.
    ResponseVerification,
}

impl LayerId {
    /// All layers in execution order.
    pub const ALL: [LayerId; 5] = [
        LayerId::InputSanitization,
        LayerId::PatternAnalysis,
        LayerId::ContextAnalysis,
        LayerId::OutputVerification,
        LayerId::ResponseVerification,
    ];

    /// 1-based position of the layer in the stack.
    pub fn index(&self) -> u8 {
        match self {
            LayerId::InputSanitization => 1,
            LayerId::PatternAnalysis => 2,
            LayerId::ContextAnalysis => 3,
            LayerId::OutputVerification => 4,
            LayerId::ResponseVerification => 5,
        }
    }

    /// Look a layer up by its 1-based index.
    pub fn from_index(index: u8) -> Option<Self> {
        LayerId::ALL.get(usize::from(index).checked_sub(1)?).copied()
    }

    /// Which side of the protected system this layer inspects.
    pub fn stage(&self) -> LayerStage {
        match self {
            LayerId::InputSanitization | LayerId::PatternAnalysis | LayerId::ContextAnalysis => {
                LayerStage::Input
            }
            LayerId::OutputVerification | LayerId::ResponseVerification => LayerStage::Output,
        }
    }
}

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerId::InputSanitization => write!(f, "input_sanitization"),
            LayerId::PatternAnalysis => write!(f, "pattern_analysis"),
            LayerId::ContextAnalysis => write!(f, "context_analysis"),
            LayerId::OutputVerification => write!(f, "output_verification"),
            LayerId::ResponseVerification => write!(f, "response_verification"),
        }
    }
}

impl std::str::FromStr for LayerId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "input_sanitization" | "layer1" => Ok(LayerId::InputSanitization),
            "pattern_analysis" | "layer2" => Ok(LayerId::PatternAnalysis),
            "context_analysis" | "layer3" => Ok(LayerId::ContextAnalysis),
            "output_verification" | "layer4" => Ok(LayerId::OutputVerification),
            "response_verification" | "layer5" => Ok(LayerId::ResponseVerification),
            _ => Err(format!("Unknown layer: {}", s)),
        }
    }
}

/// Pipeline stage a layer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LayerStage {
    /// Runs before the protected system is called.
    Input,
    /// Runs on the protected system's response.
    Output,
}

impl std::fmt::Display for LayerStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerStage::Input => write!(f, "input"),
            LayerStage::Output => write!(f, "output"),
        }
    }
}

/// Pass/block decision of one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pass,
    Block,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Pass => write!(f, "pass"),
            Decision::Block => write!(f, "block"),
        }
    }
}

/// Output of one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LayerVerdict {
    /// Layer that produced the verdict.
    pub layer: LayerId,

    /// Pass or block.
    pub decision: Decision,

    /// Risk contributed by this layer, in [0, 1].
    pub risk_score: f64,

    /// Blocking threshold the layer actually applied.
    pub threshold: f64,

    /// Whether the risk reached the layer's flag threshold.
    pub flagged: bool,

    /// Named detections, strongest first.
    pub signals: Vec<String>,

    /// Layer-specific diagnostic detail.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[schema(value_type = Object)]
    pub annotations: BTreeMap<String, serde_json::Value>,

    /// Normalized input (input sanitization only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sanitized_input: Option<String>,
}

impl LayerVerdict {
    /// Build a verdict from a risk score.
    ///
    /// The decision is `Block` when `risk_score >= threshold`.
    pub fn from_score(
        layer: LayerId,
        risk_score: f64,
        threshold: f64,
        flag_threshold: f64,
        signals: Vec<String>,
    ) -> Self {
        let risk_score = risk_score.clamp(0.0, 1.0);
        let decision = if risk_score >= threshold {
            Decision::Block
        } else {
            Decision::Pass
        };

        Self {
            layer,
            decision,
            risk_score,
            threshold,
            flagged: risk_score >= flag_threshold,
            signals,
            annotations: BTreeMap::new(),
            sanitized_input: None,
        }
    }

    /// Attach a diagnostic annotation.
    pub fn with_annotation(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.annotations.insert(key.to_string(), value.into());
        self
    }

    /// Attach the normalized input.
    pub fn with_sanitized_input(mut self, sanitized: String) -> Self {
        self.sanitized_input = Some(sanitized);
        self
    }

    pub fn is_block(&self) -> bool {
        self.decision == Decision::Block
    }

    /// Strongest detection, if any.
    pub fn primary_signal(&self) -> Option<&str> {
        self.signals.first().map(String::as_str)
    }
}

/// What a downstream layer may see of an upstream verdict under role-based
/// separation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct UpstreamVerdict {
    pub layer: LayerId,
    pub decision: Decision,
    pub risk_score: f64,
}

impl From<&LayerVerdict> for UpstreamVerdict {
    fn from(verdict: &LayerVerdict) -> Self {
        Self {
            layer: verdict.layer,
            decision: verdict.decision,
            risk_score: verdict.risk_score,
        }
    }
}
