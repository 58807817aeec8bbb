//! Request envelope domain types.
//!
//! Represents one adversarial input handed to the defense pipeline.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Longest user input the pipeline accepts, in characters.
pub const MAX_INPUT_CHARS: usize = 32_768;

/// Experiment bookkeeping attached to a request.
///
/// None of these fields are visible to the defense layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RequestMetadata {
    /// Experiment name (e.g. `exp5_coordination`).
    pub experiment: String,
    /// Configuration arm the request belongs to (e.g. `isolated`).
    pub config: String,
    /// 1-based trial number.
    pub trial: u32,
    /// Position of the attack in the corpus.
    pub attack_index: usize,
}

impl RequestMetadata {
    pub fn new(
        experiment: impl Into<String>,
        config: impl Into<String>,
        trial: u32,
        attack_index: usize,
    ) -> Self {
        Self {
            experiment: experiment.into(),
            config: config.into(),
            trial,
            attack_index,
        }
    }
}

/// One input unit for the pipeline.
///
/// `attack_label` is ground truth for scoring. Defense layers never see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RequestEnvelope {
    /// Unique identifier for this request.
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    /// Free-text user input (the attack prompt).
    pub user_input: String,

    /// Attack type label from the corpus.
    pub attack_label: String,

    /// Experiment metadata.
    pub metadata: RequestMetadata,
}

impl RequestEnvelope {
    /// Create a new envelope with a fresh identifier.
    pub fn new(
        user_input: impl Into<String>,
        attack_label: impl Into<String>,
        metadata: RequestMetadata,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_input: user_input.into(),
            attack_label: attack_label.into(),
            metadata,
        }
    }

    /// Check that the envelope is well formed.
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.user_input.trim().is_empty() {
            return Err("user_input is empty".to_string());
        }
        let len = self.user_input.chars().count();
        if len > MAX_INPUT_CHARS {
            return Err(format!(
                "user_input has {} characters, limit is {}",
                len, MAX_INPUT_CHARS
            ));
        }
        if self.user_input.contains('\0') {
            return Err("user_input contains a NUL byte".to_string());
        }
        if self.metadata.experiment.trim().is_empty() {
            return Err("metadata.experiment is empty".to_string());
        }
        if self.metadata.trial == 0 {
            return Err("metadata.trial is 1-based".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_request(input: &str) -> RequestEnvelope {
        RequestEnvelope::new(
            input,
            "prompt_injection",
            RequestMetadata::new("exp5_coordination", "isolated", 1, 0),
        )
    }

    #[test]
    fn test_valid_request() {
        assert!(make_request("What is the capital of France?").validate().is_ok());
    }

    #[test]
    fn test_empty_input_rejected() {
        let err = make_request("   \n").validate().unwrap_err();
        assert!(err.contains("empty"));
    }

    #[test]
    fn test_oversized_input_rejected() {
        let input = "a".repeat(MAX_INPUT_CHARS + 1);
        assert!(make_request(&input).validate().is_err());
    }

    #[test]
    fn test_zero_trial_rejected() {
        let mut request = make_request("hello");
        request.metadata.trial = 0;
        assert!(request.validate().unwrap_err().contains("trial"));
    }

    #[test]
    fn test_id_defaults_when_missing() {
        let json = serde_json::json!({
            "user_input": "hello",
            "attack_label": "benign",
            "metadata": {
                "experiment": "exp5",
                "config": "coordinated",
                "trial": 2,
                "attack_index": 7
            }
        });
        let request: RequestEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(request.metadata.trial, 2);
        assert!(!request.id.is_nil());
    }
}
