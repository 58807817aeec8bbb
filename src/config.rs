//! Configuration module for Shield Stack.
//!
//! Loads configuration from YAML files and environment variables.

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

use crate::domain::{IsolationMode, LayerId};
use crate::error::PipelineError;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub experiment: ExperimentConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://shield_stack.db".to_string(),
        }
    }
}

/// Defense pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Which of the five layers run.
    #[serde(default)]
    pub layers: LayerToggles,
    /// Isolation mode used when a caller does not pick one.
    #[serde(default = "default_isolation_mode")]
    pub isolation_mode: String,
    /// Coordination default for API callers.
    #[serde(default)]
    pub coordination_enabled: bool,
    /// Per-layer thresholds.
    #[serde(default)]
    pub policies: LayerPolicies,
    /// Extra keywords the pattern analysis layer treats as suspicious.
    #[serde(default)]
    pub suspicious_keywords: Vec<String>,
    /// Responses longer than this are flagged by output verification.
    #[serde(default = "default_max_response_chars")]
    pub max_response_chars: usize,
}

fn default_isolation_mode() -> String {
    "good".to_string()
}

fn default_max_response_chars() -> usize {
    8_000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            layers: LayerToggles::default(),
            isolation_mode: default_isolation_mode(),
            coordination_enabled: false,
            policies: LayerPolicies::default(),
            suspicious_keywords: Vec::new(),
            max_response_chars: default_max_response_chars(),
        }
    }
}

impl PipelineConfig {
    /// Parse the configured default isolation mode.
    pub fn isolation(&self) -> Result<IsolationMode, PipelineError> {
        self.isolation_mode
            .parse()
            .map_err(PipelineError::InvalidConfiguration)
    }
}

/// Layer enable/disable flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LayerToggles {
    pub layer1_enabled: bool,
    pub layer2_enabled: bool,
    pub layer3_enabled: bool,
    pub layer4_enabled: bool,
    pub layer5_enabled: bool,
}

impl Default for LayerToggles {
    fn default() -> Self {
        Self::all(true)
    }
}

impl LayerToggles {
    /// Every layer set to `enabled`.
    pub fn all(enabled: bool) -> Self {
        Self {
            layer1_enabled: enabled,
            layer2_enabled: enabled,
            layer3_enabled: enabled,
            layer4_enabled: enabled,
            layer5_enabled: enabled,
        }
    }

    pub fn is_enabled(&self, layer: LayerId) -> bool {
        match layer {
            LayerId::InputSanitization => self.layer1_enabled,
            LayerId::PatternAnalysis => self.layer2_enabled,
            LayerId::ContextAnalysis => self.layer3_enabled,
            LayerId::OutputVerification => self.layer4_enabled,
            LayerId::ResponseVerification => self.layer5_enabled,
        }
    }

    /// Enabled layers in execution order.
    pub fn enabled_layers(&self) -> Vec<LayerId> {
        LayerId::ALL
            .iter()
            .copied()
            .filter(|layer| self.is_enabled(*layer))
            .collect()
    }
}

/// Thresholds of one layer.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct LayerPolicy {
    /// Risk at or above which the layer blocks.
    pub block_threshold: f64,
    /// Risk at or above which the layer flags the input.
    pub flag_threshold: f64,
    /// Upstream risk at or above which the layer adapts (coordination only).
    pub adaptive_ceiling: f64,
    /// Blocking threshold used once adapted.
    pub adaptive_threshold: f64,
}

impl LayerPolicy {
    pub const fn new(
        block_threshold: f64,
        flag_threshold: f64,
        adaptive_ceiling: f64,
        adaptive_threshold: f64,
    ) -> Self {
        Self {
            block_threshold,
            flag_threshold,
            adaptive_ceiling,
            adaptive_threshold,
        }
    }

    /// Check the thresholds are usable.
    pub fn validate(&self, layer: LayerId) -> Result<(), PipelineError> {
        let in_range = |v: f64| v.is_finite() && v > 0.0 && v <= 1.0;
        if !in_range(self.block_threshold) || !in_range(self.adaptive_threshold) {
            return Err(PipelineError::InvalidConfiguration(format!(
                "{}: thresholds must be in (0, 1]",
                layer
            )));
        }
        if !self.flag_threshold.is_finite() || self.flag_threshold < 0.0 {
            return Err(PipelineError::InvalidConfiguration(format!(
                "{}: flag_threshold must be non-negative",
                layer
            )));
        }
        if self.flag_threshold > self.block_threshold {
            return Err(PipelineError::InvalidConfiguration(format!(
                "{}: flag_threshold {} exceeds block_threshold {}",
                layer, self.flag_threshold, self.block_threshold
            )));
        }
        if !self.adaptive_ceiling.is_finite() || self.adaptive_ceiling < 0.0 {
            return Err(PipelineError::InvalidConfiguration(format!(
                "{}: adaptive_ceiling must be non-negative",
                layer
            )));
        }
        Ok(())
    }

    /// Whether this policy ever changes its threshold.
    pub fn is_adaptive(&self) -> bool {
        self.adaptive_threshold != self.block_threshold
    }
}

/// Thresholds for all five layers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LayerPolicies {
    pub input_sanitization: LayerPolicy,
    pub pattern_analysis: LayerPolicy,
    pub context_analysis: LayerPolicy,
    pub output_verification: LayerPolicy,
    pub response_verification: LayerPolicy,
}

impl Default for LayerPolicies {
    fn default() -> Self {
        Self {
            input_sanitization: LayerPolicy::new(0.9, 0.3, 1.0, 0.9),
            pattern_analysis: LayerPolicy::new(0.7, 0.3, 0.3, 0.5),
            context_analysis: LayerPolicy::new(0.75, 0.3, 0.6, 0.5),
            output_verification: LayerPolicy::new(0.8, 0.3, 1.0, 0.6),
            response_verification: LayerPolicy::new(0.6, 0.3, 1.0, 0.4),
        }
    }
}

impl LayerPolicies {
    pub fn get(&self, layer: LayerId) -> LayerPolicy {
        match layer {
            LayerId::InputSanitization => self.input_sanitization,
            LayerId::PatternAnalysis => self.pattern_analysis,
            LayerId::ContextAnalysis => self.context_analysis,
            LayerId::OutputVerification => self.output_verification,
            LayerId::ResponseVerification => self.response_verification,
        }
    }
}

/// Which protected system the pipeline talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// Deterministic offline stand-in.
    Scripted,
    /// OpenRouter chat completions.
    OpenRouter,
}

/// Protected system configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub kind: TargetKind,
    /// Model served by the protected system.
    pub model: String,
    /// API key for OpenRouter.
    pub api_key: String,
    pub base_url: String,
    /// Per-call timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            kind: TargetKind::Scripted,
            model: "meta-llama/llama-3.1-8b-instruct".to_string(),
            api_key: String::new(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Experiment driver configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Trials per attack prompt.
    pub trials: u32,
    /// Runs executed concurrently.
    pub concurrency: usize,
    /// Where databases and summaries go.
    pub output_dir: String,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            trials: 5,
            concurrency: 4,
            output_dir: "results".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from files and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (SHIELD__*)
    /// 2. config/local.yaml (if exists)
    /// 3. config/default.yaml
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            // Start with default config
            .add_source(File::with_name("config/default").required(false))
            // Layer on local overrides
            .add_source(File::with_name("config/local").required(false))
            // Layer on environment variables with SHIELD_ prefix
            .add_source(
                Environment::with_prefix("SHIELD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
