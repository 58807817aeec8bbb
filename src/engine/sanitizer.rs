//! Input Sanitization - layer 1.
//!
//! Normalizes obfuscated input and scores how much obfuscation it had to
//! undo. Downstream layers under role-based separation only ever see the
//! sanitized text this layer emits.

use std::sync::OnceLock;

use regex::Regex;

use crate::config::LayerPolicy;
use crate::domain::{Channel, ContentOrigin, LayerId, LayerVerdict, TrustLevel};
use crate::engine::{
    effective_threshold, CoordinationHandle, DefenseLayer, LayerError, LayerView, TransferRequest,
};

/// Inputs longer than this are scored as excessive.
pub const EXCESSIVE_INPUT_CHARS: usize = 4_000;

const INVISIBLE_CHARS: &[char] = &['\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}', '\u{00AD}'];

/// Obfuscation signals and the risk each contributes, strongest first.
const SIGNAL_WEIGHTS: &[(&str, f64)] = &[
    ("encoded_payload", 0.35),
    ("invisible_characters", 0.3),
    ("leetspeak", 0.3),
    ("spaced_letters", 0.25),
    ("control_characters", 0.2),
    ("excessive_length", 0.2),
];

fn spaced_letters() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\b[A-Za-z](?:[ .\-_][A-Za-z]){3,}\b").ok())
        .as_ref()
}

fn encoded_payload() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"[A-Za-z0-9+/]{24,}={0,2}").ok())
        .as_ref()
}

fn deleet(c: char) -> Option<char> {
    match c {
        '0' => Some('o'),
        '1' => Some('i'),
        '3' => Some('e'),
        '4' => Some('a'),
        '5' => Some('s'),
        '7' => Some('t'),
        '@' => Some('a'),
        '$' => Some('s'),
        _ => None,
    }
}

/// What normalization found and produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub text: String,
    pub signals: Vec<&'static str>,
    pub removed_characters: usize,
}

/// Normalize `input` and collect obfuscation signals.
pub fn normalize(input: &str) -> Normalized {
    let mut signals = Vec::new();

    if encoded_payload().is_some_and(|re| re.find_iter(input).any(|m| looks_encoded(m.as_str()))) {
        signals.push("encoded_payload");
    }
    if input.chars().count() > EXCESSIVE_INPUT_CHARS {
        signals.push("excessive_length");
    }

    let mut removed = 0usize;
    let mut saw_invisible = false;
    let mut saw_control = false;
    let stripped: String = input
        .chars()
        .filter(|c| {
            if INVISIBLE_CHARS.contains(c) {
                saw_invisible = true;
                removed += 1;
                false
            } else if c.is_control() && !c.is_whitespace() {
                saw_control = true;
                removed += 1;
                false
            } else {
                true
            }
        })
        .collect();
    if saw_invisible {
        signals.push("invisible_characters");
    }
    if saw_control {
        signals.push("control_characters");
    }

    let joined = match spaced_letters() {
        Some(re) if re.is_match(&stripped) => {
            signals.push("spaced_letters");
            re.replace_all(&stripped, |caps: &regex::Captures<'_>| {
                caps[0]
                    .chars()
                    .filter(|c| c.is_ascii_alphabetic())
                    .collect::<String>()
            })
            .into_owned()
        }
        _ => stripped,
    };

    let mut leet = false;
    let tokens: Vec<String> = joined
        .split_whitespace()
        .map(|token| {
            let has_letter = token.chars().any(|c| c.is_alphabetic());
            let has_leet = token.chars().any(|c| deleet(c).is_some());
            if has_letter && has_leet {
                leet = true;
                token.chars().map(|c| deleet(c).unwrap_or(c)).collect()
            } else {
                token.to_string()
            }
        })
        .collect();
    if leet {
        signals.push("leetspeak");
    }

    let text = tokens.join(" ").to_lowercase();

    signals.sort_by_key(|name| {
        SIGNAL_WEIGHTS
            .iter()
            .position(|(signal, _)| signal == name)
            .unwrap_or(usize::MAX)
    });

    Normalized {
        text,
        signals,
        removed_characters: removed,
    }
}

/// Base64-like runs need some variety to count; long plain words do not.
fn looks_encoded(candidate: &str) -> bool {
    let has_digit = candidate.chars().any(|c| c.is_ascii_digit());
    let has_upper = candidate.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = candidate.chars().any(|c| c.is_ascii_lowercase());
    let has_symbol = candidate.contains(['+', '/', '=']);
    (has_upper && has_lower && (has_digit || has_symbol)) || (has_digit && has_symbol)
}

fn weight(signal: &str) -> f64 {
    SIGNAL_WEIGHTS
        .iter()
        .find(|(name, _)| *name == signal)
        .map(|(_, weight)| *weight)
        .unwrap_or(0.0)
}

/// Layer 1: input sanitization.
pub struct InputSanitizer {
    policy: LayerPolicy,
}

impl InputSanitizer {
    pub fn new(policy: LayerPolicy) -> Self {
        Self { policy }
    }
}

impl DefenseLayer for InputSanitizer {
    fn id(&self) -> LayerId {
        LayerId::InputSanitization
    }

    fn evaluate(
        &self,
        view: &LayerView<'_>,
        handle: Option<&mut CoordinationHandle<'_>>,
    ) -> Result<LayerVerdict, LayerError> {
        let mut handle = handle;
        let normalized = normalize(view.input);
        let risk: f64 = normalized.signals.iter().map(|s| weight(s)).sum();
        let threshold = effective_threshold(&self.policy, handle.as_deref_mut());

        let verdict = LayerVerdict::from_score(
            LayerId::InputSanitization,
            risk,
            threshold,
            self.policy.flag_threshold,
            normalized.signals.iter().map(|s| s.to_string()).collect(),
        )
        .with_annotation("original_chars", view.input.chars().count())
        .with_annotation("sanitized_chars", normalized.text.chars().count())
        .with_annotation("removed_characters", normalized.removed_characters)
        .with_sanitized_input(normalized.text.clone());

        if let Some(handle) = handle {
            if !verdict.is_block() {
                let trust = if verdict.flagged {
                    TrustLevel::Sanitized
                } else {
                    TrustLevel::Verified
                };
                handle.propose_transfer(TransferRequest::new(
                    LayerId::PatternAnalysis,
                    Channel::Sanitized,
                    trust,
                    ContentOrigin::Layer(LayerId::InputSanitization),
                    normalized.text,
                ))?;
            }
        }

        Ok(verdict)
    }
}
