//! Attack corpus loading.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ShieldError, ShieldResult};

/// One corpus entry. `attack_type` is a label only; no layer sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttackPrompt {
    #[serde(rename = "type")]
    pub attack_type: String,
    pub prompt: String,
}

/// Parse a corpus from its JSON text (an array of `{type, prompt}`).
pub fn parse_corpus(json: &str) -> ShieldResult<Vec<AttackPrompt>> {
    let corpus: Vec<AttackPrompt> = serde_json::from_str(json)?;
    if corpus.is_empty() {
        return Err(ShieldError::BadRequest("attack corpus is empty".to_string()));
    }
    if let Some(index) = corpus.iter().position(|a| a.prompt.trim().is_empty()) {
        return Err(ShieldError::BadRequest(format!(
            "attack corpus entry {} has an empty prompt",
            index
        )));
    }
    Ok(corpus)
}

/// Read and parse the corpus file at `path`.
pub async fn load_corpus(path: &Path) -> ShieldResult<Vec<AttackPrompt>> {
    let json = tokio::fs::read_to_string(path).await?;
    let corpus = parse_corpus(&json)?;
    tracing::info!(
        path = %path.display(),
        attacks = corpus.len(),
        "Attack corpus loaded"
    );
    Ok(corpus)
}
