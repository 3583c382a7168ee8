use crate::error::{InferenceError, Result};
use crate::inference::ChatTurn;
use std::path::Path;
use tokenizers::Tokenizer;

const TOKENIZER_FILE: &str = "tokenizer.json";

/// Counts prompt tokens with the model's own tokenizer when one is shipped
pub struct PromptCounter {
    tokenizer: Option<Tokenizer>,
}

impl std::fmt::Debug for PromptCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptCounter")
            .field("tokenizer", &self.tokenizer.as_ref().map(|_| "Tokenizer { ... }"))
            .finish()
    }
}

impl PromptCounter {
    /// Counter that always estimates
    #[must_use]
    pub const fn estimate_only() -> Self {
        Self { tokenizer: None }
    }

    /// Load `tokenizer.json` from a model directory, estimating if it is absent
    pub fn from_model_dir(model_dir: &Path) -> Result<Self> {
        let path = model_dir.join(TOKENIZER_FILE);
        if !path.exists() {
            tracing::debug!("No {TOKENIZER_FILE} in {}, estimating prompt tokens", model_dir.display());
            return Ok(Self::estimate_only());
        }

        let tokenizer = Tokenizer::from_file(&path).map_err(|e| {
            InferenceError::ModelLoad(format!("Failed to load {}: {e}", path.display()))
        })?;

        Ok(Self {
            tokenizer: Some(tokenizer),
        })
    }

    #[must_use]
    pub const fn has_tokenizer(&self) -> bool {
        self.tokenizer.is_some()
    }

    /// Token count of the rendered history
    #[must_use]
    pub fn count(&self, history: &[ChatTurn]) -> usize {
        let rendered = render(history);

        if let Some(tokenizer) = &self.tokenizer {
            match tokenizer.encode(rendered.as_str(), true) {
                Ok(encoding) => return encoding.len(),
                Err(e) => tracing::warn!("Tokenizer failed, estimating instead: {e}"),
            }
        }

        estimate(&rendered)
    }
}

/// Plain role-tagged transcript used for counting
fn render(history: &[ChatTurn]) -> String {
    history
        .iter()
        .map(|turn| format!("<|{}|>\n{}\n", turn.role, turn.content))
        .collect()
}

/// Roughly four characters per token
fn estimate(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}
