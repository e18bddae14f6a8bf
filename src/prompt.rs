//! Prompt text, its content hash and per-batch rendering.
//!
//! The hash keys every stored answer, so editing the prompt file starts a new
//! result slot instead of overwriting output produced by the old wording.

use std::path::Path;

use crate::items::Item;

const PROMPT_HASH_CHARS: usize = 16;

// =============================================================================
// Fixed instructions
// =============================================================================

pub const SYSTEM_INSTRUCTION: &str = "You turn news headlines into structured story seeds. \
Answer with valid JSON only: no prose, no markdown fences.";

/// Re-sent after a malformed answer and every N items when proactive
/// reminders are enabled.
pub const COMPLIANCE_REMINDER: &str = "REMINDER: return ONLY a JSON array containing exactly \
one object per headline, in headline order. Every object must carry the headline's \"id\" \
and every required key. Do not add commentary, markdown or extra top-level values.";

/// Used when no prompt file is configured or found.
pub const DEFAULT_PROMPT: &str = "You are a story-idea abstraction engine that turns absurd \
real-world news headlines into structured story seeds. Preserve the irony and factual core \
while keeping sentences below 50 words.\n\n\
For each headline return an object with the keys \"id\", \"title\", \"core_event\", \
\"themes\", \"tone\" and \"conflict_type\".";

const OUTPUT_RULES: &str = "### OUTPUT\n\
- Return a JSON array with one object per headline above.\n\
- Copy each headline's id (the text in square brackets) into the \"id\" key.\n\
- Never omit keys; use an empty string or empty list when unsure.";

// =============================================================================
// Bundle
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("io error reading prompt {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("prompt file {0} is empty")]
    Empty(String),
}

/// Stable content hash of the exact prompt text.
pub fn prompt_hash(text: &str) -> String {
    let hash = blake3::hash(text.as_bytes()).to_hex();
    hash.as_str()[..PROMPT_HASH_CHARS].to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptBundle {
    pub text: String,
    pub hash: String,
}

impl PromptBundle {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into().trim_end().to_string();
        let hash = prompt_hash(&text);
        Self { text, hash }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PromptError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| PromptError::Io {
            path: path.display().to_string(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Err(PromptError::Empty(path.display().to_string()));
        }
        Ok(Self::new(raw))
    }

    /// Load `path`, falling back to [`DEFAULT_PROMPT`] when it is unset or
    /// missing. Other read errors still fail.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, PromptError> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            Some(p) => {
                tracing::warn!(path = %p.display(), "prompt file not found; using built-in prompt");
                Ok(Self::new(DEFAULT_PROMPT))
            }
            None => Ok(Self::new(DEFAULT_PROMPT)),
        }
    }

    /// Render the user prompt for one batch.
    pub fn compose(&self, items: &[Item]) -> String {
        let mut headlines = String::from("### HEADLINES");
        for (n, item) in items.iter().enumerate() {
            headlines.push_str(&format!("\n{}. [{}] {}", n + 1, item.item_id, item.title.trim()));
        }
        [self.text.as_str(), headlines.as_str(), OUTPUT_RULES].join("\n\n")
    }
}
