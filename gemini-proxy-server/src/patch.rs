//! Detection of IDE "apply code patch" system prompts.
//!
//! A patch request must reach the client as one contiguous piece of text,
//! so the bridge buffers it instead of forwarding token deltas. Detection is
//! best effort: a miss only means the patch streams in fragments, a false
//! hit only means it arrives in one piece.

use crate::mapper::looks_like_system_prompt;
use gemini_proxy_shared::{ChatRequest, MessageRole};
use regex::Regex;
use tracing::debug;

/// Per-request delivery decision derived from the prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchContext {
    pub is_patch: bool,
}

const DEFAULT_PHRASES: &[&str] = &[
    "apply the following patch",
    "apply this patch",
    "apply the patch",
    "unified diff",
    "*** begin patch",
    "<<<<<<< search",
    ">>>>>>> replace",
    "search/replace block",
];

const DEFAULT_PATTERNS: &[&str] = &[
    r"(?m)^\s*```(?:diff|patch)\b",
    r"(?m)^(?:---|\+\+\+) [ab]/",
    r"(?m)^@@ -\d+(?:,\d+)? \+\d+(?:,\d+)? @@",
];

/// Sentinel phrases and structural patterns that mark a patch prompt.
#[derive(Debug, Clone)]
pub struct PatchPolicy {
    phrases: Vec<String>,
    patterns: Vec<Regex>,
}

impl Default for PatchPolicy {
    fn default() -> Self {
        Self {
            phrases: DEFAULT_PHRASES.iter().map(|p| p.to_string()).collect(),
            patterns: DEFAULT_PATTERNS
                .iter()
                .filter_map(|pattern| Regex::new(pattern).ok())
                .collect(),
        }
    }
}

impl PatchPolicy {
    /// The default policy extended with operator supplied phrases.
    pub fn with_extra_phrases(extra: &[String]) -> Self {
        let mut policy = Self::default();
        policy.phrases.extend(
            extra
                .iter()
                .map(|phrase| phrase.trim().to_lowercase())
                .filter(|phrase| !phrase.is_empty()),
        );
        policy
    }

    /// Classifies a request. Pure: the same request always yields the same answer.
    pub fn classify(&self, request: &ChatRequest) -> PatchContext {
        let is_patch = system_prompts(request).any(|prompt| self.matches(&prompt));
        if is_patch {
            debug!(model = %request.model, "Detected code patch prompt");
        }
        PatchContext { is_patch }
    }

    fn matches(&self, prompt: &str) -> bool {
        let lowered = prompt.to_lowercase();
        self.phrases.iter().any(|phrase| lowered.contains(phrase.as_str()))
            || self.patterns.iter().any(|pattern| pattern.is_match(prompt))
    }
}

/// Texts that act as the system prompt: system-role messages, or the
/// promoted first user message when there are none.
fn system_prompts(request: &ChatRequest) -> impl Iterator<Item = String> + '_ {
    let has_system = request.messages.iter().any(|m| m.role == MessageRole::System);
    let promoted = if has_system || request.messages.len() < 2 {
        None
    } else {
        request
            .messages
            .first()
            .filter(|first| looks_like_system_prompt(first))
            .map(|first| first.text())
    };

    request
        .messages
        .iter()
        .filter(|m| m.role == MessageRole::System)
        .map(|m| m.text())
        .chain(promoted)
}
