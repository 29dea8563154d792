//! Completion request and its content hashes

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use super::message::{Message, Role};

/// A system prompt segment supplied alongside the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SystemPrompt {
    pub text: String,
}

/// Non-streaming or streaming completion request.
///
/// Treated as immutable once handed to the optimizer: every component that
/// needs to keep it stores its own clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system: Vec<SystemPrompt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
}

impl CompletionRequest {
    /// Create a non-streaming request.
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            system: Vec::new(),
            max_tokens: None,
            stream: false,
        }
    }

    /// Add a system prompt segment.
    pub fn system(mut self, text: impl Into<String>) -> Self {
        self.system.push(SystemPrompt { text: text.into() });
        self
    }

    /// Set the output token limit.
    pub fn max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = Some(n);
        self
    }

    /// Mark the request as streaming.
    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Whether this request may be cached, deduplicated or compressed.
    ///
    /// Streaming requests and requests without messages bypass every tier.
    pub fn is_cacheable(&self) -> bool {
        !self.stream && !self.messages.is_empty()
    }

    /// Content hash over `{model, messages, max_tokens}`.
    ///
    /// Returns `None` for requests that must never be cached. Uses
    /// `DefaultHasher` (SipHash with fixed keys), which is deterministic for
    /// a given build; the hash is an index only, callers confirm matches
    /// with [`same_content`](Self::same_content).
    pub fn cache_key(&self) -> Option<u64> {
        if !self.is_cacheable() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        self.model.hash(&mut hasher);
        self.messages.hash(&mut hasher);
        self.max_tokens.hash(&mut hasher);
        Some(hasher.finish())
    }

    /// Hash over the full request identity, including system segments.
    ///
    /// Used by the deduplicator, where two requests share an execution only
    /// when everything sent upstream is identical.
    pub fn identity_key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.model.hash(&mut hasher);
        self.messages.hash(&mut hasher);
        self.system.hash(&mut hasher);
        self.max_tokens.hash(&mut hasher);
        self.stream.hash(&mut hasher);
        hasher.finish()
    }

    /// Equality over the fields covered by [`cache_key`](Self::cache_key).
    pub fn same_content(&self, other: &CompletionRequest) -> bool {
        self.model == other.model
            && self.max_tokens == other.max_tokens
            && self.messages == other.messages
    }

    /// All message text, lowercased and space-joined. Empty messages are skipped.
    pub fn conversation_text(&self) -> String {
        self.messages
            .iter()
            .map(Message::text)
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Text of the last user-role message, if any.
    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(Message::text)
    }

    /// Total character length of all message contents.
    pub fn total_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.char_len()).sum()
    }
}
