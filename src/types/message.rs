//! Message types for chat conversations

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Role of a message participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A typed block inside structured message content.
///
/// The block kind is resolved once at deserialisation time; the rest of the
/// crate only ever sees these variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

impl ContentBlock {
    /// Text carried by this block, if it contributes to the conversation text.
    ///
    /// Tool invocations carry arguments, not prose, and yield `None`.
    pub fn text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::ToolResult { content, .. } => Some(content),
            ContentBlock::ToolUse { .. } => None,
        }
    }
}

// Hashes agree with the derived `PartialEq` on every variant.
impl Hash for ContentBlock {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            ContentBlock::Text { text } => text.hash(state),
            ContentBlock::ToolUse { id, name, input } => {
                id.hash(state);
                name.hash(state);
                hash_json(input, state);
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
            } => {
                tool_use_id.hash(state);
                content.hash(state);
            }
        }
    }
}

/// Hash a JSON value with object keys visited in sorted order.
///
/// `Value` equality ignores key order, and so must its hash, whether or not
/// serde_json's `preserve_order` feature is enabled somewhere in the build.
fn hash_json<H: Hasher>(value: &serde_json::Value, state: &mut H) {
    use serde_json::Value;

    std::mem::discriminant(value).hash(state);
    match value {
        Value::Null => {}
        Value::Bool(b) => b.hash(state),
        Value::Number(n) => n.to_string().hash(state),
        Value::String(s) => s.hash(state),
        Value::Array(items) => {
            items.len().hash(state);
            for item in items {
                hash_json(item, state);
            }
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            entries.len().hash(state);
            for (key, item) in entries {
                key.hash(state);
                hash_json(item, state);
            }
        }
    }
}

/// Message content: plain text or a sequence of typed blocks
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    /// Flatten the content to text.
    ///
    /// Block content is joined with newlines; blocks without text are skipped.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(ContentBlock::text)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Length of the flattened text in characters.
    pub fn char_len(&self) -> usize {
        match self {
            MessageContent::Text(s) => s.chars().count(),
            MessageContent::Blocks(_) => self.text().chars().count(),
        }
    }
}

/// A chat message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    /// Create a message with the given role and text.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(content.into()),
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a message from structured blocks
    pub fn blocks(role: Role, blocks: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// Flattened text of this message.
    pub fn text(&self) -> String {
        self.content.text()
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }
}
