//! Per-message importance scoring.

use crate::types::{Message, Role};

const SYSTEM_BONUS: f64 = 10.0;
/// Bonus per recency rank within the trailing window.
const RECENT_BONUS_STEP: f64 = 5.0;
const RECENT_WINDOW: usize = 3;
const KEYWORD_BONUS: f64 = 3.0;
const LONG_MESSAGE_BONUS: f64 = 2.0;
const LONG_MESSAGE_CHARS: usize = 200;
const QUESTION_BONUS: f64 = 1.5;
const USER_BONUS: f64 = 1.0;

/// Default keyword list: technical and help-seeking terms, English and Chinese.
pub const DEFAULT_KEYWORDS: &[&str] = &[
    "error", "错误", "问题", "help", "帮助", "how", "what", "why", "when", "where", "如何", "什么",
    "为什么", "怎么", "哪里", "code", "代码", "function", "函数", "bug", "fix", "修复", "解决",
];

/// Transient importance score of one message during a compression pass.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageImportance {
    pub index: usize,
    pub score: f64,
    pub is_system: bool,
    pub is_recent: bool,
    pub has_keywords: bool,
}

/// Score every message of a conversation.
pub fn score_messages(messages: &[Message], keywords: &[String]) -> Vec<MessageImportance> {
    let recent_start = messages.len().saturating_sub(RECENT_WINDOW);

    messages
        .iter()
        .enumerate()
        .map(|(index, message)| {
            let text = message.text();
            let is_system = message.role == Role::System;
            let is_recent = index >= recent_start;
            let has_keywords = contains_keyword(&text, keywords);

            let mut score = 0.0;
            if is_system {
                score += SYSTEM_BONUS;
            }
            if is_recent {
                score += RECENT_BONUS_STEP * (index - recent_start + 1) as f64;
            }
            if has_keywords {
                score += KEYWORD_BONUS;
            }
            if text.chars().count() > LONG_MESSAGE_CHARS {
                score += LONG_MESSAGE_BONUS;
            }
            if text.contains('?') || text.contains('？') {
                score += QUESTION_BONUS;
            }
            if message.role == Role::User {
                score += USER_BONUS;
            }

            MessageImportance {
                index,
                score,
                is_system,
                is_recent,
                has_keywords,
            }
        })
        .collect()
}

fn contains_keyword(text: &str, keywords: &[String]) -> bool {
    let lower = text.to_lowercase();
    keywords.iter().any(|k| lower.contains(k.as_str()))
}
