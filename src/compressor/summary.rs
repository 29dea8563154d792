//! Extractive summaries for omitted message runs.

use std::collections::HashMap;

use crate::types::Message;

/// Terms shorter than this (in chars) are ignored.
const MIN_TERM_CHARS: usize = 2;
/// A term must appear at least this often to be a topic.
const MIN_TERM_COUNT: usize = 2;
const MAX_TOPICS: usize = 3;

const STOPWORDS: &[&str] = &[
    // English
    "the", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by", "is", "are",
    "was", "be", "it", "this", "that", "as", "an", "if", "so", "do", "we", "you", "i", "me", "my",
    "not", "can", "from", "have", "has",
    // Chinese
    "是", "的", "了", "在", "有", "我", "你", "他", "我们", "你们", "他们", "这个", "那个", "一个",
    "可以", "没有", "就是",
];

fn is_stopword(term: &str) -> bool {
    STOPWORDS.contains(&term)
}

/// Up to three most frequent non-stopword terms across `messages`.
///
/// Ordered by descending frequency, ties alphabetically.
pub fn top_terms(messages: &[Message]) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for message in messages {
        let text = message.text().to_lowercase();
        for raw in text.split_whitespace() {
            let term = raw.trim_matches(|c: char| !c.is_alphanumeric());
            if term.chars().count() < MIN_TERM_CHARS || is_stopword(term) {
                continue;
            }
            *counts.entry(term.to_string()).or_default() += 1;
        }
    }

    let mut topics: Vec<(String, usize)> = counts
        .into_iter()
        .filter(|(_, n)| *n >= MIN_TERM_COUNT)
        .collect();
    topics.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    topics.into_iter().take(MAX_TOPICS).map(|(t, _)| t).collect()
}

/// One-line summary of an omitted run of messages.
pub fn summarize(messages: &[Message]) -> String {
    let topics = top_terms(messages);
    let n = messages.len();
    let noun = if n == 1 { "message" } else { "messages" };
    if topics.is_empty() {
        format!("{n} earlier {noun} omitted")
    } else {
        format!("{n} earlier {noun} omitted about {}", topics.join(", "))
    }
}
