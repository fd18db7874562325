//! Feedback merging across attempts.
//!
//! Attempts tend to repeat each other almost verbatim. Merging keeps the
//! first phrasing of every distinct sentence and suggestion, in the order
//! they were first seen, comparing text case- and whitespace-insensitively.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Feedback recorded when no attempt produced a valid grade.
pub const FAILED_GRADING_FEEDBACK: &str =
    "Grading failed: no valid grading attempt was produced. Manual review required.";

/// Suggestion recorded when no attempt produced a valid grade.
pub const FAILED_GRADING_SUGGESTION: &str = "Please review this submission manually";

/// Feedback used when valid attempts exist but none wrote any.
pub const NO_FEEDBACK: &str = "No feedback provided";

/// Output of [`FeedbackMerger::merge`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedFeedback {
    pub feedback: String,
    pub suggestions: Vec<String>,
}

impl MergedFeedback {
    /// Placeholder for a unit where every attempt failed.
    pub fn failed() -> Self {
        Self {
            feedback: FAILED_GRADING_FEEDBACK.to_string(),
            suggestions: vec![FAILED_GRADING_SUGGESTION.to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedbackMerger {
    /// Keep at most this many suggestions.
    pub max_suggestions: Option<usize>,
}

impl FeedbackMerger {
    pub fn new(max_suggestions: Option<usize>) -> Self {
        Self { max_suggestions }
    }

    /// Merge `(feedback, suggestions)` pairs from valid attempts, in attempt order.
    pub fn merge<'a, I>(&self, attempts: I) -> MergedFeedback
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        let mut any = false;
        let mut seen_sentences = HashSet::new();
        let mut sentences = Vec::new();
        let mut seen_suggestions = HashSet::new();
        let mut suggestions = Vec::new();

        for (feedback, items) in attempts {
            any = true;
            for sentence in split_sentences(feedback) {
                if seen_sentences.insert(normalize(sentence)) {
                    sentences.push(sentence.to_string());
                }
            }
            for item in items {
                let key = normalize(item);
                if !key.is_empty() && seen_suggestions.insert(key) {
                    suggestions.push(item.trim().to_string());
                }
            }
        }

        if !any {
            return MergedFeedback::failed();
        }

        if let Some(cap) = self.max_suggestions {
            suggestions.truncate(cap);
        }

        let feedback = if sentences.is_empty() {
            NO_FEEDBACK.to_string()
        } else {
            sentences.join(" ")
        };

        MergedFeedback {
            feedback,
            suggestions,
        }
    }
}

/// Comparison key: lowercase, single spaces, no surrounding whitespace or
/// trailing sentence punctuation.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .trim_end_matches(['.', '!', '?'])
        .trim_end()
        .to_string()
}

/// Split on `.`, `!` or `?` followed by whitespace or end of text.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars.peek().map_or(true, |(_, next)| next.is_whitespace());
            if at_boundary {
                let end = i + c.len_utf8();
                let sentence = text[start..end].trim();
                if !sentence.is_empty() {
                    out.push(sentence);
                }
                start = end;
            }
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}
