//! Context window helpers
//!
//! Token counts here are a character-based approximation (≈4 characters per
//! token). The estimate is deterministic: identical contents always produce the
//! same count, which is all `countTokens` promises.

use crate::types::{Content, Part, Role};

/// Characters contributed by one part.
///
/// Text counts verbatim; calls and responses count their JSON payload.
fn part_chars(part: &Part) -> usize {
    match part {
        Part::Text(text) => text.text.chars().count(),
        Part::FunctionCall(call) => match &call.args {
            Some(args) => serde_json::Value::Object(args.clone())
                .to_string()
                .chars()
                .count(),
            None => 2, // "{}"
        },
        Part::FunctionResponse(resp) => serde_json::Value::Object(resp.response.clone())
            .to_string()
            .chars()
            .count(),
    }
}

/// Estimated token count: `max(1, ceil(chars / 4))`.
pub fn estimate_tokens(contents: &[Content]) -> u32 {
    let total_chars: usize = contents
        .iter()
        .flat_map(|content| content.parts.iter())
        .map(part_chars)
        .sum();

    let tokens = total_chars.div_ceil(4).max(1);
    u32::try_from(tokens).unwrap_or(u32::MAX)
}

/// Returns true when the estimate exceeds `limit * margin`.
pub fn is_approaching_limit(contents: &[Content], limit: u32, margin: f32) -> bool {
    let estimated = estimate_tokens(contents);
    let threshold = (limit as f32 * margin) as u32;
    estimated > threshold
}

/// Keeps the first content (the opening prompt) plus the last `keep` entries.
///
/// The kept tail never starts with a tool turn, since its function responses
/// would be orphaned from the calls that produced them.
pub fn truncate_history(history: &[Content], keep: usize) -> Vec<Content> {
    if history.len() <= keep + 1 {
        return history.to_vec();
    }

    let mut start = history.len() - keep;
    while start < history.len() && history[start].role == Role::Tool {
        start += 1;
    }

    let mut result = Vec::with_capacity(history.len() - start + 1);
    result.push(history[0].clone());
    result.extend_from_slice(&history[start..]);
    result
}
