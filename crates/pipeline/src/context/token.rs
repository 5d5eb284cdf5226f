//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token. Close enough
//! for BPE tokenizers on English text, and it keeps budget arithmetic
//! predictable in tests.

use mentorlink_core::message::Turn;

/// Per-message overhead for role name and delimiters in the wire format.
pub const MESSAGE_OVERHEAD: usize = 4;

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up. Counts characters rather
/// than UTF-8 bytes, so non-Latin scripts are not over-charged.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Estimate tokens for a history turn including message overhead.
pub fn estimate_turn_tokens(turn: &Turn) -> usize {
    MESSAGE_OVERHEAD + estimate_tokens(&turn.content)
}

/// Estimate tokens for a slice of turns.
pub fn estimate_turns_tokens(turns: &[Turn]) -> usize {
    turns.iter().map(estimate_turn_tokens).sum()
}
