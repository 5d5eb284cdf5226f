//! Prompt assembler: composes one model request under a token budget.
//!
//! Fill order:
//!
//! 1. **System instructions** and the **current query** are reserved first and
//!    never trimmed. If they alone exceed the budget, assembly fails.
//! 2. **Fragments** by descending score. Only whole fragments go in; one that
//!    does not fit is skipped and the scan continues with the next.
//! 3. **History**, newest turn first. The first turn that does not fit ends
//!    the scan, so the kept window is always a contiguous, most-recent suffix.
//!
//! Assembly is deterministic: identical inputs always produce identical
//! output.

use crate::context::token;
use mentorlink_core::message::{Role, Turn};
use mentorlink_core::provider::PromptMessage;
use mentorlink_core::retrieval::Fragment;
use serde::{Deserialize, Serialize};

// ── Types ─────────────────────────────────────────────────────────────────

/// All inputs required by the assembler for a single model call.
pub struct AssemblyInput<'a> {
    /// System instructions (never trimmed).
    pub system_instructions: &'a str,
    /// Conversation history, oldest first.
    pub history: &'a [Turn],
    /// Retrieved fragments, in any order.
    pub fragments: &'a [Fragment],
    /// The current user query (never trimmed).
    pub query: &'a str,
}

/// The assembled prompt, ready for a model request.
#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    /// System instructions, reference material, history, then the query.
    pub messages: Vec<PromptMessage>,
    /// Fragments that made it into the prompt, by descending score.
    pub included_fragments: Vec<Fragment>,
    /// Assembly metadata (token counts, drops, utilization).
    pub metadata: AssemblyMetadata,
}

/// Detailed metadata about the assembly process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyMetadata {
    /// Total estimated tokens in the assembled prompt.
    pub total_tokens: usize,
    /// Configured token budget.
    pub budget: usize,
    /// Budget utilization percentage (0.0–100.0).
    pub utilization_pct: f32,
    /// Per-layer statistics.
    pub per_layer: Vec<LayerStats>,
    /// Items dropped from each layer.
    pub drops: Vec<DropInfo>,
}

/// Statistics for a single prompt layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerStats {
    pub name: String,
    pub tokens: usize,
    pub items_included: usize,
    pub items_total: usize,
}

/// Information about items dropped from a layer during budget enforcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropInfo {
    pub layer: String,
    pub items_dropped: usize,
    pub tokens_dropped: usize,
    pub reason: String,
}

/// Errors from prompt assembly.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AssemblyError {
    /// System instructions + current query alone exceed the budget.
    #[error("System instructions ({system_tokens} tokens) + query ({query_tokens} tokens) exceed budget ({budget} tokens)")]
    BudgetExceeded {
        system_tokens: usize,
        query_tokens: usize,
        budget: usize,
    },
}

impl From<AssemblyError> for mentorlink_core::Error {
    fn from(e: AssemblyError) -> Self {
        match e {
            AssemblyError::BudgetExceeded { system_tokens, query_tokens, budget } => {
                mentorlink_core::Error::BudgetExceeded {
                    required: system_tokens + query_tokens,
                    budget,
                }
            }
        }
    }
}

// ── Assembler ─────────────────────────────────────────────────────────────

/// The prompt assembler. Stateless apart from its budget.
#[derive(Debug, Clone)]
pub struct PromptAssembler {
    budget: usize,
}

impl PromptAssembler {
    pub fn new(budget: usize) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn assemble(&self, input: &AssemblyInput<'_>) -> Result<AssembledPrompt, AssemblyError> {
        let mut stats: Vec<LayerStats> = Vec::new();
        let mut drops: Vec<DropInfo> = Vec::new();

        // ── Reserved: system instructions + query ─────────────────────────
        let system_tokens = token::estimate_tokens(input.system_instructions);
        let query_tokens = token::estimate_tokens(input.query);
        let reserved = system_tokens + query_tokens;
        if reserved > self.budget {
            return Err(AssemblyError::BudgetExceeded {
                system_tokens,
                query_tokens,
                budget: self.budget,
            });
        }
        stats.push(Self::full_stats("system", system_tokens));
        stats.push(Self::full_stats("query", query_tokens));

        let mut remaining = self.budget - reserved;

        // ── Fragments ─────────────────────────────────────────────────────
        let (included_fragments, frag_stats, frag_drop) =
            Self::select_fragments(input.fragments, remaining);
        remaining -= frag_stats.tokens;
        stats.push(frag_stats);
        drops.extend(frag_drop);

        // ── History ───────────────────────────────────────────────────────
        let (history, hist_stats, hist_drop) = Self::select_history(input.history, remaining);
        stats.push(hist_stats);
        drops.extend(hist_drop);

        // ── Messages ──────────────────────────────────────────────────────
        let mut messages = Vec::with_capacity(history.len() + 3);
        messages.push(PromptMessage::system(input.system_instructions));
        if !included_fragments.is_empty() {
            messages.push(PromptMessage::system(render_reference_material(&included_fragments)));
        }
        messages.extend(history);
        messages.push(PromptMessage::user(input.query));

        let total_tokens: usize = stats.iter().map(|s| s.tokens).sum();
        let utilization_pct = if self.budget == 0 {
            0.0
        } else {
            (total_tokens as f32 / self.budget as f32) * 100.0
        };

        Ok(AssembledPrompt {
            messages,
            included_fragments,
            metadata: AssemblyMetadata {
                total_tokens,
                budget: self.budget,
                utilization_pct,
                per_layer: stats,
                drops,
            },
        })
    }

    fn select_fragments(fragments: &[Fragment], budget: usize) -> (Vec<Fragment>, LayerStats, Option<DropInfo>) {
        let layer = "fragments";
        let mut ranked: Vec<&Fragment> = fragments.iter().collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut used = 0;
        let mut included = Vec::new();
        let mut dropped = 0;
        let mut dropped_tokens = 0;

        for fragment in ranked {
            let cost = token::estimate_tokens(&fragment.text);
            if used + cost <= budget {
                used += cost;
                included.push(fragment.clone());
            } else {
                dropped += 1;
                dropped_tokens += cost;
            }
        }

        let stats = LayerStats {
            name: layer.into(),
            tokens: used,
            items_included: included.len(),
            items_total: fragments.len(),
        };
        (
            included,
            stats,
            Self::maybe_drop(layer, dropped, dropped_tokens, "Fragment did not fit remaining budget"),
        )
    }

    fn select_history(turns: &[Turn], budget: usize) -> (Vec<PromptMessage>, LayerStats, Option<DropInfo>) {
        let layer = "history";
        let eligible: Vec<&Turn> = turns.iter().filter(|t| t.role != Role::System).collect();

        let mut used = 0;
        let mut kept = 0;
        for turn in eligible.iter().rev() {
            let cost = token::estimate_turn_tokens(turn);
            if used + cost > budget {
                break;
            }
            used += cost;
            kept += 1;
        }

        let cut = eligible.len() - kept;
        let dropped_tokens: usize = eligible[..cut].iter().map(|t| token::estimate_turn_tokens(t)).sum();
        let messages = eligible[cut..]
            .iter()
            .map(|t| PromptMessage::new(t.role, t.content.clone()))
            .collect();

        let stats = LayerStats {
            name: layer.into(),
            tokens: used,
            items_included: kept,
            items_total: eligible.len(),
        };
        (
            messages,
            stats,
            Self::maybe_drop(layer, cut, dropped_tokens, "Oldest turns dropped"),
        )
    }

    fn full_stats(name: &str, tokens: usize) -> LayerStats {
        LayerStats {
            name: name.into(),
            tokens,
            items_included: 1,
            items_total: 1,
        }
    }

    fn maybe_drop(layer: &str, dropped: usize, tokens: usize, reason: &str) -> Option<DropInfo> {
        (dropped > 0).then(|| DropInfo {
            layer: layer.into(),
            items_dropped: dropped,
            tokens_dropped: tokens,
            reason: reason.into(),
        })
    }
}

/// Render fragments as a single reference block.
fn render_reference_material(fragments: &[Fragment]) -> String {
    let mut out = String::from("[Reference Material]\n");
    for f in fragments {
        out.push_str(&format!("\n[Source: {} | id: {}]\n{}\n", f.source, f.id, f.text));
    }
    out
}
