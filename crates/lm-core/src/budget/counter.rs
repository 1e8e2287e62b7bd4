//! Token counting for budget management.
//!
//! Provides heuristic token estimation (chars/4 + safety margin) as the
//! built-in default. A real tokenizer lives behind the inference engine;
//! implementations of [`TokenCounter`] can delegate to it.

use std::sync::Arc;

use crate::budget::types::BudgetError;
use crate::types::{ContentPart, TurnSpec};

/// Trait for token counting implementations.
///
/// Counting must be deterministic, and monotonic in the sense that a
/// non-empty turn never counts as zero tokens: every turn carries at least
/// its control-token overhead for role delimiting.
pub trait TokenCounter: Send + Sync {
    /// Count tokens in a plain text string.
    fn count_text(&self, text: &str) -> u32;

    /// Count tokens across content parts. Fails rather than miscounting
    /// when a part cannot be tokenized.
    fn count_parts(&self, parts: &[ContentPart]) -> Result<u32, BudgetError>;

    /// Count one turn, including per-turn control-token overhead.
    fn count_spec(&self, spec: &TurnSpec) -> Result<u32, BudgetError>;

    /// Count a prompt of several turns.
    fn count_specs(&self, specs: &[TurnSpec]) -> Result<u32, BudgetError> {
        let mut total = 0u32;
        for spec in specs {
            total = total.saturating_add(self.count_spec(spec)?);
        }
        Ok(total)
    }
}

/// Heuristic token counter using character-based estimation.
///
/// Uses the approximation: tokens ≈ characters / 4, with a safety margin
/// plus a flat per-turn overhead for the control tokens that delimit
/// roles. Intentionally conservative to avoid underestimating usage.
///
/// Media parts are charged a flat per-item cost, but only for kinds the
/// counter was configured to accept; anything else fails with
/// [`BudgetError::UntokenizableContent`].
#[derive(Debug, Clone)]
pub struct HeuristicTokenCounter {
    /// Characters per token ratio (default: 4)
    chars_per_token: f64,
    /// Safety margin multiplier (default: 1.1 = 10% extra)
    safety_margin: f64,
    /// Control-token overhead per turn
    turn_overhead: u32,
    image_cost: Option<u32>,
    audio_cost: Option<u32>,
}

impl HeuristicTokenCounter {
    /// Create a new heuristic counter with custom parameters.
    pub fn new(chars_per_token: f64, safety_margin: f64, turn_overhead: u32) -> Self {
        Self {
            chars_per_token,
            safety_margin,
            turn_overhead,
            image_cost: None,
            audio_cost: None,
        }
    }

    /// Create with default parameters (chars/4 + 10% margin + 4 tokens of
    /// per-turn overhead), text-only.
    pub fn with_defaults() -> Self {
        Self::new(4.0, 1.1, 4)
    }

    /// Accept image parts at a flat per-image cost.
    pub fn with_image_cost(mut self, tokens: u32) -> Self {
        self.image_cost = Some(tokens);
        self
    }

    /// Accept audio parts at a flat per-clip cost.
    pub fn with_audio_cost(mut self, tokens: u32) -> Self {
        self.audio_cost = Some(tokens);
        self
    }
}

impl Default for HeuristicTokenCounter {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl TokenCounter for HeuristicTokenCounter {
    fn count_text(&self, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }

        let char_count = text.chars().count() as f64;
        let base_tokens = char_count / self.chars_per_token;
        let adjusted_tokens = base_tokens * self.safety_margin;

        adjusted_tokens.ceil() as u32
    }

    fn count_parts(&self, parts: &[ContentPart]) -> Result<u32, BudgetError> {
        let mut total = 0u32;
        for part in parts {
            let part_tokens = match part {
                ContentPart::Text { text } => self.count_text(text),
                ContentPart::Image { .. } => self.image_cost.ok_or(
                    BudgetError::UntokenizableContent { kind: part.kind() },
                )?,
                ContentPart::Audio { .. } => self.audio_cost.ok_or(
                    BudgetError::UntokenizableContent { kind: part.kind() },
                )?,
            };
            total = total.saturating_add(part_tokens);
        }
        Ok(total)
    }

    fn count_spec(&self, spec: &TurnSpec) -> Result<u32, BudgetError> {
        Ok(self
            .count_parts(&spec.parts)?
            .saturating_add(self.turn_overhead))
    }
}

/// Arc-wrapped token counter for easy sharing.
pub type SharedTokenCounter = Arc<dyn TokenCounter>;
