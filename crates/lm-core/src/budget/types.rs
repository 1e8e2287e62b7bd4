//! Core types for session token budget tracking.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::InputKind;

/// Token budget for one session. The budget is fixed at session creation
/// and never changes for the session's lifetime; a clone inherits the same
/// budget value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenBudget {
    pub max_tokens: u32,
}

impl TokenBudget {
    pub fn new(max_tokens: u32) -> Self {
        Self { max_tokens }
    }

    /// Tokens still available given the current consumption.
    pub fn remaining(&self, consumed: u32) -> u32 {
        self.max_tokens.saturating_sub(consumed)
    }

    /// Whether `needed` more tokens fit on top of `consumed`.
    pub fn fits(&self, consumed: u32, needed: u32) -> bool {
        needed <= self.remaining(consumed)
    }
}

/// Errors raised by token accounting and overflow resolution.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BudgetError {
    /// Content of this kind reached a counter that cannot tokenize it.
    /// Upstream input validation should have rejected it already; the
    /// counter refuses rather than miscounting.
    #[error("content of kind {kind:?} cannot be tokenized by this counter")]
    UntokenizableContent { kind: InputKind },

    /// A prompt cannot fit even after evicting every evictable turn.
    /// `available` is the best the session could offer (current remaining
    /// plus everything eviction could free).
    #[error("prompt needs {needed} tokens but at most {available} can be made available")]
    QuotaExceeded { needed: u32, available: u32 },
}
