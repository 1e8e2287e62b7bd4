//! Context overflow resolution: evict oldest exchanges until a new prompt
//! fits, or fail without touching history.
//!
//! Planning is separated from mutation. [`plan_evictions`] is a pure dry
//! run over the store's evictable turns; [`ensure_fits`] commits the plan
//! only when the prompt fits, so a `QuotaExceeded` failure leaves history
//! byte-for-byte identical.

use std::ops::Range;
use std::sync::Arc;

use crate::budget::types::{BudgetError, TokenBudget};
use crate::history::store::HistoryStore;
use crate::types::{Role, Turn};

/// A committed eviction sequence: how many turns to remove from the front
/// of the evictable region, and how many tokens that frees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionPlan {
    pub turns: usize,
    pub tokens_freed: u32,
}

impl EvictionPlan {
    fn none() -> Self {
        Self {
            turns: 0,
            tokens_freed: 0,
        }
    }
}

/// Outcome of a dry-run fit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FitOutcome {
    /// The prompt fits once the planned evictions are applied (the plan may
    /// be empty).
    Fits(EvictionPlan),
    /// Even evicting everything evictable leaves the prompt short by
    /// `shortfall` tokens.
    Exhausted { shortfall: u32 },
}

/// What [`ensure_fits`] actually did.
#[derive(Debug)]
pub struct FitReport {
    /// Turns removed from history, oldest first.
    pub evicted: Vec<Arc<Turn>>,
    pub tokens_freed: u32,
}

impl FitReport {
    /// True when at least one turn was evicted; the session emits a single
    /// overflow signal per `ensure_fits` call in that case.
    pub fn overflowed(&self) -> bool {
        !self.evicted.is_empty()
    }
}

/// Dry-run eviction planning over the evictable region of a history.
///
/// Eviction always removes whole exchanges (a user turn plus the assistant
/// turns answering it), never a prompt without its paired response.
pub fn plan_evictions(evictable: &[Arc<Turn>], needed: u32, remaining: u32) -> FitOutcome {
    if needed <= remaining {
        return FitOutcome::Fits(EvictionPlan::none());
    }

    let mut freed = 0u32;
    let mut turns = 0usize;
    for span in exchange_spans(evictable) {
        for turn in &evictable[span.clone()] {
            freed = freed.saturating_add(turn.token_count);
        }
        turns = span.end;

        if needed <= remaining.saturating_add(freed) {
            return FitOutcome::Fits(EvictionPlan {
                turns,
                tokens_freed: freed,
            });
        }
    }

    FitOutcome::Exhausted {
        shortfall: needed - remaining.saturating_add(freed),
    }
}

/// Make room for `needed` tokens, evicting oldest exchanges as necessary.
///
/// On success the planned evictions (possibly none) are committed and
/// reported. On failure nothing is evicted and the error carries the best
/// availability the session could have offered.
pub fn ensure_fits(
    needed: u32,
    store: &mut HistoryStore,
    budget: &TokenBudget,
) -> Result<FitReport, BudgetError> {
    let remaining = budget.remaining(store.tokens_consumed());

    match plan_evictions(store.evictable(), needed, remaining) {
        FitOutcome::Fits(plan) => {
            let mut evicted = Vec::with_capacity(plan.turns);
            for _ in 0..plan.turns {
                match store.evict_oldest() {
                    Ok(turn) => evicted.push(turn),
                    // The plan never exceeds the evictable count.
                    Err(_) => break,
                }
            }
            if !evicted.is_empty() {
                tracing::warn!(
                    evicted_turns = evicted.len(),
                    tokens_freed = plan.tokens_freed,
                    needed,
                    "Context overflow: evicted oldest exchanges"
                );
            }
            Ok(FitReport {
                evicted,
                tokens_freed: plan.tokens_freed,
            })
        }
        FitOutcome::Exhausted { .. } => {
            let evictable_tokens: u32 = store
                .evictable()
                .iter()
                .map(|t| t.token_count)
                .fold(0u32, |acc, x| acc.saturating_add(x));
            Err(BudgetError::QuotaExceeded {
                needed,
                available: remaining.saturating_add(evictable_tokens),
            })
        }
    }
}

/// Group evictable turns into exchanges: each span starts at a user turn
/// and runs until the next user turn. Leading assistant turns (whose user
/// turn is already gone) attach to the first span.
fn exchange_spans(turns: &[Arc<Turn>]) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    if turns.is_empty() {
        return spans;
    }

    let mut start = 0usize;
    for (i, turn) in turns.iter().enumerate().skip(1) {
        if turn.role == Role::User {
            spans.push(start..i);
            start = i;
        }
    }
    spans.push(start..turns.len());
    spans
}
