//! Conversation history: the ordered turn store and the overflow resolver
//! that keeps it within a session's token budget.

pub mod overflow;
pub mod store;

pub use overflow::{ensure_fits, plan_evictions, EvictionPlan, FitOutcome, FitReport};
pub use store::{HistoryError, HistorySnapshot, HistoryStore};
