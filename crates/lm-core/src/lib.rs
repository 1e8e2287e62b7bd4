pub mod budget;
pub mod config;
pub mod events;
pub mod history;
pub mod types;

pub use budget::{
    BudgetError, HeuristicTokenCounter, ModelLimit, ModelLimitsRegistry, SharedTokenCounter,
    TokenBudget, TokenCounter,
};
pub use config::{ConfigError, SamplingParams, SessionConfig};
pub use events::{EventBus, EventSubscription, SessionEvent};
pub use history::{
    ensure_fits, plan_evictions, EvictionPlan, FitOutcome, FitReport, HistoryError,
    HistorySnapshot, HistoryStore,
};
pub use types::{ContentPart, InputKind, MediaRef, Role, Turn, TurnSpec};
