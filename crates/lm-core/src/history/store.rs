//! Ordered conversation history with front-eviction and token accounting.

use std::sync::Arc;

use thiserror::Error;

use crate::types::{Role, Turn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HistoryError {
    /// No evictable turn remains (history is empty apart from the pinned
    /// system turn).
    #[error("no evictable turn remains")]
    Empty,

    /// A system turn may only be installed as the first turn at creation.
    #[error("a system turn must be pinned at creation, not appended")]
    MisplacedSystemTurn,
}

/// Ordered log of a session's committed turns plus derived token
/// accounting.
///
/// Invariants:
/// - at most one system turn, always at index 0, always pinned;
/// - append-only at the back; eviction only removes the oldest non-pinned
///   turn;
/// - `tokens_consumed` equals the sum of `token_count` over retained turns
///   (the pinned system turn included).
#[derive(Debug, Default)]
pub struct HistoryStore {
    turns: Vec<Arc<Turn>>,
    tokens_consumed: u32,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with a pinned system turn at index 0.
    pub fn with_system(system: Turn) -> Result<Self, HistoryError> {
        if system.role != Role::System || !system.pinned {
            return Err(HistoryError::MisplacedSystemTurn);
        }
        let tokens_consumed = system.token_count;
        Ok(Self {
            turns: vec![Arc::new(system)],
            tokens_consumed,
        })
    }

    /// Append a committed turn, charging its tokens. System turns are
    /// rejected here: the pinned turn is installed only at creation.
    pub fn append(&mut self, turn: Turn) -> Result<Arc<Turn>, HistoryError> {
        self.append_arc(Arc::new(turn))
    }

    /// Append an already-shared turn (e.g. prompt input carried through the
    /// request queue).
    pub fn append_arc(&mut self, turn: Arc<Turn>) -> Result<Arc<Turn>, HistoryError> {
        if turn.role == Role::System {
            return Err(HistoryError::MisplacedSystemTurn);
        }
        self.tokens_consumed = self.tokens_consumed.saturating_add(turn.token_count);
        self.turns.push(Arc::clone(&turn));
        Ok(turn)
    }

    /// Remove and return the oldest non-pinned turn, refunding its tokens.
    pub fn evict_oldest(&mut self) -> Result<Arc<Turn>, HistoryError> {
        let start = self.evictable_start();
        if start >= self.turns.len() {
            return Err(HistoryError::Empty);
        }
        let removed = self.turns.remove(start);
        self.tokens_consumed = self.tokens_consumed.saturating_sub(removed.token_count);
        tracing::debug!(
            turn_id = %removed.id,
            tokens_freed = removed.token_count,
            "Evicted oldest turn"
        );
        Ok(removed)
    }

    /// Read-only, restartable view of the current history. Cheap to take
    /// and to clone; iterating never mutates the store. The pinned system
    /// turn is always included.
    pub fn snapshot(&self) -> HistorySnapshot {
        HistorySnapshot {
            turns: self.turns.clone().into(),
        }
    }

    /// Rebuild an independent store holding the same committed turns.
    /// Turn data is shared immutably; ordering and accounting are copied,
    /// so later mutations of either store are invisible to the other.
    pub fn fork(&self) -> HistoryStore {
        HistoryStore {
            turns: self.turns.clone(),
            tokens_consumed: self.tokens_consumed,
        }
    }

    pub fn tokens_consumed(&self) -> u32 {
        self.tokens_consumed
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// The pinned system turn, if one was installed.
    pub fn system_turn(&self) -> Option<&Arc<Turn>> {
        self.turns.first().filter(|t| t.pinned)
    }

    /// The eviction candidates, oldest first.
    pub fn evictable(&self) -> &[Arc<Turn>] {
        &self.turns[self.evictable_start()..]
    }

    pub fn evictable_len(&self) -> usize {
        self.turns.len() - self.evictable_start()
    }

    fn evictable_start(&self) -> usize {
        usize::from(self.system_turn().is_some())
    }
}

/// Read-only copy of a history at one point in time.
///
/// Backed by shared turn data; restartable (iterate as often as needed)
/// and cheap to clone across tasks.
#[derive(Debug, Clone)]
pub struct HistorySnapshot {
    turns: Arc<[Arc<Turn>]>,
}

impl HistorySnapshot {
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Turn>> {
        self.turns.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Turn>> {
        self.turns.get(index)
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn system_turn(&self) -> Option<&Arc<Turn>> {
        self.turns.first().filter(|t| t.pinned)
    }

    /// Turn ids in order, used to compare snapshots by identity.
    pub fn turn_ids(&self) -> Vec<uuid::Uuid> {
        self.turns.iter().map(|t| t.id).collect()
    }
}
