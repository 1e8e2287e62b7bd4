//! Session lifecycle state machine.
//!
//! A session moves `pending_availability → (downloading) → ready` and ends
//! in `destroyed`; creation can branch off to the terminal
//! `creation_failed`. Prompt handling is deliberately not modelled here:
//! the session stays `ready` while the request queue serializes any number
//! of concurrent prompts.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::download::Availability;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    /// Entry state: model availability is being resolved.
    PendingAvailability,

    /// The backing model is being fetched; progress is forwarded to any
    /// registered monitor.
    Downloading { received: u64, total: Option<u64> },

    /// The session accepts prompt, clone, token-count, and destroy calls.
    Ready,

    /// Creation can never complete (unsatisfiable configuration, or a
    /// download failure — the latter is retryable with a new create call).
    CreationFailed { reason: String },

    /// Terminal. Reachable from every non-terminal state.
    Destroyed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::CreationFailed { .. } | Self::Destroyed)
    }
}

/// Events that drive lifecycle transitions.
#[derive(Debug)]
pub enum LifecycleEvent {
    AvailabilityResolved(Availability),
    DownloadProgressed { received: u64, total: Option<u64> },
    DownloadCompleted,
    DownloadFailed { reason: String },
    DestroyRequested,
}

/// Per-session state machine in the shape of a `(state, event)` transition
/// table; events that do not apply to the current state leave it unchanged.
#[derive(Debug)]
pub struct Lifecycle {
    session_id: Uuid,
    state: SessionState,
}

impl Lifecycle {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            state: SessionState::PendingAvailability,
        }
    }

    /// A machine already in `Ready`, used when cloning an existing session.
    pub(crate) fn ready(session_id: Uuid) -> Self {
        Self {
            session_id,
            state: SessionState::Ready,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Handle an event and transition to the next state.
    pub fn handle_event(&mut self, event: LifecycleEvent) -> &SessionState {
        let old_state = self.state.clone();
        let new_state = match (&self.state, event) {
            (SessionState::PendingAvailability, LifecycleEvent::AvailabilityResolved(a)) => {
                match a {
                    Availability::Available => SessionState::Ready,
                    Availability::Downloadable | Availability::Downloading => {
                        SessionState::Downloading {
                            received: 0,
                            total: None,
                        }
                    }
                    Availability::Unavailable => SessionState::CreationFailed {
                        reason: "model is unavailable for the requested configuration"
                            .to_string(),
                    },
                }
            }

            (
                SessionState::Downloading { .. },
                LifecycleEvent::DownloadProgressed { received, total },
            ) => SessionState::Downloading { received, total },

            (SessionState::Downloading { .. }, LifecycleEvent::DownloadCompleted) => {
                SessionState::Ready
            }

            (
                SessionState::PendingAvailability | SessionState::Downloading { .. },
                LifecycleEvent::DownloadFailed { reason },
            ) => SessionState::CreationFailed { reason },

            (state, LifecycleEvent::DestroyRequested) if !state.is_terminal() => {
                SessionState::Destroyed
            }

            // Default: remain in the current state if the event is not
            // applicable (terminal states absorb everything).
            _ => {
                tracing::debug!(
                    session_id = %self.session_id,
                    current_state = ?self.state,
                    "Lifecycle: event does not trigger state change"
                );
                self.state.clone()
            }
        };

        if old_state != new_state {
            tracing::info!(
                session_id = %self.session_id,
                old_state = ?old_state,
                new_state = ?new_state,
                "Lifecycle: state transition"
            );
        }

        self.state = new_state;
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> Lifecycle {
        Lifecycle::new(Uuid::new_v4())
    }

    #[test]
    fn available_model_goes_straight_to_ready() {
        let mut lifecycle = machine();
        lifecycle.handle_event(LifecycleEvent::AvailabilityResolved(Availability::Available));
        assert_eq!(lifecycle.state(), &SessionState::Ready);
    }

    #[test]
    fn downloadable_model_passes_through_downloading() {
        let mut lifecycle = machine();
        lifecycle.handle_event(LifecycleEvent::AvailabilityResolved(
            Availability::Downloadable,
        ));
        assert!(matches!(
            lifecycle.state(),
            SessionState::Downloading { received: 0, .. }
        ));

        lifecycle.handle_event(LifecycleEvent::DownloadProgressed {
            received: 512,
            total: Some(2048),
        });
        assert_eq!(
            lifecycle.state(),
            &SessionState::Downloading {
                received: 512,
                total: Some(2048),
            }
        );

        lifecycle.handle_event(LifecycleEvent::DownloadCompleted);
        assert_eq!(lifecycle.state(), &SessionState::Ready);
    }

    #[test]
    fn unavailable_model_fails_creation() {
        let mut lifecycle = machine();
        lifecycle.handle_event(LifecycleEvent::AvailabilityResolved(
            Availability::Unavailable,
        ));
        assert!(matches!(
            lifecycle.state(),
            SessionState::CreationFailed { .. }
        ));
        assert!(lifecycle.state().is_terminal());
    }

    #[test]
    fn download_failure_fails_creation_with_reason() {
        let mut lifecycle = machine();
        lifecycle.handle_event(LifecycleEvent::AvailabilityResolved(
            Availability::Downloadable,
        ));
        lifecycle.handle_event(LifecycleEvent::DownloadFailed {
            reason: "connection reset".to_string(),
        });
        assert_eq!(
            lifecycle.state(),
            &SessionState::CreationFailed {
                reason: "connection reset".to_string(),
            }
        );
    }

    #[test]
    fn destroy_is_reachable_from_every_non_terminal_state() {
        let mut pending = machine();
        pending.handle_event(LifecycleEvent::DestroyRequested);
        assert_eq!(pending.state(), &SessionState::Destroyed);

        let mut downloading = machine();
        downloading.handle_event(LifecycleEvent::AvailabilityResolved(
            Availability::Downloadable,
        ));
        downloading.handle_event(LifecycleEvent::DestroyRequested);
        assert_eq!(downloading.state(), &SessionState::Destroyed);

        let mut ready = machine();
        ready.handle_event(LifecycleEvent::AvailabilityResolved(Availability::Available));
        ready.handle_event(LifecycleEvent::DestroyRequested);
        assert_eq!(ready.state(), &SessionState::Destroyed);
    }

    #[test]
    fn terminal_states_absorb_events() {
        let mut lifecycle = machine();
        lifecycle.handle_event(LifecycleEvent::AvailabilityResolved(
            Availability::Unavailable,
        ));
        let failed = lifecycle.state().clone();

        lifecycle.handle_event(LifecycleEvent::DownloadCompleted);
        lifecycle.handle_event(LifecycleEvent::DestroyRequested);
        assert_eq!(lifecycle.state(), &failed);
    }

    #[test]
    fn inapplicable_events_leave_state_unchanged() {
        let mut lifecycle = machine();
        lifecycle.handle_event(LifecycleEvent::DownloadCompleted);
        assert_eq!(lifecycle.state(), &SessionState::PendingAvailability);
    }
}
