//! The session aggregate: one conversational context bound to a
//! configuration, exclusively owning its history store, token budget,
//! event bus, and request queue. The backing engine is shared across
//! sessions behind an `Arc` and reclaimed when the last session drops it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use lm_core::budget::{SharedTokenCounter, TokenBudget};
use lm_core::config::SessionConfig;
use lm_core::events::{EventBus, EventSubscription, SessionEvent};
use lm_core::history::{HistorySnapshot, HistoryStore};
use lm_core::types::{Role, Turn, TurnSpec};

use crate::engine::{InferenceEngine, ResolvedSampling};
use crate::error::SessionError;
use crate::lifecycle::{Lifecycle, LifecycleEvent, SessionState};
use crate::queue::{
    spawn_worker, PhaseCell, PromptHandle, QueuedRequest, RequestMode, QUEUE_DEPTH,
};

const CHUNK_BUFFER: usize = 32;

/// State shared between a session handle and its queue worker.
pub(crate) struct SessionInner {
    pub(crate) id: Uuid,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) config: SessionConfig,
    pub(crate) sampling: ResolvedSampling,
    pub(crate) budget: TokenBudget,
    pub(crate) counter: SharedTokenCounter,
    pub(crate) engine: Arc<dyn InferenceEngine>,
    pub(crate) history: tokio::sync::Mutex<HistoryStore>,
    pub(crate) lifecycle: std::sync::Mutex<Lifecycle>,
    pub(crate) events: EventBus,
    /// Cancelled exactly once, on destruction; request tokens are children
    /// of this one.
    pub(crate) destroy_token: CancellationToken,
    /// Mirror of the store's consumption for lock-free accessors.
    pub(crate) tokens_consumed: AtomicU32,
}

impl SessionInner {
    pub(crate) fn publish_consumed(&self, history: &HistoryStore) {
        self.tokens_consumed
            .store(history.tokens_consumed(), Ordering::Relaxed);
    }

    fn lock_lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One conversational context. Not `Clone`: a session exclusively owns its
/// state; use [`Session::try_clone`] to branch the conversation.
pub struct Session {
    inner: Arc<SessionInner>,
    queue_tx: mpsc::Sender<QueuedRequest>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        id: Uuid,
        config: SessionConfig,
        sampling: ResolvedSampling,
        budget: TokenBudget,
        counter: SharedTokenCounter,
        engine: Arc<dyn InferenceEngine>,
        history: HistoryStore,
        lifecycle: Lifecycle,
        destroy_token: CancellationToken,
    ) -> Self {
        let consumed = history.tokens_consumed();
        let inner = Arc::new(SessionInner {
            id,
            created_at: Utc::now(),
            config,
            sampling,
            budget,
            counter,
            engine,
            history: tokio::sync::Mutex::new(history),
            lifecycle: std::sync::Mutex::new(lifecycle),
            events: EventBus::new(),
            destroy_token,
            tokens_consumed: AtomicU32::new(consumed),
        });

        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_DEPTH);
        let _worker = spawn_worker(Arc::clone(&inner), queue_rx);

        Self { inner, queue_tx }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock_lifecycle().state().clone()
    }

    pub fn sampling(&self) -> ResolvedSampling {
        self.inner.sampling
    }

    /// The session's fixed token budget.
    pub fn max_tokens(&self) -> u32 {
        self.inner.budget.max_tokens
    }

    /// Tokens consumed by committed, non-evicted turns (the pinned system
    /// turn included).
    pub fn tokens_so_far(&self) -> u32 {
        self.inner.tokens_consumed.load(Ordering::Relaxed)
    }

    pub fn tokens_left(&self) -> u32 {
        self.inner.budget.remaining(self.tokens_so_far())
    }

    /// Observe overflow/destruction signals for this session.
    pub fn subscribe(&self) -> EventSubscription {
        self.inner.events.subscribe()
    }

    /// Read-only view of the committed history.
    pub async fn history(&self) -> HistorySnapshot {
        self.inner.history.lock().await.snapshot()
    }

    /// Submit a prompt and await the committed response turn.
    pub async fn prompt(&self, input: Vec<TurnSpec>) -> Result<Arc<Turn>, SessionError> {
        self.submit(input).await?.wait().await
    }

    /// Convenience for a single text prompt.
    pub async fn prompt_text(
        &self,
        text: impl Into<String>,
    ) -> Result<Arc<Turn>, SessionError> {
        self.prompt(vec![TurnSpec::user(text)]).await
    }

    /// Submit a prompt, returning a handle for awaiting or cancelling it.
    pub async fn submit(&self, input: Vec<TurnSpec>) -> Result<PromptHandle, SessionError> {
        self.submit_with_mode(input, RequestMode::Complete).await
    }

    /// Submit a prompt whose response is streamed chunk by chunk. The
    /// handle still settles with the fully assembled, committed turn.
    pub async fn prompt_streaming(
        &self,
        input: Vec<TurnSpec>,
    ) -> Result<(PromptHandle, ReceiverStream<String>), SessionError> {
        let (chunks_tx, chunks_rx) = mpsc::channel(CHUNK_BUFFER);
        let handle = self
            .submit_with_mode(input, RequestMode::Streaming { chunks: chunks_tx })
            .await?;
        Ok((handle, ReceiverStream::new(chunks_rx)))
    }

    /// Count what a prompt would consume, control-token overhead included,
    /// without touching the queue or history.
    pub fn count_prompt_tokens(&self, input: &[TurnSpec]) -> Result<u32, SessionError> {
        self.ensure_ready()?;
        self.validate_input(input)?;
        Ok(self.inner.counter.count_specs(input)?)
    }

    /// Branch the conversation: a new `Ready` session with a copy of the
    /// committed history at this moment, the same configuration and
    /// budget, and a fresh queue. Later turns on either session are
    /// invisible to the other.
    pub async fn try_clone(&self) -> Result<Session, SessionError> {
        self.try_clone_with_signal(CancellationToken::new()).await
    }

    /// Abortable clone. An abort observed before completion leaves both
    /// the source and the would-be clone untouched.
    pub async fn try_clone_with_signal(
        &self,
        cancel: CancellationToken,
    ) -> Result<Session, SessionError> {
        self.ensure_ready()?;
        if cancel.is_cancelled() {
            return Err(SessionError::Aborted);
        }

        let history = self.inner.history.lock().await.fork();

        if cancel.is_cancelled() {
            return Err(SessionError::Aborted);
        }

        let id = Uuid::new_v4();
        let clone = Session::assemble(
            id,
            self.inner.config.clone(),
            self.inner.sampling,
            self.inner.budget,
            Arc::clone(&self.inner.counter),
            Arc::clone(&self.inner.engine),
            history,
            Lifecycle::ready(id),
            CancellationToken::new(),
        );
        log::info!("[{}] Cloned into session {}", self.inner.id, id);
        Ok(clone)
    }

    /// Destroy the session. Idempotent. All queued and in-flight requests
    /// are rejected, observers get one `Destroyed` event, and the history
    /// store is released with the worker.
    pub fn destroy(&self) {
        {
            let mut lifecycle = self.inner.lock_lifecycle();
            if matches!(lifecycle.state(), SessionState::Destroyed) {
                return;
            }
            lifecycle.handle_event(LifecycleEvent::DestroyRequested);
        }
        self.inner.destroy_token.cancel();
        self.inner.events.emit(SessionEvent::Destroyed);
        log::info!("[{}] Session destroyed", self.inner.id);
    }

    fn ensure_ready(&self) -> Result<(), SessionError> {
        if self.inner.destroy_token.is_cancelled() {
            return Err(SessionError::Destroyed);
        }
        match self.inner.lock_lifecycle().state() {
            SessionState::Ready => Ok(()),
            _ => Err(SessionError::Destroyed),
        }
    }

    /// Synchronous input validation, before any side effect: no system
    /// turns in prompt input, and only content kinds the session was
    /// configured to expect.
    fn validate_input(&self, input: &[TurnSpec]) -> Result<(), SessionError> {
        for spec in input {
            if spec.role == Role::System {
                return Err(SessionError::InvalidConfiguration(
                    "prompt input may not contain a system turn".to_string(),
                ));
            }
            if spec.is_empty() {
                return Err(SessionError::InvalidConfiguration(
                    "prompt turn has no content".to_string(),
                ));
            }
            for part in &spec.parts {
                let kind = part.kind();
                if !self.inner.config.expected_inputs.contains(&kind) {
                    return Err(SessionError::Unsupported(format!(
                        "input kind {kind:?} was not declared in the session's expected inputs"
                    )));
                }
            }
        }
        Ok(())
    }

    fn count_input(
        &self,
        input: Vec<TurnSpec>,
    ) -> Result<(Vec<Arc<Turn>>, u32), SessionError> {
        let mut turns = Vec::with_capacity(input.len());
        let mut total = 0u32;
        for spec in input {
            let tokens = self.inner.counter.count_spec(&spec)?;
            total = total.saturating_add(tokens);
            turns.push(Arc::new(Turn::from_spec(spec, tokens)));
        }
        Ok((turns, total))
    }

    async fn submit_with_mode(
        &self,
        input: Vec<TurnSpec>,
        mode: RequestMode,
    ) -> Result<PromptHandle, SessionError> {
        self.ensure_ready()?;
        self.validate_input(&input)?;
        let (turns, needed_tokens) = self.count_input(input)?;

        let id = Uuid::new_v4();
        let phase = Arc::new(PhaseCell::new());
        let cancel = self.inner.destroy_token.child_token();
        let (result_tx, result_rx) = oneshot::channel();

        let request = QueuedRequest {
            id,
            input: turns,
            needed_tokens,
            mode,
            cancel: cancel.clone(),
            phase: Arc::clone(&phase),
            result_tx,
        };
        self.queue_tx
            .send(request)
            .await
            .map_err(|_| SessionError::Destroyed)?;
        log::debug!(
            "[{}] Queued request {} ({} tokens)",
            self.inner.id,
            id,
            needed_tokens
        );

        Ok(PromptHandle::new(id, phase, cancel, result_rx))
    }
}
