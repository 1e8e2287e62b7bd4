//! Per-session request queue and cancellation layer.
//!
//! Each session owns one worker task fed by an mpsc channel; requests are
//! dispatched to the inference engine one at a time per session, so
//! conversational ordering is preserved while independent sessions run
//! concurrently.
//!
//! Cancellation is three-way and race-free via an atomic request phase:
//! a queued request is skipped before dispatch with no history mutation,
//! an in-flight request is rejected once the engine acknowledges the
//! token, and a completed request is untouched. Input and response turns
//! are committed together after the engine returns, so no half-committed
//! exchange can ever appear in history.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use lm_core::events::SessionEvent;
use lm_core::history::ensure_fits;
use lm_core::types::{Turn, TurnSpec};

use crate::engine::{EngineError, InferenceRequest};
use crate::error::SessionError;
use crate::session::SessionInner;

pub(crate) const QUEUE_DEPTH: usize = 64;

/// Where a request is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestPhase {
    Queued = 0,
    Dispatched = 1,
    /// Cancel was signalled while the engine was running; awaiting
    /// acknowledgment.
    CancelRequested = 2,
    Completed = 3,
    Cancelled = 4,
    Failed = 5,
}

fn phase_from_u8(value: u8) -> RequestPhase {
    match value {
        0 => RequestPhase::Queued,
        1 => RequestPhase::Dispatched,
        2 => RequestPhase::CancelRequested,
        3 => RequestPhase::Completed,
        4 => RequestPhase::Cancelled,
        _ => RequestPhase::Failed,
    }
}

/// Atomic phase cell shared between a request's handle and the worker.
/// Terminal phases are only ever written by the worker; cancellation uses
/// compare-and-swap so the three-way policy cannot race.
#[derive(Debug)]
pub(crate) struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(RequestPhase::Queued as u8))
    }

    pub(crate) fn load(&self) -> RequestPhase {
        phase_from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn transition(&self, from: RequestPhase, to: RequestPhase) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn store(&self, phase: RequestPhase) {
        self.0.store(phase as u8, Ordering::Release);
    }
}

/// What a cancellation call achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The request was still queued; it will be skipped with no side
    /// effects.
    Cancelled,
    /// The request was in flight; the engine has been signalled and the
    /// result will be rejected on acknowledgment.
    CancelRequested,
    /// The request already settled (or cancellation was already in
    /// progress); nothing changes.
    AlreadyFinished,
}

pub(crate) fn signal_cancel(phase: &PhaseCell, token: &CancellationToken) -> CancelOutcome {
    if phase.transition(RequestPhase::Queued, RequestPhase::Cancelled) {
        token.cancel();
        CancelOutcome::Cancelled
    } else if phase.transition(RequestPhase::Dispatched, RequestPhase::CancelRequested) {
        token.cancel();
        CancelOutcome::CancelRequested
    } else {
        CancelOutcome::AlreadyFinished
    }
}

pub(crate) enum RequestMode {
    Complete,
    Streaming { chunks: mpsc::Sender<String> },
}

/// One queued prompt call, owned by the queue until it settles.
pub(crate) struct QueuedRequest {
    pub(crate) id: Uuid,
    /// Input turns, counted but not yet committed to history.
    pub(crate) input: Vec<Arc<Turn>>,
    pub(crate) needed_tokens: u32,
    pub(crate) mode: RequestMode,
    pub(crate) cancel: CancellationToken,
    pub(crate) phase: Arc<PhaseCell>,
    pub(crate) result_tx: oneshot::Sender<Result<Arc<Turn>, SessionError>>,
}

/// Caller's end of a submitted prompt.
#[derive(Debug)]
pub struct PromptHandle {
    id: Uuid,
    phase: Arc<PhaseCell>,
    cancel: CancellationToken,
    result_rx: oneshot::Receiver<Result<Arc<Turn>, SessionError>>,
}

impl PromptHandle {
    pub(crate) fn new(
        id: Uuid,
        phase: Arc<PhaseCell>,
        cancel: CancellationToken,
        result_rx: oneshot::Receiver<Result<Arc<Turn>, SessionError>>,
    ) -> Self {
        Self {
            id,
            phase,
            cancel,
            result_rx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> RequestPhase {
        self.phase.load()
    }

    /// Request cancellation. Queued requests are removed with no side
    /// effects; in-flight requests reject on engine acknowledgment;
    /// settled requests are left alone.
    pub fn cancel(&self) -> CancelOutcome {
        signal_cancel(&self.phase, &self.cancel)
    }

    /// A clonable cancel-only view, usable while `wait` consumes the
    /// handle.
    pub fn canceller(&self) -> RequestCanceller {
        RequestCanceller {
            id: self.id,
            phase: Arc::clone(&self.phase),
            cancel: self.cancel.clone(),
        }
    }

    /// Await the settled result.
    pub async fn wait(self) -> Result<Arc<Turn>, SessionError> {
        match self.result_rx.await {
            Ok(result) => result,
            // The worker is gone without settling: the session was
            // destroyed.
            Err(_) => Err(SessionError::Destroyed),
        }
    }
}

/// Cancel-only view of a pending request.
#[derive(Clone)]
pub struct RequestCanceller {
    id: Uuid,
    phase: Arc<PhaseCell>,
    cancel: CancellationToken,
}

impl RequestCanceller {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> RequestPhase {
        self.phase.load()
    }

    pub fn cancel(&self) -> CancelOutcome {
        signal_cancel(&self.phase, &self.cancel)
    }
}

/// Spawn the session's worker task. The worker exits when the session is
/// destroyed or the last `Session` handle is dropped, rejecting whatever
/// is left in the queue.
pub(crate) fn spawn_worker(
    inner: Arc<SessionInner>,
    mut rx: mpsc::Receiver<QueuedRequest>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let request = tokio::select! {
                biased;
                _ = inner.destroy_token.cancelled() => break,
                next = rx.recv() => match next {
                    Some(request) => request,
                    None => break,
                },
            };
            process_request(&inner, request).await;
        }

        // Reject everything still queued, each exactly once.
        rx.close();
        while let Ok(request) = rx.try_recv() {
            request.phase.store(RequestPhase::Cancelled);
            let _ = request.result_tx.send(Err(SessionError::Destroyed));
        }
        log::debug!("[{}] Request worker stopped", inner.id);
    })
}

async fn process_request(inner: &SessionInner, request: QueuedRequest) {
    let QueuedRequest {
        id,
        input,
        needed_tokens,
        mode,
        cancel,
        phase,
        result_tx,
    } = request;

    if !phase.transition(RequestPhase::Queued, RequestPhase::Dispatched) {
        // Cancelled while queued: skipped, queue order of the rest is
        // untouched and history never saw it.
        log::debug!("[{}] Request {} cancelled before dispatch", inner.id, id);
        let _ = result_tx.send(Err(SessionError::Aborted));
        return;
    }

    if cancel.is_cancelled() {
        phase.store(RequestPhase::Cancelled);
        let _ = result_tx.send(Err(rejection_for(inner)));
        return;
    }

    // Make room for the input before dispatch, evicting oldest exchanges
    // if necessary. A failed fit rejects only this request.
    let snapshot = {
        let mut history = inner.history.lock().await;
        match ensure_fits(needed_tokens, &mut history, &inner.budget) {
            Ok(report) => {
                inner.publish_consumed(&history);
                if report.overflowed() {
                    inner.events.emit(SessionEvent::ContextOverflow {
                        evicted_turns: report.evicted.len(),
                        tokens_freed: report.tokens_freed,
                    });
                }
                history.snapshot()
            }
            Err(err) => {
                phase.store(RequestPhase::Failed);
                let _ = result_tx.send(Err(err.into()));
                return;
            }
        }
    };

    let engine_request = InferenceRequest {
        session_id: inner.id,
        history: snapshot,
        input: input.clone(),
        sampling: inner.sampling,
    };

    let engine_result = match &mode {
        RequestMode::Complete => inner.engine.invoke(engine_request, cancel.clone()).await,
        RequestMode::Streaming { chunks } => {
            inner
                .engine
                .invoke_streaming(engine_request, chunks.clone(), cancel.clone())
                .await
        }
    };

    match engine_result {
        Ok(response) => {
            if !phase.transition(RequestPhase::Dispatched, RequestPhase::Completed) {
                // Cancel arrived while the engine was finishing: this is
                // the acknowledgment point, and nothing gets committed.
                phase.store(RequestPhase::Cancelled);
                let _ = result_tx.send(Err(rejection_for(inner)));
                return;
            }
            match commit_exchange(inner, &input, response, needed_tokens).await {
                Ok(turn) => {
                    let _ = result_tx.send(Ok(turn));
                }
                Err(err) => {
                    phase.store(RequestPhase::Failed);
                    let _ = result_tx.send(Err(err));
                }
            }
        }
        Err(EngineError::Cancelled) => {
            phase.store(RequestPhase::Cancelled);
            let _ = result_tx.send(Err(rejection_for(inner)));
        }
        Err(EngineError::Backend(message)) => {
            log::error!("[{}] Request {} failed in the engine: {}", inner.id, id, message);
            phase.store(RequestPhase::Failed);
            let _ = result_tx.send(Err(SessionError::Backend(message)));
        }
    }
}

/// Destroy outranks a plain abort when both raced the same request.
fn rejection_for(inner: &SessionInner) -> SessionError {
    if inner.destroy_token.is_cancelled() {
        SessionError::Destroyed
    } else {
        SessionError::Aborted
    }
}

/// Commit the prompt/response exchange atomically. A second fit pass
/// covers the response tokens so `tokens_consumed <= max_tokens` holds
/// after this commit too.
async fn commit_exchange(
    inner: &SessionInner,
    input: &[Arc<Turn>],
    response: TurnSpec,
    input_tokens: u32,
) -> Result<Arc<Turn>, SessionError> {
    let response_tokens = inner.counter.count_spec(&response)?;
    let response_turn = Turn::from_spec(response, response_tokens);

    let mut history = inner.history.lock().await;
    let report = ensure_fits(
        input_tokens.saturating_add(response_tokens),
        &mut history,
        &inner.budget,
    )?;
    if report.overflowed() {
        inner.events.emit(SessionEvent::ContextOverflow {
            evicted_turns: report.evicted.len(),
            tokens_freed: report.tokens_freed,
        });
    }

    for turn in input {
        history
            .append_arc(Arc::clone(turn))
            .map_err(|e| SessionError::InvalidConfiguration(e.to_string()))?;
    }
    let committed = history
        .append(response_turn)
        .map_err(|e| SessionError::InvalidConfiguration(e.to_string()))?;
    inner.publish_consumed(&history);
    Ok(committed)
}
