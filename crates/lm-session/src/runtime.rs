//! Session factory and registry over a shared backing model.
//!
//! The runtime resolves availability (driving a download when needed),
//! seeds the history store from the configuration's initial turns, and
//! hands out `Ready` sessions. The backing engine is reference-counted
//! across sessions; each session's state is exclusively its own.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use lm_core::budget::{
    HeuristicTokenCounter, ModelLimitsRegistry, SharedTokenCounter, TokenBudget, TokenCounter,
};
use lm_core::config::SessionConfig;
use lm_core::events::SessionEvent;
use lm_core::history::HistoryStore;
use lm_core::types::Turn;

use crate::download::{Availability, DownloadError, ModelDownloader};
use crate::engine::{InferenceEngine, ModelParams};
use crate::error::SessionError;
use crate::lifecycle::{Lifecycle, LifecycleEvent, SessionState};
use crate::session::Session;

/// Options for an individual create call.
#[derive(Default)]
pub struct CreateOptions {
    /// Abort signal for the creation itself. Cancelling before the session
    /// is ready rejects the create with `Aborted`.
    pub cancel: CancellationToken,
    /// Receives download progress while the model is being fetched.
    pub monitor: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl CreateOptions {
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Self::default()
        }
    }

    pub fn with_monitor(monitor: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            monitor: Some(monitor),
            ..Self::default()
        }
    }
}

/// Entry point owning the engine, downloader, token counter, and limits
/// registry, plus the destroy tokens of every session it created.
pub struct ModelRuntime {
    engine: Arc<dyn InferenceEngine>,
    downloader: Arc<dyn ModelDownloader>,
    counter: SharedTokenCounter,
    limits: ModelLimitsRegistry,
    sessions: DashMap<Uuid, CancellationToken>,
}

impl ModelRuntime {
    pub fn new(engine: Arc<dyn InferenceEngine>, downloader: Arc<dyn ModelDownloader>) -> Self {
        Self {
            engine,
            downloader,
            counter: Arc::new(HeuristicTokenCounter::with_defaults()),
            limits: ModelLimitsRegistry::new(),
            sessions: DashMap::new(),
        }
    }

    /// Swap in a different token counter (e.g. one backed by the engine's
    /// real tokenizer).
    pub fn with_counter(mut self, counter: SharedTokenCounter) -> Self {
        self.counter = counter;
        self
    }

    pub fn with_limits(mut self, limits: ModelLimitsRegistry) -> Self {
        self.limits = limits;
        self
    }

    /// Capabilities and sampling ranges of the backing model.
    pub fn params(&self) -> ModelParams {
        self.engine.params()
    }

    /// Availability of the backing model for a configuration.
    pub async fn availability(&self, config: &SessionConfig) -> Availability {
        self.downloader.availability(config).await
    }

    /// Sessions created here whose destroy token is still live.
    pub fn active_sessions(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| !entry.value().is_cancelled())
            .count()
    }

    /// Destroy every session created by this runtime.
    pub fn shutdown(&self) {
        for entry in self.sessions.iter() {
            entry.value().cancel();
        }
        self.sessions.clear();
        log::info!("Runtime shut down; all sessions destroyed");
    }

    pub async fn create_session(&self, config: SessionConfig) -> Result<Session, SessionError> {
        self.create_session_with(config, CreateOptions::default())
            .await
    }

    /// Create a session, resolving availability and driving a model
    /// download when required.
    ///
    /// Validation errors are returned before any lifecycle transition. A
    /// download failure is retryable: nothing is latched, and a later
    /// create call will attempt the download again.
    pub async fn create_session_with(
        &self,
        config: SessionConfig,
        options: CreateOptions,
    ) -> Result<Session, SessionError> {
        config.validate()?;

        let params = self.engine.params();
        for kind in &config.expected_inputs {
            if !params.supports_input(*kind) {
                return Err(SessionError::Unsupported(format!(
                    "expected input kind {kind:?} is not supported by {}",
                    params.model_id
                )));
            }
        }
        for tag in &config.expected_languages {
            if !params.supports_language(tag) {
                return Err(SessionError::Unsupported(format!(
                    "expected language {tag:?} is not supported by {}",
                    params.model_id
                )));
            }
        }
        let sampling = params.resolve_sampling(&config.sampling)?;

        let session_id = Uuid::new_v4();
        let mut lifecycle = Lifecycle::new(session_id);

        if options.cancel.is_cancelled() {
            lifecycle.handle_event(LifecycleEvent::DestroyRequested);
            return Err(SessionError::Aborted);
        }

        let availability = self.downloader.availability(&config).await;
        lifecycle.handle_event(LifecycleEvent::AvailabilityResolved(availability));

        match lifecycle.state().clone() {
            SessionState::CreationFailed { reason } => {
                return Err(SessionError::Unsupported(reason));
            }
            SessionState::Downloading { .. } => {
                self.run_download(&config, &mut lifecycle, &options).await?;
            }
            _ => {}
        }

        if options.cancel.is_cancelled() {
            // Destroyed before ready: the creation promise is rejected.
            lifecycle.handle_event(LifecycleEvent::DestroyRequested);
            return Err(SessionError::Aborted);
        }

        if lifecycle.state() != &SessionState::Ready {
            return Err(SessionError::Unsupported(
                "model did not become ready".to_string(),
            ));
        }

        let budget = match config.max_tokens {
            Some(max_tokens) => TokenBudget::new(max_tokens),
            None => self.limits.budget_for_model(&params.model_id),
        };
        let history = seed_history(&config, self.counter.as_ref(), &budget)?;

        let destroy_token = CancellationToken::new();
        self.sessions.insert(session_id, destroy_token.clone());

        let session = Session::assemble(
            session_id,
            config,
            sampling,
            budget,
            Arc::clone(&self.counter),
            Arc::clone(&self.engine),
            history,
            lifecycle,
            destroy_token,
        );
        log::info!(
            "[{}] Session created (budget {} tokens)",
            session_id,
            session.max_tokens()
        );
        Ok(session)
    }

    async fn run_download(
        &self,
        config: &SessionConfig,
        lifecycle: &mut Lifecycle,
        options: &CreateOptions,
    ) -> Result<(), SessionError> {
        let (progress_tx, mut progress_rx) = mpsc::channel(16);
        let downloader = Arc::clone(&self.downloader);
        let download_config = config.clone();
        let cancel = options.cancel.child_token();
        let mut download = tokio::spawn(async move {
            downloader.download(&download_config, progress_tx, cancel).await
        });

        let mut progress_done = false;
        let result = loop {
            tokio::select! {
                update = progress_rx.recv(), if !progress_done => match update {
                    Some(progress) => {
                        lifecycle.handle_event(LifecycleEvent::DownloadProgressed {
                            received: progress.received,
                            total: progress.total,
                        });
                        if let Some(monitor) = &options.monitor {
                            let _ = monitor.send(SessionEvent::DownloadProgress {
                                received: progress.received,
                                total: progress.total,
                            });
                        }
                    }
                    None => progress_done = true,
                },
                finished = &mut download => break finished,
            }
        };

        match result {
            Ok(Ok(())) => {
                // Forward progress that raced the completion.
                while let Ok(progress) = progress_rx.try_recv() {
                    if let Some(monitor) = &options.monitor {
                        let _ = monitor.send(SessionEvent::DownloadProgress {
                            received: progress.received,
                            total: progress.total,
                        });
                    }
                }
                lifecycle.handle_event(LifecycleEvent::DownloadCompleted);
                Ok(())
            }
            Ok(Err(DownloadError::Cancelled)) => {
                lifecycle.handle_event(LifecycleEvent::DestroyRequested);
                Err(SessionError::Aborted)
            }
            Ok(Err(DownloadError::Network(message))) => {
                lifecycle.handle_event(LifecycleEvent::DownloadFailed {
                    reason: message.clone(),
                });
                Err(SessionError::NetworkFailure(message))
            }
            Err(join_error) => {
                let reason = format!("download task failed: {join_error}");
                lifecycle.handle_event(LifecycleEvent::DownloadFailed {
                    reason: reason.clone(),
                });
                Err(SessionError::NetworkFailure(reason))
            }
        }
    }
}

/// Seed a history store from the configuration's initial turns, pinning
/// the system turn when present. Fails with `QuotaExceeded` when the seed
/// alone cannot fit the budget.
fn seed_history(
    config: &SessionConfig,
    counter: &dyn TokenCounter,
    budget: &TokenBudget,
) -> Result<HistoryStore, SessionError> {
    let mut specs = config.initial_turns.iter();
    let mut history = match config.system_spec() {
        Some(system) => {
            let tokens = counter.count_spec(system)?;
            let turn = Turn::from_spec(system.clone(), tokens);
            specs.next();
            HistoryStore::with_system(turn)
                .map_err(|e| SessionError::InvalidConfiguration(e.to_string()))?
        }
        None => HistoryStore::new(),
    };

    for spec in specs {
        let tokens = counter.count_spec(spec)?;
        history
            .append(Turn::from_spec(spec.clone(), tokens))
            .map_err(|e| SessionError::InvalidConfiguration(e.to_string()))?;
    }

    if history.tokens_consumed() > budget.max_tokens {
        return Err(SessionError::QuotaExceeded {
            needed: history.tokens_consumed(),
            available: budget.max_tokens,
        });
    }
    Ok(history)
}
