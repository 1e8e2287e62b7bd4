//! Shared stub engine and downloader for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use lm_core::config::SessionConfig;
use lm_core::types::{InputKind, TurnSpec};
use lm_session::{
    Availability, DownloadError, DownloadProgress, EngineError, InferenceEngine,
    InferenceRequest, ModelDownloader, ModelParams, ModelRuntime,
};

pub fn text_params() -> ModelParams {
    ModelParams {
        model_id: "gemma-3n".to_string(),
        default_temperature: 0.7,
        max_temperature: 2.0,
        default_top_k: 3,
        max_top_k: 128,
        supported_inputs: vec![InputKind::Text],
        supported_languages: vec!["en".to_string()],
    }
}

/// Engine stub with scripted replies and an optional gate that holds each
/// invocation until the test releases a permit.
pub struct StubEngine {
    params: ModelParams,
    default_reply: String,
    scripted: Mutex<VecDeque<String>>,
    gate: Option<Arc<Semaphore>>,
    invocations: AtomicUsize,
}

impl StubEngine {
    pub fn replying(reply: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            params: text_params(),
            default_reply: reply.into(),
            scripted: Mutex::new(VecDeque::new()),
            gate: None,
            invocations: AtomicUsize::new(0),
        })
    }

    /// Gated stub: every invocation blocks until [`StubEngine::release`]
    /// grants it a permit (or its request is cancelled).
    pub fn gated(reply: impl Into<String>) -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let engine = Arc::new(Self {
            params: text_params(),
            default_reply: reply.into(),
            scripted: Mutex::new(VecDeque::new()),
            gate: Some(Arc::clone(&gate)),
            invocations: AtomicUsize::new(0),
        });
        (engine, gate)
    }

    /// Queue replies consumed in order before falling back to the default.
    pub fn script(&self, replies: &[&str]) {
        let mut scripted = self.scripted.lock().expect("scripted lock");
        scripted.extend(replies.iter().map(|r| r.to_string()));
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> String {
        self.scripted
            .lock()
            .expect("scripted lock")
            .pop_front()
            .unwrap_or_else(|| self.default_reply.clone())
    }

    async fn pass_gate(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        if let Some(gate) = &self.gate {
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                permit = gate.acquire() => {
                    permit
                        .map_err(|_| EngineError::Backend("gate closed".to_string()))?
                        .forget();
                }
            }
        } else if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait]
impl InferenceEngine for StubEngine {
    fn params(&self) -> ModelParams {
        self.params.clone()
    }

    async fn invoke(
        &self,
        _request: InferenceRequest,
        cancel: CancellationToken,
    ) -> Result<TurnSpec, EngineError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.pass_gate(&cancel).await?;
        Ok(TurnSpec::assistant(self.next_reply()))
    }

    async fn invoke_streaming(
        &self,
        _request: InferenceRequest,
        chunks: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<TurnSpec, EngineError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.pass_gate(&cancel).await?;
        let reply = self.next_reply();
        let mid = reply.len() / 2;
        let (head, tail) = reply.split_at(mid);
        let _ = chunks.send(head.to_string()).await;
        let _ = chunks.send(tail.to_string()).await;
        Ok(TurnSpec::assistant(reply))
    }
}

enum DownloadScript {
    AlreadyAvailable,
    Succeeds { updates: Vec<DownloadProgress> },
    FailsThenSucceeds { message: String },
    Unavailable,
}

/// Downloader stub covering the availability vocabulary.
pub struct StubDownloader {
    script: DownloadScript,
    attempts: AtomicUsize,
}

impl StubDownloader {
    pub fn available() -> Arc<Self> {
        Arc::new(Self {
            script: DownloadScript::AlreadyAvailable,
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn downloadable(updates: Vec<DownloadProgress>) -> Arc<Self> {
        Arc::new(Self {
            script: DownloadScript::Succeeds { updates },
            attempts: AtomicUsize::new(0),
        })
    }

    /// First download attempt fails with a network error; later attempts
    /// succeed.
    pub fn flaky(message: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            script: DownloadScript::FailsThenSucceeds {
                message: message.into(),
            },
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            script: DownloadScript::Unavailable,
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelDownloader for StubDownloader {
    async fn availability(&self, _config: &SessionConfig) -> Availability {
        match &self.script {
            DownloadScript::AlreadyAvailable => Availability::Available,
            DownloadScript::Unavailable => Availability::Unavailable,
            _ => Availability::Downloadable,
        }
    }

    async fn download(
        &self,
        _config: &SessionConfig,
        progress: mpsc::Sender<DownloadProgress>,
        cancel: CancellationToken,
    ) -> Result<(), DownloadError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            DownloadScript::AlreadyAvailable => Ok(()),
            DownloadScript::Unavailable => {
                Err(DownloadError::Network("model is not served".to_string()))
            }
            DownloadScript::FailsThenSucceeds { message } => {
                if attempt == 0 {
                    Err(DownloadError::Network(message.clone()))
                } else {
                    Ok(())
                }
            }
            DownloadScript::Succeeds { updates } => {
                for update in updates {
                    if cancel.is_cancelled() {
                        return Err(DownloadError::Cancelled);
                    }
                    let _ = progress.send(*update).await;
                }
                if cancel.is_cancelled() {
                    return Err(DownloadError::Cancelled);
                }
                Ok(())
            }
        }
    }
}

/// Runtime over an already-available model.
pub fn runtime_with(engine: Arc<StubEngine>) -> ModelRuntime {
    ModelRuntime::new(engine, StubDownloader::available())
}

/// A character-per-token counter with no margin or overhead, so tests can
/// reason about exact token numbers.
pub fn unit_counter() -> lm_core::budget::SharedTokenCounter {
    Arc::new(lm_core::budget::HeuristicTokenCounter::new(1.0, 1.0, 0))
}
