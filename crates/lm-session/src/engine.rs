//! Interface to the out-of-scope inference engine.
//!
//! The session core never runs inference itself: it hands the engine a
//! read-only history snapshot plus the new input turns, and commits the
//! response it gets back. Engines observe cancellation cooperatively via
//! the request's token.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use lm_core::config::SamplingParams;
use lm_core::history::HistorySnapshot;
use lm_core::types::{InputKind, Turn, TurnSpec};

use crate::error::SessionError;

/// Capabilities and sampling ranges reported by the backing model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelParams {
    pub model_id: String,
    pub default_temperature: f32,
    pub max_temperature: f32,
    pub default_top_k: u32,
    pub max_top_k: u32,
    pub supported_inputs: Vec<InputKind>,
    /// BCP-47 tags the model was trained for.
    pub supported_languages: Vec<String>,
}

impl ModelParams {
    pub fn supports_input(&self, kind: InputKind) -> bool {
        self.supported_inputs.contains(&kind)
    }

    /// Language support check by exact tag or primary subtag ("en" covers
    /// "en-US" and vice versa).
    pub fn supports_language(&self, tag: &str) -> bool {
        let primary = primary_subtag(tag);
        self.supported_languages
            .iter()
            .any(|s| s == tag || primary_subtag(s) == primary)
    }

    /// Resolve requested sampling overrides against this model's ranges.
    /// Structural pairing was already validated by the configuration; this
    /// enforces the value ranges.
    pub fn resolve_sampling(
        &self,
        requested: &SamplingParams,
    ) -> Result<ResolvedSampling, SessionError> {
        match (requested.temperature, requested.top_k) {
            (None, None) => Ok(ResolvedSampling {
                temperature: self.default_temperature,
                top_k: self.default_top_k,
            }),
            (Some(temperature), Some(top_k)) => {
                if !(0.0..=self.max_temperature).contains(&temperature) {
                    return Err(SessionError::InvalidConfiguration(format!(
                        "temperature {temperature} is outside 0.0..={}",
                        self.max_temperature
                    )));
                }
                if top_k == 0 || top_k > self.max_top_k {
                    return Err(SessionError::InvalidConfiguration(format!(
                        "top_k {top_k} is outside 1..={}",
                        self.max_top_k
                    )));
                }
                Ok(ResolvedSampling { temperature, top_k })
            }
            _ => Err(SessionError::InvalidConfiguration(
                "temperature and top_k must be specified together".to_string(),
            )),
        }
    }
}

fn primary_subtag(tag: &str) -> &str {
    tag.split('-').next().unwrap_or(tag)
}

/// Sampling parameters after defaulting and range checks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResolvedSampling {
    pub temperature: f32,
    pub top_k: u32,
}

/// One inference call: the session's committed history (pinned system turn
/// included) plus the not-yet-committed input turns.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub session_id: Uuid,
    pub history: HistorySnapshot,
    pub input: Vec<Arc<Turn>>,
    pub sampling: ResolvedSampling,
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine observed the cancellation token and stopped. This is the
    /// acknowledgment the request queue waits for.
    #[error("inference was cancelled")]
    Cancelled,

    #[error("inference backend failure: {0}")]
    Backend(String),
}

#[async_trait]
pub trait InferenceEngine: Send + Sync {
    fn params(&self) -> ModelParams;

    /// Produce one assistant response for the request.
    async fn invoke(
        &self,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> Result<TurnSpec, EngineError>;

    /// Streaming variant: forward chunks over `chunks` as they are
    /// produced, returning the fully assembled response at the end.
    async fn invoke_streaming(
        &self,
        request: InferenceRequest,
        chunks: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<TurnSpec, EngineError>;
}
