//! Session configuration and its structural validation.
//!
//! Validation here is purely structural (shape of the initial prompts,
//! sampling override pairing). Capability checks against the backing model
//! happen in the session layer before any lifecycle transition.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{InputKind, Role, TurnSpec};

/// Sampling overrides requested for a session. Both knobs must be supplied
/// together or not at all; the backing model provides defaults otherwise.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SamplingParams {
    pub temperature: Option<f32>,
    pub top_k: Option<u32>,
}

impl SamplingParams {
    pub fn new(temperature: f32, top_k: u32) -> Self {
        Self {
            temperature: Some(temperature),
            top_k: Some(top_k),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("a system turn must be the first initial turn")]
    MisplacedSystemTurn,

    #[error("at most one system turn is allowed")]
    MultipleSystemTurns,

    #[error("temperature and top_k must be specified together")]
    PartialSamplingOverride,

    #[error("initial turn {index} has no content")]
    EmptyInitialTurn { index: usize },
}

/// Configuration a session is created with. Immutable for the session's
/// lifetime; cloning a session copies it verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Conversation seed. An optional system turn first, then any number of
    /// user/assistant turns (e.g. few-shot examples).
    pub initial_turns: Vec<TurnSpec>,
    pub sampling: SamplingParams,
    /// Content kinds the caller intends to prompt with.
    pub expected_inputs: Vec<InputKind>,
    /// BCP-47 tags the caller intends to prompt in.
    pub expected_languages: Vec<String>,
    /// Session token budget override. When absent the budget is resolved
    /// from the backing model's context window.
    pub max_tokens: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_turns: Vec::new(),
            sampling: SamplingParams::default(),
            expected_inputs: vec![InputKind::Text],
            expected_languages: Vec::new(),
            max_tokens: None,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_prompt(mut self, text: impl Into<String>) -> Self {
        self.initial_turns.insert(0, TurnSpec::system(text));
        self
    }

    pub fn with_initial_turns(mut self, turns: Vec<TurnSpec>) -> Self {
        self.initial_turns = turns;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_expected_inputs(mut self, kinds: Vec<InputKind>) -> Self {
        self.expected_inputs = kinds;
        self
    }

    pub fn with_expected_languages(mut self, tags: Vec<String>) -> Self {
        self.expected_languages = tags;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// The system turn spec, if the configuration carries one.
    pub fn system_spec(&self) -> Option<&TurnSpec> {
        self.initial_turns
            .first()
            .filter(|spec| spec.role == Role::System)
    }

    /// Structural validation, run synchronously before any state transition.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut system_turns = 0usize;
        for (index, spec) in self.initial_turns.iter().enumerate() {
            if spec.is_empty() {
                return Err(ConfigError::EmptyInitialTurn { index });
            }
            if spec.role == Role::System {
                system_turns += 1;
                if index != 0 {
                    return Err(ConfigError::MisplacedSystemTurn);
                }
            }
        }
        if system_turns > 1 {
            return Err(ConfigError::MultipleSystemTurns);
        }

        if self.sampling.temperature.is_some() != self.sampling.top_k.is_some() {
            return Err(ConfigError::PartialSamplingOverride);
        }

        Ok(())
    }
}
