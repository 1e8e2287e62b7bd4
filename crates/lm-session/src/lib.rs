//! Session lifecycle and request execution for an on-device language
//! model.
//!
//! [`ModelRuntime`] creates sessions against a shared backing model,
//! awaiting a download when the model is not yet on disk. Each
//! [`Session`] owns its conversation history and token budget, serializes
//! its prompts through a per-session queue, evicts oldest exchanges when a
//! prompt would overflow the context, and supports streaming, cloning,
//! cancellation, and destruction.

pub mod download;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod queue;
pub mod runtime;
pub mod session;

pub use download::{Availability, DownloadError, DownloadProgress, ModelDownloader};
pub use engine::{
    EngineError, InferenceEngine, InferenceRequest, ModelParams, ResolvedSampling,
};
pub use error::SessionError;
pub use lifecycle::{Lifecycle, LifecycleEvent, SessionState};
pub use queue::{CancelOutcome, PromptHandle, RequestCanceller, RequestPhase};
pub use runtime::{CreateOptions, ModelRuntime};
pub use session::Session;
