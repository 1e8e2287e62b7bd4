//! Interface to the out-of-scope model download manager.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lm_core::config::SessionConfig;

/// Whether the backing model can serve a configuration right now.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    /// Usable immediately.
    Available,
    /// Usable after a download the runtime may start.
    Downloadable,
    /// A download is already in flight.
    Downloading,
    /// The configuration can never be satisfied.
    Unavailable,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadProgress {
    pub received: u64,
    /// Total size when the download manager knows it up front.
    pub total: Option<u64>,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    /// Retryable: a failed download never latches availability to
    /// `Unavailable`; a later create attempt may download again.
    #[error("network failure: {0}")]
    Network(String),

    #[error("download was cancelled")]
    Cancelled,
}

#[async_trait]
pub trait ModelDownloader: Send + Sync {
    /// Availability of the backing model for this configuration.
    async fn availability(&self, config: &SessionConfig) -> Availability;

    /// Fetch the model, reporting progress over `progress` until the
    /// terminal result. Must observe `cancel` cooperatively.
    async fn download(
        &self,
        config: &SessionConfig,
        progress: mpsc::Sender<DownloadProgress>,
        cancel: CancellationToken,
    ) -> Result<(), DownloadError>;
}
