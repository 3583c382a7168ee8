pub mod hub;
pub mod orchestrator;

use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::mpsc;

pub use hub::HubTransfer;
pub use orchestrator::DownloadOrchestrator;

/// Moves a model's files from the remote hub into local storage.
///
/// Implementations clean up after themselves when the returned future is dropped,
/// which is how the orchestrator abandons a cancelled transfer.
#[async_trait]
pub trait ModelTransfer: Send + Sync {
    /// Fetch every file of `model_id` matching `file_patterns` and return the final local path
    async fn fetch(
        &self,
        model_id: &str,
        file_patterns: &[String],
        progress: ProgressReporter,
    ) -> Result<PathBuf>;
}

/// Sender half of a transfer's fractional progress stream
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<f64>,
}

impl ProgressReporter {
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<f64>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report completion in `0.0..=1.0`; out of range values are clamped
    pub fn report(&self, fraction: f64) {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        // Receiver gone means the download was abandoned
        let _ = self.tx.send(fraction);
    }
}

/// Change notification published by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum DownloadEvent {
    #[serde(rename_all = "camelCase")]
    Started { model_id: String },
    #[serde(rename_all = "camelCase")]
    Progress { model_id: String, progress: f64 },
    #[serde(rename_all = "camelCase")]
    Installed { model_id: String, path: PathBuf },
    #[serde(rename_all = "camelCase")]
    Failed { model_id: String, error: String },
    #[serde(rename_all = "camelCase")]
    Cancelled { model_id: String },
    #[serde(rename_all = "camelCase")]
    Deleted { model_id: String },
    Reconciled { installed: usize },
}

impl DownloadEvent {
    /// Identifier the event refers to, if any
    #[must_use]
    pub fn model_id(&self) -> Option<&str> {
        match self {
            Self::Started { model_id }
            | Self::Progress { model_id, .. }
            | Self::Installed { model_id, .. }
            | Self::Failed { model_id, .. }
            | Self::Cancelled { model_id }
            | Self::Deleted { model_id } => Some(model_id),
            Self::Reconciled { .. } => None,
        }
    }

    /// Whether this event ends a download's lifecycle
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Installed { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }
}

/// Format bytes as human-readable string
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
