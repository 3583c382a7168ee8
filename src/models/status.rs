use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-model status tracked by the inventory.
///
/// A cancelled download has no status: its entry is removed instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModelStatus {
    /// Listed by the catalog, not present locally
    Available,
    /// Transfer in flight, fractional progress in `0.0..=1.0`
    Downloading(f64),
    Installed,
    /// Last transfer failed; retryable
    Error(String),
}

impl ModelStatus {
    #[must_use]
    pub const fn is_installed(&self) -> bool {
        matches!(self, Self::Installed)
    }

    #[must_use]
    pub const fn is_downloading(&self) -> bool {
        matches!(self, Self::Downloading(_))
    }

    /// Download progress, if downloading
    #[must_use]
    pub const fn progress(&self) -> Option<f64> {
        match self {
            Self::Downloading(progress) => Some(*progress),
            _ => None,
        }
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::Downloading(progress) => write!(f, "downloading {:.0}%", progress * 100.0),
            Self::Installed => write!(f, "installed"),
            Self::Error(message) => write!(f, "error: {message}"),
        }
    }
}
