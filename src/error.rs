use thiserror::Error;

/// Main error type for localmind
#[derive(Error, Debug)]
pub enum LocalmindError {
    #[error("Network error: {0}\n\nTroubleshooting:\n- Check internet connection\n- Verify the Hugging Face Hub is reachable\n- Retry the download, it resumes from a clean state")]
    Transport(String),

    #[error("Malformed response: {0}")]
    Decode(String),

    /// Expected outcome of a cancelled download or generation, never shown as a failure
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Storage error: {0}\n\nTroubleshooting:\n- Check permissions on the models directory\n- Ensure sufficient free disk space\n- Run with RUST_LOG=debug for more details")]
    Storage(String),

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Config error: {0}\n\nTroubleshooting:\n- Check config file: ~/.config/localmind/config.toml\n- Remove the file to fall back to defaults\n- Run with RUST_LOG=debug for more details")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid model identifier '{0}', expected organization/name")]
    InvalidIdentifier(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Inference-specific errors
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Model loading error: {0}\n\nTroubleshooting:\n- Is the inference server running? Check inference.endpoint in config\n- Verify the model finished downloading: localmind list\n- Try a smaller model")]
    ModelLoad(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("No model loaded. Pick an installed model first: localmind chat <id>")]
    NotLoaded,
}

impl LocalmindError {
    /// Whether this is the cancellation signal rather than a failure
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, LocalmindError>;
