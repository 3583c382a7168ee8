pub mod openai;
pub mod tokenizer;

use crate::config::schema::GenerationConfig;
use crate::error::Result;
use crate::models::InstalledModel;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use openai::OpenAiEngine;
pub use tokenizer::PromptCounter;

/// Author of a chat turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

/// One role/content pair of the history handed to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Item of a generation stream
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    /// Incremental text, concatenated in arrival order
    Chunk(String),
    /// Terminal completion record with engine-measured throughput
    Info { tokens_per_second: f64 },
}

impl GenerationEvent {
    #[must_use]
    pub fn chunk(text: impl Into<String>) -> Self {
        Self::Chunk(text.into())
    }

    #[must_use]
    pub const fn is_completion(&self) -> bool {
        matches!(self, Self::Info { .. })
    }
}

/// Sampling parameters for one generation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParameters {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl From<&GenerationConfig> for GenerationParameters {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
        }
    }
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self::from(&GenerationConfig::default())
    }
}

/// Chat history ready for generation, with its measured prompt size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedInput {
    pub messages: Vec<ChatTurn>,
    pub prompt_tokens: usize,
}

/// Lazy stream of generation events, consumed once
pub type EventStream = BoxStream<'static, Result<GenerationEvent>>;

/// Opaque capability turning a chat history into a stream of text
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Make `model` the target of subsequent generations
    async fn load(&self, model: &InstalledModel) -> Result<()>;

    /// Measure and package the history for generation
    async fn prepare(&self, history: &[ChatTurn]) -> Result<PreparedInput>;

    /// Start generating. Dropping the stream abandons the generation.
    async fn generate(
        &self,
        input: PreparedInput,
        parameters: &GenerationParameters,
    ) -> Result<EventStream>;

    /// Engine name for logging
    fn engine_name(&self) -> &str;
}
