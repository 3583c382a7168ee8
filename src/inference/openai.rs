use crate::config::schema::InferenceConfig;
use crate::error::{InferenceError, LocalmindError, Result};
use crate::inference::{
    ChatTurn, EventStream, GenerationEvent, GenerationParameters, InferenceEngine, PreparedInput,
    PromptCounter, Role,
};
use crate::models::InstalledModel;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Engine backed by a local OpenAI-compatible chat completions server
pub struct OpenAiEngine {
    client: reqwest::Client,
    /// Bounds whole requests that are not streamed
    request_timeout: Duration,
    endpoint: String,
    system_prompt: Option<String>,
    loaded: Mutex<Option<LoadedModel>>,
}

#[derive(Clone)]
struct LoadedModel {
    name: String,
    counter: Arc<PromptCounter>,
}

impl std::fmt::Debug for OpenAiEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEngine")
            .field("client", &"Client { ... }")
            .field("endpoint", &self.endpoint)
            .field("model", &self.loaded_model_name())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

impl OpenAiEngine {
    /// Create new engine from config
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        let request_timeout = Duration::from_secs(config.timeout_secs);
        // A client-wide timeout would also cut off long completion streams
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| LocalmindError::Transport(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            request_timeout,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            system_prompt: config.system_prompt.clone(),
            loaded: Mutex::new(None),
        })
    }

    /// Name sent as `model` in requests, if a model is loaded
    #[must_use]
    pub fn loaded_model_name(&self) -> Option<String> {
        self.current().map(|m| m.name)
    }

    fn current(&self) -> Option<LoadedModel> {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn with_system_prompt(&self, history: &[ChatTurn]) -> Vec<ChatTurn> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            if !history.iter().any(|t| t.role == Role::System) {
                messages.push(ChatTurn::new(Role::System, prompt.clone()));
            }
        }
        messages.extend_from_slice(history);
        messages
    }
}

#[async_trait]
impl InferenceEngine for OpenAiEngine {
    async fn load(&self, model: &InstalledModel) -> Result<()> {
        if !model.status().is_installed() {
            return Err(InferenceError::ModelLoad(format!(
                "'{}' is not installed ({})",
                model.id(),
                model.status()
            ))
            .into());
        }

        let url = format!("{}/models", self.endpoint);
        let response = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| {
                InferenceError::ModelLoad(format!("Inference server unreachable at {url}: {e}"))
            })?;
        if !response.status().is_success() {
            return Err(InferenceError::ModelLoad(format!(
                "Inference server returned {} for {url}",
                response.status()
            ))
            .into());
        }

        let model_dir = model.path().to_path_buf();
        let counter = tokio::task::spawn_blocking(move || PromptCounter::from_model_dir(&model_dir))
            .await
            .map_err(|e| InferenceError::ModelLoad(format!("Tokenizer task failed: {e}")))??;

        let loaded = LoadedModel {
            name: model.path().to_string_lossy().into_owned(),
            counter: Arc::new(counter),
        };
        tracing::info!(
            "Loaded {} (tokenizer: {})",
            model.id(),
            if loaded.counter.has_tokenizer() { "yes" } else { "estimated" }
        );
        *self.loaded.lock().unwrap_or_else(PoisonError::into_inner) = Some(loaded);
        Ok(())
    }

    async fn prepare(&self, history: &[ChatTurn]) -> Result<PreparedInput> {
        let model = self.current().ok_or(InferenceError::NotLoaded)?;
        let messages = self.with_system_prompt(history);
        let prompt_tokens = model.counter.count(&messages);

        Ok(PreparedInput {
            messages,
            prompt_tokens,
        })
    }

    async fn generate(
        &self,
        input: PreparedInput,
        parameters: &GenerationParameters,
    ) -> Result<EventStream> {
        let model = self.current().ok_or(InferenceError::NotLoaded)?;

        let body = serde_json::json!({
            "model": model.name,
            "messages": input.messages,
            "temperature": parameters.temperature,
            "top_p": parameters.top_p,
            "max_tokens": parameters.max_tokens,
            "stream": true,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::Generation(format!("Request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Generation(format!(
                "Server error ({status}): {error_body}"
            ))
            .into());
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();

        Ok(sse_events(body))
    }

    fn engine_name(&self) -> &str {
        "openai-compatible"
    }
}

type ByteStream = BoxStream<'static, reqwest::Result<Vec<u8>>>;

/// Incremental decoder for a `text/event-stream` completion body
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    pending: VecDeque<Result<GenerationEvent>>,
    first_text: Option<Instant>,
    text_events: usize,
    finished: bool,
}

impl SseDecoder {
    fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if self.finished {
                continue;
            }
            let line = String::from_utf8_lossy(&line);
            self.line(line.trim_end_matches(['\r', '\n']));
        }
    }

    fn line(&mut self, line: &str) {
        let Some(payload) = line.strip_prefix("data:") else {
            // Comments, event names and blank separators
            return;
        };
        let payload = payload.trim();

        if payload == "[DONE]" {
            self.finish();
            return;
        }

        match serde_json::from_str::<CompletionChunk>(payload) {
            Ok(CompletionChunk {
                error: Some(error), ..
            }) => {
                self.pending
                    .push_back(Err(InferenceError::Generation(error.to_string()).into()));
                self.finished = true;
            }
            Ok(chunk) => {
                let text: String = chunk
                    .choices
                    .into_iter()
                    .filter_map(|c| c.delta.content)
                    .collect();
                if !text.is_empty() {
                    self.first_text.get_or_insert_with(Instant::now);
                    self.text_events += 1;
                    self.pending.push_back(Ok(GenerationEvent::Chunk(text)));
                }
            }
            Err(e) => {
                self.pending.push_back(Err(LocalmindError::Decode(format!(
                    "Malformed completion chunk: {e}"
                ))));
                self.finished = true;
            }
        }
    }

    /// Queue the completion record once
    #[allow(clippy::cast_precision_loss)]
    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let elapsed = self
            .first_text
            .map_or(0.0, |first| first.elapsed().as_secs_f64());
        let tokens_per_second = if elapsed > 0.0 {
            self.text_events as f64 / elapsed
        } else {
            0.0
        };
        self.pending
            .push_back(Ok(GenerationEvent::Info { tokens_per_second }));
    }
}

fn sse_events(body: ByteStream) -> EventStream {
    stream::unfold(
        (body, SseDecoder::default()),
        |(mut body, mut decoder)| async move {
            loop {
                if let Some(event) = decoder.pending.pop_front() {
                    return Some((event, (body, decoder)));
                }
                if decoder.finished {
                    return None;
                }
                match body.next().await {
                    Some(Ok(bytes)) => decoder.feed(&bytes),
                    Some(Err(e)) => {
                        decoder.finished = true;
                        let error = InferenceError::Generation(format!("Stream interrupted: {e}"));
                        return Some((Err(error.into()), (body, decoder)));
                    }
                    // Server closed without [DONE]
                    None => decoder.finish(),
                }
            }
        },
    )
    .boxed()
}
