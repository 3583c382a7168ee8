//! One chat conversation against an inference engine.
//!
//! At most one generation runs per session. The generation task owns the metrics while it
//! runs and commits partial output in throttled batches, checking cancellation under the
//! state lock before every commit.

pub mod batcher;
pub mod metrics;
pub mod transcript;

use crate::config::schema::GenerationConfig;
use crate::error::{InferenceError, LocalmindError, Result};
use crate::inference::{ChatTurn, GenerationEvent, GenerationParameters, InferenceEngine, Role};
use crate::models::InstalledModel;
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub use batcher::{Flush, FlushBatcher};
pub use metrics::{resident_memory_bytes, BenchmarkMetrics};
pub use transcript::{ChatMessage, Transcript};

const EVENT_CAPACITY: usize = 256;

/// Change notification published by a session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SessionEvent {
    Started,
    /// Full assistant text so far
    Updated { content: String },
    Finished,
    Stopped,
    Failed { error: String },
}

impl SessionEvent {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Stopped | Self::Failed { .. })
    }
}

struct ActiveGeneration {
    id: u64,
    cancel_token: CancellationToken,
}

#[derive(Default)]
struct State {
    transcript: Transcript,
    metrics: BenchmarkMetrics,
    input: String,
    generating: bool,
    active: Option<ActiveGeneration>,
    loaded_model: Option<String>,
    load_error: Option<String>,
}

impl State {
    /// Whether generation `id` may still write
    fn owns(&self, id: u64, cancel: &CancellationToken) -> bool {
        !cancel.is_cancelled() && self.active.as_ref().is_some_and(|a| a.id == id)
    }
}

struct Shared {
    state: Mutex<State>,
    engine: Arc<dyn InferenceEngine>,
    parameters: GenerationParameters,
    flush_interval: Duration,
    events: broadcast::Sender<SessionEvent>,
    next_generation: AtomicU64,
}

/// Result of a generation that ran to the end of its stream
struct Completion {
    prompt_tokens: usize,
    completion_tokens: usize,
    total_time: Duration,
    resident_memory_bytes: Option<u64>,
}

/// How a generation task exited
enum Outcome {
    Completed(Completion),
    Cancelled,
}

/// Streaming chat session
#[derive(Clone)]
pub struct ChatSession {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("engine", &self.shared.engine.engine_name())
            .field("generating", &self.is_generating())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Apply one flushed batch. Returns `false` once the generation no longer owns the session.
    fn commit(
        &self,
        id: u64,
        cancel: &CancellationToken,
        index: usize,
        accumulated: &mut String,
        flush: Flush,
        elapsed: Duration,
    ) -> bool {
        let content = {
            let mut state = self.lock();
            if !state.owns(id, cancel) {
                return false;
            }

            if let Some(tokens_per_second) = flush.tokens_per_second {
                state.metrics.tokens_per_second = tokens_per_second;
            }

            if flush.text.is_empty() {
                return true;
            }

            accumulated.push_str(&flush.text);
            state.transcript.replace_content(index, accumulated.clone());
            if state.metrics.time_to_first_token.is_none() {
                state.metrics.time_to_first_token = Some(elapsed);
                tracing::debug!("First token after {} ms", elapsed.as_millis());
            }
            accumulated.clone()
        };

        self.emit(SessionEvent::Updated { content });
        true
    }

    fn finish(&self, id: u64, cancel: &CancellationToken, index: usize, outcome: Result<Outcome>) {
        let event = {
            let mut state = self.lock();
            if !state.active.as_ref().is_some_and(|a| a.id == id) {
                // stop() already released the session
                return;
            }
            state.active = None;
            state.generating = false;

            match outcome {
                _ if cancel.is_cancelled() => SessionEvent::Stopped,
                Ok(Outcome::Cancelled) | Err(LocalmindError::Cancelled) => SessionEvent::Stopped,
                Ok(Outcome::Completed(completion)) => {
                    state.metrics.prompt_tokens = completion.prompt_tokens;
                    state.metrics.completion_tokens = completion.completion_tokens;
                    state.metrics.total_time = completion.total_time;
                    state.metrics.resident_memory_bytes = completion.resident_memory_bytes;
                    tracing::info!(
                        "Generation finished: {} tokens in {:.2}s ({:.1} tok/s)",
                        completion.completion_tokens,
                        completion.total_time.as_secs_f64(),
                        state.metrics.tokens_per_second
                    );
                    SessionEvent::Finished
                }
                Err(e) => {
                    let error = e.to_string();
                    tracing::error!("Generation failed: {error}");
                    state
                        .transcript
                        .replace_content(index, format!("Error: {error}"));
                    SessionEvent::Failed { error }
                }
            }
        };

        self.emit(event);
    }
}

impl ChatSession {
    /// Create a session with no model loaded
    #[must_use]
    pub fn new(engine: Arc<dyn InferenceEngine>, generation: &GenerationConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                engine,
                parameters: GenerationParameters::from(generation),
                flush_interval: generation.flush_interval(),
                events,
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Load an installed model into the engine.
    ///
    /// Failure is kept in [`Self::load_error`] and leaves no model loaded.
    pub async fn load_model(&self, model: &InstalledModel) -> Result<()> {
        if self.is_generating() {
            return Err(LocalmindError::Other(
                "Cannot switch models while generating".to_string(),
            ));
        }

        tracing::info!("Loading {} with {}", model.id(), self.shared.engine.engine_name());
        let result = self.shared.engine.load(model).await;

        let mut state = self.shared.lock();
        match result {
            Ok(()) => {
                state.loaded_model = Some(model.id().to_string());
                state.load_error = None;
                state.metrics.reset();
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to load {}: {e}", model.id());
                state.loaded_model = None;
                state.load_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Send a prompt and start generating a reply.
    ///
    /// Returns `Ok(false)` without doing anything if the prompt is blank or a generation is
    /// already running. Must be called from within a tokio runtime.
    pub fn send(&self, prompt: &str) -> Result<bool> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Ok(false);
        }

        {
            let mut state = self.shared.lock();
            if state.generating {
                tracing::debug!("Generation already running, ignoring prompt");
                return Ok(false);
            }
            if state.loaded_model.is_none() {
                return Err(InferenceError::NotLoaded.into());
            }

            state.transcript.push(Role::User, prompt);
            state.input.clear();
            let index = state.transcript.push(Role::Assistant, "");
            let history = state.transcript.history_before(index);
            state.metrics.reset();
            state.generating = true;

            let id = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
            let cancel_token = CancellationToken::new();
            // Detached; the token ends it and drops the engine stream
            tokio::spawn(run_generation(
                Arc::clone(&self.shared),
                id,
                cancel_token.clone(),
                index,
                history,
            ));
            state.active = Some(ActiveGeneration { id, cancel_token });
        }

        tracing::info!("Generation started");
        self.shared.emit(SessionEvent::Started);
        Ok(true)
    }

    /// Cancel the running generation, keeping whatever text was already shown
    pub fn stop(&self) -> bool {
        let stopped = {
            let mut state = self.shared.lock();
            state.generating = false;
            state.active.take()
        };

        let Some(generation) = stopped else {
            return false;
        };
        generation.cancel_token.cancel();

        tracing::info!("Generation stopped");
        self.shared.emit(SessionEvent::Stopped);
        true
    }

    /// Empty the transcript and reset metrics
    pub fn clear(&self) {
        let mut state = self.shared.lock();
        state.transcript.clear();
        state.metrics.reset();
    }

    pub fn set_input(&self, text: impl Into<String>) {
        self.shared.lock().input = text.into();
    }

    #[must_use]
    pub fn input(&self) -> String {
        self.shared.lock().input.clone()
    }

    #[must_use]
    pub fn is_generating(&self) -> bool {
        self.shared.lock().generating
    }

    #[must_use]
    pub fn transcript(&self) -> Transcript {
        self.shared.lock().transcript.clone()
    }

    #[must_use]
    pub fn metrics(&self) -> BenchmarkMetrics {
        self.shared.lock().metrics.clone()
    }

    #[must_use]
    pub fn loaded_model(&self) -> Option<String> {
        self.shared.lock().loaded_model.clone()
    }

    #[must_use]
    pub fn load_error(&self) -> Option<String> {
        self.shared.lock().load_error.clone()
    }
}

async fn run_generation(
    shared: Arc<Shared>,
    id: u64,
    cancel: CancellationToken,
    index: usize,
    history: Vec<ChatTurn>,
) {
    let outcome = tokio::select! {
        biased;
        () = cancel.cancelled() => Ok(Outcome::Cancelled),
        outcome = generate(&shared, id, &cancel, index, history) => outcome,
    };
    shared.finish(id, &cancel, index, outcome);
}

async fn generate(
    shared: &Shared,
    id: u64,
    cancel: &CancellationToken,
    index: usize,
    history: Vec<ChatTurn>,
) -> Result<Outcome> {
    let start = Instant::now();

    let prepared = shared.engine.prepare(&history).await?;
    let prompt_tokens = prepared.prompt_tokens;
    let mut stream = shared.engine.generate(prepared, &shared.parameters).await?;

    let mut batcher = FlushBatcher::new(shared.flush_interval, start);
    let mut accumulated = String::new();
    let mut completion_tokens = 0;

    while let Some(event) = stream.next().await {
        if cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        let event = event?;
        if matches!(&event, GenerationEvent::Chunk(text) if !text.is_empty()) {
            completion_tokens += 1;
        }
        batcher.push(event);

        let now = Instant::now();
        if batcher.is_due(now) {
            let flush = batcher.take(now);
            let is_final = flush.is_final;
            if !shared.commit(id, cancel, index, &mut accumulated, flush, now - start) {
                return Ok(Outcome::Cancelled);
            }
            if is_final {
                break;
            }
        }
    }
    drop(stream);

    // Stream ended without a completion record
    if batcher.has_pending() {
        let now = Instant::now();
        let flush = batcher.take(now);
        if !shared.commit(id, cancel, index, &mut accumulated, flush, now - start) {
            return Ok(Outcome::Cancelled);
        }
    }

    let total_time = start.elapsed();
    let resident_memory_bytes = tokio::task::spawn_blocking(resident_memory_bytes)
        .await
        .ok()
        .flatten();

    Ok(Outcome::Completed(Completion {
        prompt_tokens,
        completion_tokens,
        total_time,
        resident_memory_bytes,
    }))
}
