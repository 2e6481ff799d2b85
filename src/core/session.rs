//! Chat session controller.
//!
//! Owns the lifecycle of one model-backed inference session: loading
//! weights, tracking progress, serializing generation requests, cooperative
//! cancellation, and streaming output to the caller.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_stream::stream;
use futures_util::Stream;
use log::{debug, error, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::core::models::ModelDescriptor;
use crate::core::traits::{BackendError, InferenceBackend, ProgressReport};

/// Lifecycle phase of a [`ChatSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Unloaded,
    Loading,
    Ready,
    Streaming,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Unloaded => "unloaded",
            Phase::Loading => "loading",
            Phase::Ready => "ready",
            Phase::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// The operation is not permitted in the current phase. Recoverable; the
    /// session state is unchanged.
    #[error("{operation} is not allowed while the session is {phase}")]
    InvalidState {
        operation: &'static str,
        phase: Phase,
    },

    #[error("cannot ask with empty input")]
    EmptyInput,

    /// The backend failed to acquire the model. The session is back in
    /// the unloaded phase, so the load may be retried.
    #[error("model load failed: {0}")]
    LoadFailed(#[source] BackendError),

    /// The backend failed mid-generation. The session is back in the ready
    /// phase.
    #[error("generation failed: {0}")]
    Generation(#[source] BackendError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Read-only view of the session state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub loading_progress: f32,
    pub loading_message: String,
    pub latest_response: String,
}

/// One event of a streamed generation, see [`ChatSession::ask_stream`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Cumulative response text so far.
    Partial(String),
    /// Final response text; the last event of a completed generation.
    Complete(String),
    Failed(String),
}

/// Callback receiving the cumulative response after every streamed chunk.
pub type PartialCallback = Box<dyn FnMut(&str) + Send>;
/// Callback receiving the final response exactly once.
pub type CompleteCallback = Box<dyn FnOnce(&str) + Send>;
/// Observer for loading progress, `(fraction, status line)`.
pub type LoadProgressFn = Arc<dyn Fn(f32, &str) + Send + Sync>;

struct SessionState {
    phase: Phase,
    loading_progress: f32,
    loading_message: String,
    latest_response: String,
    model: Option<ModelDescriptor>,
    /// Bumped whenever a generation is started or superseded; a drive loop
    /// whose number no longer matches is stale and must not complete.
    generation: u64,
}

/// Controller for one inference session.
///
/// Cheap to clone; clones share the same session. All mutation goes through
/// the public operations, which reject (rather than queue) calls that the
/// current phase does not permit.
#[derive(Clone)]
pub struct ChatSession {
    backend: Arc<dyn InferenceBackend>,
    state: Arc<Mutex<SessionState>>,
    progress: Option<LoadProgressFn>,
}

impl ChatSession {
    /// Create a session over the given backend. `progress` is notified with
    /// monotone `(fraction, message)` pairs while a model loads.
    pub fn new(backend: Arc<dyn InferenceBackend>, progress: Option<LoadProgressFn>) -> Self {
        Self {
            backend,
            state: Arc::new(Mutex::new(SessionState {
                phase: Phase::Unloaded,
                loading_progress: 0.0,
                loading_message: String::new(),
                latest_response: String::new(),
                model: None,
                generation: 0,
            })),
            progress,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().expect("session state poisoned")
    }

    /// Snapshot of the current phase, loading progress, and latest response.
    pub fn state(&self) -> SessionSnapshot {
        let state = self.lock();
        SessionSnapshot {
            phase: state.phase,
            loading_progress: state.loading_progress,
            loading_message: state.loading_message.clone(),
            latest_response: state.latest_response.clone(),
        }
    }

    /// The descriptor bound by the last successful [`load`](Self::load).
    pub fn model(&self) -> Option<ModelDescriptor> {
        self.lock().model.clone()
    }

    /// Load a model: fetch weights, compile kernels, and bind the
    /// descriptor. Only permitted while unloaded; a failed load leaves the
    /// session unloaded so it can be retried. A load superseded by a forced
    /// [`unload`](Self::unload) while the backend is still acquiring the
    /// model is discarded and the session stays unloaded.
    pub async fn load(&self, model: ModelDescriptor) -> Result<(), SessionError> {
        let my_generation = {
            let mut state = self.lock();
            if state.phase != Phase::Unloaded {
                let phase = state.phase;
                error!("model does not need to be loaded, session is {phase}");
                return Err(SessionError::InvalidState {
                    operation: "load",
                    phase,
                });
            }
            state.generation += 1;
            state.phase = Phase::Loading;
            state.loading_progress = 0.0;
            state.loading_message.clear();
            state.model = Some(model.clone());
            state.generation
        };

        info!("loading model {}", model.model_name);
        let started = Instant::now();

        let shared = Arc::clone(&self.state);
        let forward = self.progress.clone();
        self.backend
            .set_progress_observer(Box::new(move |report: ProgressReport| {
                let (fraction, text) = {
                    let mut state = shared.lock().expect("session state poisoned");
                    if state.phase != Phase::Loading {
                        return;
                    }
                    // Enforce monotone progress within this loading episode.
                    let fraction = report.progress.clamp(state.loading_progress, 1.0);
                    state.loading_progress = fraction;
                    state.loading_message = report.text.clone();
                    (fraction, report.text)
                };
                debug!("loading progress {fraction:.2}: {text}");
                if let Some(observer) = &forward {
                    observer(fraction, &text);
                }
            }));

        match self
            .backend
            .reload(&model.model_name, &model.engine_config())
            .await
        {
            Ok(()) => {
                let commit = {
                    let mut state = self.lock();
                    // Only commit if this load still owns the session. A
                    // forced unload that won the race bumped the generation
                    // counter and already left the session unloaded.
                    if state.generation == my_generation && state.phase == Phase::Loading {
                        let emit_final = state.loading_progress < 1.0;
                        state.loading_progress = 1.0;
                        state.phase = Phase::Ready;
                        Some(emit_final.then(|| state.loading_message.clone()))
                    } else {
                        None
                    }
                };
                match commit {
                    Some(final_message) => {
                        // The fraction must reach exactly 1.0 as the session
                        // becomes ready, even if the backend's last report
                        // fell short.
                        if let (Some(message), Some(observer)) = (final_message, &self.progress) {
                            observer(1.0, &message);
                        }
                        info!(
                            "model {} loaded in {:.2}s",
                            model.model_name,
                            started.elapsed().as_secs_f32()
                        );
                    }
                    None => {
                        warn!(
                            "load of model {} was superseded, releasing the backend",
                            model.model_name
                        );
                        if let Err(err) = self.backend.unload().await {
                            warn!("failed to release superseded model load: {err}");
                        }
                    }
                }
                Ok(())
            }
            Err(err) => {
                error!("failed to load model {}: {err}", model.model_name);
                let mut state = self.lock();
                if state.generation == my_generation && state.phase == Phase::Loading {
                    state.phase = Phase::Unloaded;
                    state.loading_progress = 0.0;
                    state.loading_message.clear();
                    state.model = None;
                }
                Err(SessionError::LoadFailed(err))
            }
        }
    }

    /// Run one generation for `input`, streaming the cumulative response to
    /// `on_partial` and the final text to `on_complete` exactly once.
    ///
    /// Permitted while ready, or while streaming if `interrupt` is set, in
    /// which case the in-flight generation is cancelled first and its
    /// completion callback never fires. A second ask during streaming
    /// without `interrupt` is rejected, not queued.
    pub async fn ask(
        &self,
        input: &str,
        mut on_partial: Option<PartialCallback>,
        mut on_complete: Option<CompleteCallback>,
        interrupt: bool,
    ) -> Result<(), SessionError> {
        if input.trim().is_empty() {
            warn!("rejecting ask with empty input");
            return Err(SessionError::EmptyInput);
        }

        // Admission for a ready session happens atomically under the state
        // lock, so two concurrent non-interrupting asks can never both pass
        // the guard before either transitions to streaming.
        let admitted = {
            let mut state = self.lock();
            match state.phase {
                Phase::Ready => {
                    state.generation += 1;
                    state.phase = Phase::Streaming;
                    state.latest_response.clear();
                    Some(state.generation)
                }
                Phase::Streaming if interrupt => None,
                phase => {
                    error!("chat is not ready for a new ask, session is {phase}");
                    return Err(SessionError::InvalidState {
                        operation: "ask",
                        phase,
                    });
                }
            }
        };
        let my_generation = match admitted {
            Some(generation) => generation,
            None => {
                debug!("interrupting previous generation");
                self.backend.interrupt_generate().await?;
                let mut state = self.lock();
                // Revalidate: a concurrent forced unload may have won the
                // race while the interrupt was in flight.
                if !matches!(state.phase, Phase::Ready | Phase::Streaming) {
                    let phase = state.phase;
                    return Err(SessionError::InvalidState {
                        operation: "ask",
                        phase,
                    });
                }
                state.generation += 1;
                state.phase = Phase::Streaming;
                state.latest_response.clear();
                state.generation
            }
        };
        debug!("ask accepted as generation {my_generation} (interrupt {interrupt})");

        let (chunk_sender, mut chunk_receiver) = mpsc::channel(64);
        let backend = Arc::clone(&self.backend);
        let prompt = input.to_owned();
        let generate_task =
            tokio::spawn(async move { backend.generate(prompt, chunk_sender).await });

        let started = Instant::now();
        let mut steps = 0u32;
        let mut completed = false;

        while let Some(chunk) = chunk_receiver.recv().await {
            if self.lock().generation != my_generation {
                debug!("generation {my_generation} superseded, dropping its chunks");
                break;
            }

            if chunk.text.is_empty() {
                // End of stream: have the backend finalize, then complete.
                debug!("end of response for generation {my_generation}");
                if let Err(err) = self.backend.interrupt_generate().await {
                    warn!("failed to finalize generation {my_generation}: {err}");
                }
                let final_text = {
                    let mut state = self.lock();
                    if state.generation == my_generation {
                        state.phase = Phase::Ready;
                        Some(state.latest_response.clone())
                    } else {
                        None
                    }
                };
                if let Some(text) = final_text {
                    info!(
                        "generation {my_generation} finished in {:.2}s ({steps} steps)",
                        started.elapsed().as_secs_f32()
                    );
                    if let Some(done) = on_complete.take() {
                        done(&text);
                    }
                    completed = true;
                }
                break;
            }

            steps = chunk.step;
            self.lock().latest_response = chunk.text.clone();
            if let Some(partial) = on_partial.as_mut() {
                partial(&chunk.text);
            }
        }

        // Either the backend finished, or this generation was superseded.
        // Dropping the receiver tells a still running backend to stop.
        drop(chunk_receiver);
        let outcome = match generate_task.await {
            Ok(result) => result,
            Err(err) => Err(BackendError::Generation(format!(
                "generation task panicked: {err}"
            ))),
        };

        if completed {
            // The response was already finalized and delivered. A backend
            // error after the terminal chunk cannot be surfaced to the
            // caller any more, so record it instead of dropping it.
            if let Err(err) = outcome {
                warn!("backend reported an error after generation {my_generation} completed: {err}");
            }
            return Ok(());
        }

        let final_text = {
            let mut state = self.lock();
            if state.generation == my_generation && state.phase == Phase::Streaming {
                state.phase = Phase::Ready;
                Some(state.latest_response.clone())
            } else {
                None
            }
        };

        match outcome {
            Ok(()) => {
                if let Some(text) = final_text {
                    info!(
                        "generation {my_generation} finished in {:.2}s ({steps} steps)",
                        started.elapsed().as_secs_f32()
                    );
                    if let Some(done) = on_complete.take() {
                        done(&text);
                    }
                }
                Ok(())
            }
            Err(err) => {
                error!("generation {my_generation} failed: {err}");
                Err(SessionError::Generation(err))
            }
        }
    }

    /// Run one generation as an ordered event stream: cumulative
    /// [`SessionEvent::Partial`] revisions terminated by a single
    /// [`SessionEvent::Complete`], or [`SessionEvent::Failed`] on error.
    pub fn ask_stream(
        &self,
        input: &str,
        interrupt: bool,
    ) -> impl Stream<Item = SessionEvent> + Send + 'static {
        let session = self.clone();
        let input = input.to_owned();

        stream! {
            let (event_sender, mut events) = mpsc::unbounded_channel();
            let partial_sender = event_sender.clone();
            let ask = tokio::spawn(async move {
                session
                    .ask(
                        &input,
                        Some(Box::new(move |text: &str| {
                            let _ = partial_sender.send(SessionEvent::Partial(text.to_owned()));
                        })),
                        Some(Box::new(move |text: &str| {
                            let _ = event_sender.send(SessionEvent::Complete(text.to_owned()));
                        })),
                        interrupt,
                    )
                    .await
            });

            while let Some(event) = events.recv().await {
                let done = matches!(event, SessionEvent::Complete(_));
                yield event;
                if done {
                    break;
                }
            }

            match ask.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => yield SessionEvent::Failed(err.to_string()),
                Err(err) => yield SessionEvent::Failed(err.to_string()),
            }
        }
    }

    /// Cancel an in-flight generation, keeping whatever partial text was
    /// already streamed. No-op if nothing is streaming.
    pub async fn stop(&self) -> Result<(), SessionError> {
        let streaming = {
            let mut state = self.lock();
            if state.phase == Phase::Streaming {
                state.generation += 1;
                state.phase = Phase::Ready;
                true
            } else {
                false
            }
        };
        if streaming {
            self.backend.interrupt_generate().await?;
            info!("generation stopped");
        }
        Ok(())
    }

    /// Clear the backend-side conversation context without touching the load
    /// state. Safe in any phase; an in-flight generation is unaffected and
    /// will complete against the cleared context, so callers wanting
    /// exclusivity should [`stop`](Self::stop) first.
    pub async fn reset_history(&self) -> Result<(), SessionError> {
        self.backend.reset_chat().await?;
        debug!("conversation history cleared");
        Ok(())
    }

    /// Release backend resources and return to the unloaded phase. Rejected
    /// while loading or streaming unless `force` is set; forcing also
    /// supersedes any in-flight generation.
    pub async fn unload(&self, force: bool) -> Result<(), SessionError> {
        {
            let state = self.lock();
            if !force && !matches!(state.phase, Phase::Ready | Phase::Unloaded) {
                let phase = state.phase;
                error!("not being forced, and session is {phase}");
                return Err(SessionError::InvalidState {
                    operation: "unload",
                    phase,
                });
            }
        }

        self.backend.unload().await?;

        let mut state = self.lock();
        state.generation += 1;
        state.phase = Phase::Unloaded;
        state.loading_progress = 0.0;
        state.loading_message.clear();
        state.latest_response.clear();
        state.model = None;
        info!("model unloaded");
        Ok(())
    }
}
