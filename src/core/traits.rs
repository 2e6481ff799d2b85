//! Capability interface for the inference backend.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::models::EngineConfig;

/// A single loading progress notification from the backend.
///
/// `progress` is a fraction in `[0, 1]`; `text` is a human-readable status
/// line ("Fetching parameter shard 3/51", "Compiling kernels", ...).
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    pub progress: f32,
    pub text: String,
}

/// Callback receiving [`ProgressReport`]s while a model is being loaded.
pub type ProgressObserver = Box<dyn Fn(ProgressReport) + Send + Sync>;

/// One streamed generation chunk.
///
/// `text` is the cumulative response so far, not a delta. An empty `text`
/// marks the end of the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedChunk {
    pub step: u32,
    pub text: String,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("model acquisition failed: {0}")]
    Acquisition(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("backend worker is gone")]
    Disconnected,
}

/// The opaque inference engine, as seen by the session controller.
///
/// Implementations may run in-process or delegate to a dedicated task (see
/// `infrastructure::worker::WorkerBackend`); the controller does not care
/// which variant it was handed.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Install the observer notified while [`reload`](Self::reload) runs.
    /// Replaces any previously installed observer.
    fn set_progress_observer(&self, observer: ProgressObserver);

    /// Fetch weights and compile kernels for the given model. Suspends until
    /// the model is ready to generate.
    async fn reload(&self, model_id: &str, config: &EngineConfig) -> Result<(), BackendError>;

    /// Run one generation, sending cumulative-text chunks followed by an
    /// empty terminal chunk. Suspends until generation ends. Implementations
    /// must stop generating when the receiving side goes away and must honor
    /// [`interrupt_generate`](Self::interrupt_generate) at the next chunk
    /// boundary.
    async fn generate(
        &self,
        input: String,
        chunks: mpsc::Sender<GeneratedChunk>,
    ) -> Result<(), BackendError>;

    /// Cooperatively cancel an in-flight generation.
    async fn interrupt_generate(&self) -> Result<(), BackendError>;

    /// Clear the backend-side conversation context.
    async fn reset_chat(&self) -> Result<(), BackendError>;

    /// Release all backend resources.
    async fn unload(&self) -> Result<(), BackendError>;
}

#[async_trait]
impl<B: InferenceBackend + ?Sized> InferenceBackend for std::sync::Arc<B> {
    fn set_progress_observer(&self, observer: ProgressObserver) {
        (**self).set_progress_observer(observer)
    }

    async fn reload(&self, model_id: &str, config: &EngineConfig) -> Result<(), BackendError> {
        (**self).reload(model_id, config).await
    }

    async fn generate(
        &self,
        input: String,
        chunks: mpsc::Sender<GeneratedChunk>,
    ) -> Result<(), BackendError> {
        (**self).generate(input, chunks).await
    }

    async fn interrupt_generate(&self) -> Result<(), BackendError> {
        (**self).interrupt_generate().await
    }

    async fn reset_chat(&self) -> Result<(), BackendError> {
        (**self).reset_chat().await
    }

    async fn unload(&self) -> Result<(), BackendError> {
        (**self).unload().await
    }
}
