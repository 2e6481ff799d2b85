//! Worker-delegating backend proxy.
//!
//! Wraps a real backend in a dedicated tokio task and forwards every
//! capability call over a command channel, so the engine can live on its own
//! executor thread while callers keep the plain [`InferenceBackend`] surface.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error};
use tokio::sync::{mpsc, oneshot};

use crate::core::models::EngineConfig;
use crate::core::traits::{BackendError, GeneratedChunk, InferenceBackend, ProgressObserver};

type Reply = oneshot::Sender<Result<(), BackendError>>;

enum WorkerCommand {
    SetProgressObserver(ProgressObserver),
    Reload {
        model_id: String,
        config: EngineConfig,
        reply: Reply,
    },
    Generate {
        input: String,
        chunks: mpsc::Sender<GeneratedChunk>,
        reply: Reply,
    },
    Interrupt {
        reply: Reply,
    },
    ResetChat {
        reply: Reply,
    },
    Unload {
        reply: Reply,
    },
}

/// The delegated backend variant: commands go over a queue to a worker task
/// owning the inner backend. Generation runs as its own task so an interrupt
/// command can overtake an in-flight generate.
pub struct WorkerBackend {
    commands: mpsc::Sender<WorkerCommand>,
}

impl WorkerBackend {
    pub fn spawn<B: InferenceBackend + 'static>(inner: B) -> Self {
        let inner = Arc::new(inner);
        let (commands, queue) = mpsc::channel(16);
        tokio::spawn(worker_task(inner, queue));
        Self { commands }
    }

    async fn request(
        &self,
        command: impl FnOnce(Reply) -> WorkerCommand,
    ) -> Result<(), BackendError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| BackendError::Disconnected)?;
        response.await.map_err(|_| BackendError::Disconnected)?
    }
}

async fn worker_task(
    inner: Arc<dyn InferenceBackend>,
    mut queue: mpsc::Receiver<WorkerCommand>,
) {
    while let Some(command) = queue.recv().await {
        match command {
            WorkerCommand::SetProgressObserver(observer) => {
                inner.set_progress_observer(observer);
            }
            WorkerCommand::Reload {
                model_id,
                config,
                reply,
            } => {
                let _ = reply.send(inner.reload(&model_id, &config).await);
            }
            WorkerCommand::Generate {
                input,
                chunks,
                reply,
            } => {
                // Detached, so interrupt commands keep being served while
                // the generation streams.
                let backend = Arc::clone(&inner);
                tokio::spawn(async move {
                    let _ = reply.send(backend.generate(input, chunks).await);
                });
            }
            WorkerCommand::Interrupt { reply } => {
                let _ = reply.send(inner.interrupt_generate().await);
            }
            WorkerCommand::ResetChat { reply } => {
                let _ = reply.send(inner.reset_chat().await);
            }
            WorkerCommand::Unload { reply } => {
                let _ = reply.send(inner.unload().await);
            }
        }
    }
    debug!("backend worker shutting down");
}

#[async_trait]
impl InferenceBackend for WorkerBackend {
    fn set_progress_observer(&self, observer: ProgressObserver) {
        // Non-suspending on the trait surface; delivery order relative to a
        // following reload is preserved by the command queue.
        if self
            .commands
            .try_send(WorkerCommand::SetProgressObserver(observer))
            .is_err()
        {
            error!("backend worker queue is full, progress observer was not installed");
        }
    }

    async fn reload(&self, model_id: &str, config: &EngineConfig) -> Result<(), BackendError> {
        let model_id = model_id.to_owned();
        let config = config.clone();
        self.request(|reply| WorkerCommand::Reload {
            model_id,
            config,
            reply,
        })
        .await
    }

    async fn generate(
        &self,
        input: String,
        chunks: mpsc::Sender<GeneratedChunk>,
    ) -> Result<(), BackendError> {
        self.request(|reply| WorkerCommand::Generate {
            input,
            chunks,
            reply,
        })
        .await
    }

    async fn interrupt_generate(&self) -> Result<(), BackendError> {
        self.request(|reply| WorkerCommand::Interrupt { reply })
            .await
    }

    async fn reset_chat(&self) -> Result<(), BackendError> {
        self.request(|reply| WorkerCommand::ResetChat { reply })
            .await
    }

    async fn unload(&self) -> Result<(), BackendError> {
        self.request(|reply| WorkerCommand::Unload { reply }).await
    }
}
