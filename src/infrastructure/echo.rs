//! In-process stand-in backend.
//!
//! Streams a canned reply token by token with realistic pacing. Used by the
//! demo binary and smoke tests; real inference lives behind the same trait
//! in an engine crate.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::core::models::EngineConfig;
use crate::core::traits::{
    BackendError, GeneratedChunk, InferenceBackend, ProgressObserver, ProgressReport,
};

const LOAD_STAGES: &[(f32, &str)] = &[
    (0.0, "Start to fetch params"),
    (0.3, "Fetching param shards"),
    (0.6, "Fetching param shards"),
    (0.85, "Compiling WebGPU kernels"),
    (1.0, "Finish loading"),
];

pub struct EchoBackend {
    observer: Mutex<Option<ProgressObserver>>,
    /// Bumped by interrupts; a generation stops once the epoch it started
    /// under is no longer current.
    epoch: AtomicU64,
    stage_delay: Duration,
    token_delay: Duration,
}

impl EchoBackend {
    pub fn new() -> Self {
        Self {
            observer: Mutex::new(None),
            epoch: AtomicU64::new(0),
            stage_delay: Duration::from_millis(120),
            token_delay: Duration::from_millis(30),
        }
    }

    /// Same backend with pacing suitable for tests.
    pub fn fast() -> Self {
        Self {
            stage_delay: Duration::from_millis(1),
            token_delay: Duration::from_millis(1),
            ..Self::new()
        }
    }

    fn report(&self, progress: f32, text: &str) {
        let observer = self.observer.lock().expect("observer poisoned");
        if let Some(observer) = &*observer {
            observer(ProgressReport {
                progress,
                text: text.to_owned(),
            });
        }
    }
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceBackend for EchoBackend {
    fn set_progress_observer(&self, observer: ProgressObserver) {
        *self.observer.lock().expect("observer poisoned") = Some(observer);
    }

    async fn reload(&self, model_id: &str, config: &EngineConfig) -> Result<(), BackendError> {
        info!("echo backend loading {model_id} from {}", config.model_url);
        for (progress, text) in LOAD_STAGES {
            sleep(self.stage_delay).await;
            self.report(*progress, text);
        }
        Ok(())
    }

    async fn generate(
        &self,
        input: String,
        chunks: mpsc::Sender<GeneratedChunk>,
    ) -> Result<(), BackendError> {
        let my_epoch = self.epoch.load(Ordering::SeqCst);
        let reply = format!(
            "You said: \"{}\". I am a canned stand-in for a WebGPU model, \
             so that is all I have to say about it.",
            input.trim()
        );

        let mut cumulative = String::new();
        for (step, word) in reply.split_whitespace().enumerate() {
            sleep(self.token_delay).await;
            if self.epoch.load(Ordering::SeqCst) != my_epoch {
                debug!("echo generation interrupted at step {step}");
                return Ok(());
            }
            if !cumulative.is_empty() {
                cumulative.push(' ');
            }
            cumulative.push_str(word);
            let chunk = GeneratedChunk {
                step: step as u32,
                text: cumulative.clone(),
            };
            if chunks.send(chunk).await.is_err() {
                return Ok(());
            }
        }

        let terminal = GeneratedChunk {
            step: reply.split_whitespace().count() as u32,
            text: String::new(),
        };
        let _ = chunks.send(terminal).await;
        Ok(())
    }

    async fn interrupt_generate(&self) -> Result<(), BackendError> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reset_chat(&self) -> Result<(), BackendError> {
        debug!("echo backend context cleared");
        Ok(())
    }

    async fn unload(&self) -> Result<(), BackendError> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
