#![allow(dead_code)]

//! Shared test doubles: a scriptable backend and callback recorders.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::sleep;

use tokio_llm_session::core::models::{EngineConfig, ModelDescriptor};
use tokio_llm_session::core::session::{CompleteCallback, LoadProgressFn, PartialCallback};
use tokio_llm_session::core::traits::{
    BackendError, GeneratedChunk, InferenceBackend, ProgressObserver, ProgressReport,
};

/// Backend that plays back a scripted generation, chunk by chunk.
///
/// With a gate installed, each chunk waits for one semaphore permit, letting
/// tests interleave controller calls deterministically mid-stream.
pub struct ScriptedBackend {
    chunks: Vec<String>,
    progress_script: Vec<(f32, String)>,
    observer: Mutex<Option<ProgressObserver>>,
    epoch: AtomicU64,
    gate: Option<Arc<Semaphore>>,
    reload_gate: Option<Arc<Semaphore>>,
    fail_next_reload: AtomicBool,
    fail_generate_after: Option<usize>,
    fail_after_terminal: bool,
    token_delay: Duration,
    pub reload_calls: AtomicUsize,
    pub interrupt_calls: AtomicUsize,
    pub reset_calls: AtomicUsize,
    pub unload_calls: AtomicUsize,
    pub generate_calls: AtomicUsize,
    pub generate_exits: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| (*c).to_owned()).collect(),
            progress_script: vec![
                (0.1, "Start to fetch params".to_owned()),
                (0.5, "Fetching param shards".to_owned()),
                (1.0, "Finish loading".to_owned()),
            ],
            observer: Mutex::new(None),
            epoch: AtomicU64::new(0),
            gate: None,
            reload_gate: None,
            fail_next_reload: AtomicBool::new(false),
            fail_generate_after: None,
            fail_after_terminal: false,
            token_delay: Duration::from_millis(2),
            reload_calls: AtomicUsize::new(0),
            interrupt_calls: AtomicUsize::new(0),
            reset_calls: AtomicUsize::new(0),
            unload_calls: AtomicUsize::new(0),
            generate_calls: AtomicUsize::new(0),
            generate_exits: AtomicUsize::new(0),
        }
    }

    pub fn gated(chunks: &[&str], gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(chunks)
        }
    }

    pub fn with_progress(mut self, script: &[(f32, &str)]) -> Self {
        self.progress_script = script
            .iter()
            .map(|(fraction, text)| (*fraction, (*text).to_owned()))
            .collect();
        self
    }

    /// Suspend each reload on one permit of `gate` after its progress
    /// reports, so tests can act while a load is still in flight.
    pub fn with_reload_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.reload_gate = Some(gate);
        self
    }

    pub fn failing_generation_after(mut self, chunk_count: usize) -> Self {
        self.fail_generate_after = Some(chunk_count);
        self
    }

    /// Return an error from `generate` shortly after the terminal chunk,
    /// mimicking an engine that fails while tearing its run down.
    pub fn failing_after_terminal(mut self) -> Self {
        self.fail_after_terminal = true;
        self
    }

    /// Make the next reload fail; later reloads succeed again.
    pub fn fail_next_reload(&self) {
        self.fail_next_reload.store(true, Ordering::SeqCst);
    }

    async fn run_script(&self, chunks: mpsc::Sender<GeneratedChunk>) -> Result<(), BackendError> {
        let my_epoch = self.epoch.load(Ordering::SeqCst);

        for (step, text) in self.chunks.iter().enumerate() {
            if self.fail_generate_after == Some(step) {
                return Err(BackendError::Generation("scripted mid-stream failure".into()));
            }
            if let Some(gate) = &self.gate {
                let permit = gate
                    .acquire()
                    .await
                    .map_err(|_| BackendError::Generation("gate closed".into()))?;
                permit.forget();
            } else {
                sleep(self.token_delay).await;
            }
            if self.epoch.load(Ordering::SeqCst) != my_epoch {
                return Ok(());
            }
            let chunk = GeneratedChunk {
                step: step as u32,
                text: text.clone(),
            };
            if chunks.send(chunk).await.is_err() {
                return Ok(());
            }
        }

        if self.epoch.load(Ordering::SeqCst) == my_epoch {
            let _ = chunks
                .send(GeneratedChunk {
                    step: self.chunks.len() as u32,
                    text: String::new(),
                })
                .await;
            if self.fail_after_terminal {
                sleep(Duration::from_millis(20)).await;
                return Err(BackendError::Generation(
                    "scripted teardown failure".into(),
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    fn set_progress_observer(&self, observer: ProgressObserver) {
        *self.observer.lock().unwrap() = Some(observer);
    }

    async fn reload(&self, _model_id: &str, _config: &EngineConfig) -> Result<(), BackendError> {
        self.reload_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_reload.swap(false, Ordering::SeqCst) {
            return Err(BackendError::Acquisition("scripted fetch failure".into()));
        }
        for (progress, text) in &self.progress_script {
            sleep(Duration::from_millis(1)).await;
            if let Some(observer) = &*self.observer.lock().unwrap() {
                observer(ProgressReport {
                    progress: *progress,
                    text: text.clone(),
                });
            }
        }
        if let Some(gate) = &self.reload_gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| BackendError::Acquisition("reload gate closed".into()))?;
            permit.forget();
        }
        Ok(())
    }

    async fn generate(
        &self,
        _input: String,
        chunks: mpsc::Sender<GeneratedChunk>,
    ) -> Result<(), BackendError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        let result = self.run_script(chunks).await;
        self.generate_exits.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn interrupt_generate(&self) -> Result<(), BackendError> {
        self.interrupt_calls.fetch_add(1, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reset_chat(&self) -> Result<(), BackendError> {
        self.reset_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unload(&self) -> Result<(), BackendError> {
        self.unload_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records everything the session's callbacks deliver.
#[derive(Clone, Default)]
pub struct Recorder {
    partials: Arc<Mutex<Vec<String>>>,
    completions: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_partial(&self) -> PartialCallback {
        let partials = Arc::clone(&self.partials);
        Box::new(move |text: &str| partials.lock().unwrap().push(text.to_owned()))
    }

    pub fn on_complete(&self) -> CompleteCallback {
        let completions = Arc::clone(&self.completions);
        Box::new(move |text: &str| completions.lock().unwrap().push(text.to_owned()))
    }

    pub fn partials(&self) -> Vec<String> {
        self.partials.lock().unwrap().clone()
    }

    pub fn completions(&self) -> Vec<String> {
        self.completions.lock().unwrap().clone()
    }
}

/// Records `(fraction, message)` pairs from the load-progress observer.
#[derive(Clone, Default)]
pub struct ProgressRecorder {
    reports: Arc<Mutex<Vec<(f32, String)>>>,
}

impl ProgressRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observer(&self) -> LoadProgressFn {
        let reports = Arc::clone(&self.reports);
        Arc::new(move |fraction, message| {
            reports.lock().unwrap().push((fraction, message.to_owned()))
        })
    }

    pub fn fractions(&self) -> Vec<f32> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .map(|(fraction, _)| *fraction)
            .collect()
    }
}

pub fn test_model() -> ModelDescriptor {
    ModelDescriptor {
        simple_name: "Test Model".to_owned(),
        model_name: "m1".to_owned(),
        model_params_url: "http://localhost:8081/m1/params/".to_owned(),
        wasm_url: "http://localhost:8081/m1/m1-webgpu.wasm".to_owned(),
        root_url: None,
    }
}

/// Poll until `condition` holds, failing the test after a generous timeout.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {what}");
}
