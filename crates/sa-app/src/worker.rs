use std::any::Any;
use std::fs;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use anyhow::{anyhow, Context};
use image::{imageops, RgbaImage};
use tracing::{debug, error, info, warn};
use sa_core::metadata::Conditioning;
use sa_core::pipeline::{
    ControlPreprocessor, PipelineLoader, SampleOutcome, SamplingJob, SamplingPipeline, StepUpdate,
};
use sa_core::progress::{ProgressEvent, ProgressTracker};
use crate::cache::PipelineCache;
use crate::error::GenerationError;
use crate::events::WorkerEvent;
use crate::job::{GenerationRequest, RunOutcome, WorkerState};
use crate::output::OutputWriter;
use crate::postprocess::PostProcessor;

/// Cooperative cancellation flag shared between the caller and the worker
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Cancel and state access that does not need the worker itself.
///
/// A cancellation only lands while a run is active. `start` clears the flag
/// and marks the worker active under the same lock.
#[derive(Debug, Clone)]
pub struct WorkerControl {
    cancel: CancellationToken,
    state: Arc<Mutex<WorkerState>>,
}

impl WorkerControl {
    /// Ask the current run to stop at its next cancellation point.
    /// Returns whether a run was active.
    pub fn cancel(&self) -> bool {
        let state = lock_state(&self.state);
        if !state.is_active() {
            return false;
        }
        if state.can_cancel() {
            info!(state = state.label(), "Cancellation requested");
        }
        self.cancel.cancel();
        true
    }

    pub fn state(&self) -> WorkerState {
        *lock_state(&self.state)
    }

    pub fn is_running(&self) -> bool {
        self.state().is_active()
    }

    /// Whether the last run was asked to stop
    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Collaborators the worker thread takes ownership of
pub struct WorkerDeps {
    pub loader: Arc<dyn PipelineLoader>,
    pub post: PostProcessor,
    pub preprocessor: Option<Arc<dyn ControlPreprocessor>>,
    pub writer: OutputWriter,
    /// Collections live directly below this directory
    pub images_root: PathBuf,
    /// Drop the cached pipeline after every run
    pub reduce_memory: bool,
}

enum WorkerCommand {
    Generate(GenerationRequest),
    Shutdown,
}

/// Runs generation requests one at a time on a background thread.
///
/// The thread owns the pipeline cache. Callers talk to it through
/// [`start`](Self::start) / [`cancel`](Self::cancel) and read
/// [`WorkerEvent`]s back.
pub struct GenerationWorker {
    command_tx: Sender<WorkerCommand>,
    event_rx: Receiver<WorkerEvent>,
    control: WorkerControl,
    loader: Arc<dyn PipelineLoader>,
    thread_handle: Option<JoinHandle<()>>,
}

impl GenerationWorker {
    pub fn spawn(deps: WorkerDeps) -> Self {
        let (cmd_tx, cmd_rx) = channel::<WorkerCommand>();
        let (event_tx, event_rx) = channel::<WorkerEvent>();
        let cancel = CancellationToken::new();
        let state = Arc::new(Mutex::new(WorkerState::Idle));
        let loader = deps.loader.clone();

        let mut runner = Runner {
            deps,
            cache: PipelineCache::new(),
            events: event_tx,
            cancel: cancel.clone(),
            state: state.clone(),
        };

        let thread_handle = thread::Builder::new()
            .name("generation-worker".into())
            .spawn(move || {
                loop {
                    match cmd_rx.recv() {
                        Ok(WorkerCommand::Generate(request)) => runner.execute(request),
                        Ok(WorkerCommand::Shutdown) => break,
                        // Channel closed, exit
                        Err(_) => break,
                    }
                }
                debug!("Generation worker stopped");
            })
            .map_err(|e| error!("Failed to spawn generation worker thread: {}", e))
            .ok();

        Self {
            command_tx: cmd_tx,
            event_rx,
            control: WorkerControl { cancel, state },
            loader,
            thread_handle,
        }
    }

    /// Queue `request` on the worker. Returns once the request is accepted;
    /// the run itself reports through events.
    pub fn start(&self, request: GenerationRequest) -> Result<(), GenerationError> {
        request.validate()?;
        let fingerprint = request.metadata.fingerprint();
        self.loader
            .resolve(&fingerprint)
            .map_err(|e| GenerationError::Configuration(format!("{}: {}", fingerprint, e)))?;
        if self.thread_handle.is_none() {
            return Err(GenerationError::WorkerUnavailable);
        }

        {
            let mut state = lock_state(&self.control.state);
            if state.is_active() {
                return Err(GenerationError::Busy);
            }
            self.control.cancel.reset();
            *state = WorkerState::Loading;
        }

        info!(id = %request.id, collection = %request.collection, "Generation queued");

        self.command_tx.send(WorkerCommand::Generate(request)).map_err(|_| {
            *lock_state(&self.control.state) = WorkerState::Idle;
            GenerationError::WorkerUnavailable
        })
    }

    /// See [`WorkerControl::cancel`]
    pub fn cancel(&self) -> bool {
        self.control.cancel()
    }

    pub fn state(&self) -> WorkerState {
        self.control.state()
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    pub fn control(&self) -> WorkerControl {
        self.control.clone()
    }

    pub fn try_recv_event(&self) -> Option<WorkerEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Block until the next event. `None` once the worker is gone.
    pub fn recv_event(&self) -> Option<WorkerEvent> {
        self.event_rx.recv().ok()
    }

    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<WorkerEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }

    /// Collect events up to and including the next `TaskComplete`
    pub fn wait_for_completion(&self) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv_event() {
            let done = event.is_terminal();
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    pub fn shutdown(&mut self) {
        self.control.cancel();
        let _ = self.command_tx.send(WorkerCommand::Shutdown);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GenerationWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock_state(state: &Mutex<WorkerState>) -> MutexGuard<'_, WorkerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Worker-thread side of the generation worker
struct Runner {
    deps: WorkerDeps,
    cache: PipelineCache<Box<dyn SamplingPipeline>>,
    events: Sender<WorkerEvent>,
    cancel: CancellationToken,
    state: Arc<Mutex<WorkerState>>,
}

impl Runner {
    /// Run one request and always finish with exactly one `TaskComplete`,
    /// whatever happened inside.
    fn execute(&mut self, request: GenerationRequest) {
        let id = request.id;
        self.emit(WorkerEvent::Progress(ProgressEvent::Busy));

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            info!(
                %id,
                images = request.image_count,
                total_steps = request.total_steps(),
                "Generation started"
            );
            self.run(&request)
        }));

        match result {
            Ok(Ok(RunOutcome::Completed { images })) => {
                info!(%id, images, "Generation complete");
            }
            Ok(Ok(RunOutcome::Cancelled { images })) => {
                info!(%id, images, "Generation cancelled");
            }
            Ok(Err(e)) => {
                error!(%id, "Generation failed: {:#}", e);
            }
            Err(payload) => {
                error!(%id, "Generation panicked: {}", panic_message(payload.as_ref()));
                // the pipeline may be mid-step; never reuse it
                self.cache.clear();
            }
        }

        if self.deps.reduce_memory {
            self.cache.clear();
        }

        self.set_state(WorkerState::Completed);
        self.emit(WorkerEvent::Progress(ProgressEvent::Idle));
        self.emit(WorkerEvent::TaskComplete);
    }

    fn run(&mut self, request: &GenerationRequest) -> anyhow::Result<RunOutcome> {
        let meta = &request.metadata;
        let mut progress = ProgressTracker::new(request.total_steps());
        let pipeline_steps = meta.pipeline_steps();

        self.set_state(WorkerState::Loading);
        let fingerprint = meta.fingerprint();
        let loader = self.deps.loader.clone();
        let pipeline = self
            .cache
            .get_or_load(&fingerprint, |fp| loader.load(fp))
            .with_context(|| format!("Failed to load pipeline {}", fingerprint))?;

        if self.cancel.is_cancelled() {
            return Ok(self.cancelled(0));
        }

        let job = SamplingJob {
            metadata: meta.clone(),
            image_count: request.image_count,
            source_image: self.prepare_source(request)?,
        };

        self.set_state(WorkerState::Sampling);
        let outcome = {
            let mut pipeline = pipeline.lock().map_err(|_| anyhow!("Pipeline lock poisoned"))?;
            let mut on_step = |update: StepUpdate<'_>| {
                if self.cancel.is_cancelled() {
                    self.set_state(WorkerState::Cancelling);
                    return ControlFlow::Break(());
                }

                let step = update.step.min(pipeline_steps.saturating_sub(1));
                let percent = progress.advance_to(step);
                self.emit(WorkerEvent::Progress(ProgressEvent::Percent(percent)));
                self.emit(WorkerEvent::Preview(update.latents.to_preview()));
                ControlFlow::Continue(())
            };
            pipeline.sample(&job, &mut on_step)?
        };
        drop(pipeline);

        let images = match outcome {
            SampleOutcome::Images(images) => images,
            SampleOutcome::Cancelled => return Ok(self.cancelled(0)),
        };
        if images.len() != request.image_count as usize {
            warn!(
                expected = request.image_count,
                got = images.len(),
                "Pipeline returned an unexpected image count"
            );
        }

        // sampling is done even if the pipeline reported fewer steps
        progress.advance_to(pipeline_steps.saturating_sub(1));

        let dir = self.deps.images_root.join(&request.collection);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create collection {}", dir.display()))?;

        let mut written = 0;
        for image in images {
            if self.cancel.is_cancelled() {
                return Ok(self.cancelled(written));
            }

            self.set_state(WorkerState::PostProcessing);
            let image = self
                .deps
                .post
                .apply(image, meta, |step| {
                    debug!(?step, "Post-processing step done");
                    let percent = progress.advance();
                    self.emit(WorkerEvent::Progress(ProgressEvent::Percent(percent)));
                })
                .context("Post-processing failed")?;

            self.set_state(WorkerState::Writing);
            let path = self
                .deps
                .writer
                .write(&image, meta, &dir)
                .context("Failed to write image")?;
            written += 1;

            let percent = progress.advance();
            self.emit(WorkerEvent::Progress(ProgressEvent::Percent(percent)));
            self.emit(WorkerEvent::ImageComplete(path));
        }

        Ok(RunOutcome::Completed { images: written })
    }

    /// Decode, resize and optionally preprocess the img2img source
    fn prepare_source(&self, request: &GenerationRequest) -> anyhow::Result<Option<RgbaImage>> {
        let meta = &request.metadata;
        let Some(img2img) = &meta.img2img else {
            return Ok(None);
        };

        let image = match &request.source_image {
            Some(image) => image.clone(),
            None => {
                let path = self.deps.images_root.join(&img2img.source_path);
                image::open(&path)
                    .with_context(|| format!("Failed to open source image {}", path.display()))?
                    .to_rgba8()
            }
        };

        let image = if image.dimensions() != (meta.width, meta.height) {
            imageops::resize(&image, meta.width, meta.height, imageops::FilterType::Lanczos3)
        } else {
            image
        };

        match (&img2img.conditioning, &self.deps.preprocessor) {
            (Conditioning::Control { preprocess: true, .. }, Some(preprocessor)) => {
                Ok(Some(preprocessor.preprocess(&image).context("Control preprocessing failed")?))
            }
            (Conditioning::Control { preprocess: true, .. }, None) => {
                warn!("No control preprocessor configured, using the source as is");
                Ok(Some(image))
            }
            _ => Ok(Some(image)),
        }
    }

    fn cancelled(&self, images: u32) -> RunOutcome {
        self.set_state(WorkerState::Cancelling);
        RunOutcome::Cancelled { images }
    }

    fn set_state(&self, next: WorkerState) {
        let mut state = lock_state(&self.state);
        if *state != next {
            debug!(from = state.label(), to = next.label(), "Worker state");
            *state = next;
        }
    }

    fn emit(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
