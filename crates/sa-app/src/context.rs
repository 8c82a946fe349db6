use std::path::PathBuf;
use std::sync::Arc;
use anyhow::Context;
use tracing::{info, warn};
use uuid::Uuid;
use sa_core::pipeline::PipelineLoader;
use sa_diffusion::{BlendFaceRestorer, EdgePreprocessor, LanczosUpscaler, SyntheticLoader};
use crate::collections::Collections;
use crate::config::AppConfig;
use crate::error::GenerationError;
use crate::events::WorkerEvent;
use crate::job::GenerationRequest;
use crate::output::OutputWriter;
use crate::postprocess::PostProcessor;
use crate::settings::{Overrides, Settings};
use crate::worker::{GenerationWorker, WorkerDeps};

/// Everything a running application owns, built once at startup.
///
/// The worker (and with it the pipeline cache) is shut down when the
/// context is dropped.
pub struct AppContext {
    pub config: AppConfig,
    pub settings: Settings,
    pub collections: Collections,
    worker: GenerationWorker,
}

impl AppContext {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        Self::with_loader(config, Arc::new(SyntheticLoader::new()))
    }

    pub fn with_loader(config: AppConfig, loader: Arc<dyn PipelineLoader>) -> anyhow::Result<Self> {
        let settings = Settings::load(&config.settings_path)?;
        let collections = Collections::open(&config.images_path, &config.thumbnails_path)?;

        let reduce_memory = config.reduce_memory || settings.reduce_memory;
        let worker = GenerationWorker::spawn(WorkerDeps {
            loader,
            post: PostProcessor::new(Arc::new(LanczosUpscaler), Arc::new(BlendFaceRestorer)),
            preprocessor: Some(Arc::new(EdgePreprocessor)),
            writer: OutputWriter::default(),
            images_root: config.images_path.clone(),
            reduce_memory,
        });

        info!(
            images = %config.images_path.display(),
            reduce_memory,
            "Application context ready"
        );

        Ok(Self {
            config,
            settings,
            collections,
            worker,
        })
    }

    pub fn worker(&self) -> &GenerationWorker {
        &self.worker
    }

    /// Request built from the current settings
    pub fn request_from_settings(&self) -> GenerationRequest {
        self.settings.request(&Overrides::default())
    }

    /// Hand `request` to the worker, creating its collection if needed
    pub fn submit(&mut self, request: GenerationRequest) -> Result<Uuid, GenerationError> {
        request.validate()?;
        if !self.collections.contains(&request.collection) {
            self.collections
                .create(&request.collection)
                .map_err(|e| GenerationError::Configuration(format!("{:#}", e)))?;
        }

        let id = request.id;
        self.worker.start(request)?;
        Ok(id)
    }

    /// Returns whether a run was active
    pub fn cancel(&self) -> bool {
        self.worker.cancel()
    }

    /// Drain pending worker events without blocking
    pub fn pump_events(&mut self) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.worker.try_recv_event() {
            self.on_event(&event);
            events.push(event);
        }
        events
    }

    /// Submit `request` and block until its run ends, passing every event to
    /// `on_event`. Returns the written image paths.
    pub fn run_to_completion(
        &mut self,
        request: GenerationRequest,
        on_event: impl FnMut(&WorkerEvent),
    ) -> anyhow::Result<Vec<PathBuf>> {
        self.submit(request)?;
        self.wait_for_run(on_event)
    }

    /// Block until the submitted run ends. Returns the written image paths.
    pub fn wait_for_run(
        &mut self,
        mut on_event: impl FnMut(&WorkerEvent),
    ) -> anyhow::Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        loop {
            let event = self.worker.recv_event().context("Generation worker stopped")?;
            self.on_event(&event);
            on_event(&event);

            match event {
                WorkerEvent::ImageComplete(path) => written.push(path),
                WorkerEvent::TaskComplete => break,
                _ => {}
            }
        }

        Ok(written)
    }

    pub fn save_settings(&self) -> anyhow::Result<()> {
        self.settings.save(&self.config.settings_path)
    }

    fn on_event(&self, event: &WorkerEvent) {
        if let WorkerEvent::ImageComplete(path) = event {
            let rel_path = path
                .strip_prefix(&self.config.images_path)
                .ok()
                .and_then(|p| p.to_str())
                .map(|p| p.replace('\\', "/"));

            match rel_path {
                Some(rel_path) => {
                    if let Err(e) = self.collections.thumbnail(&rel_path) {
                        warn!(path = %path.display(), "Failed to create thumbnail: {:#}", e);
                    }
                }
                None => warn!(path = %path.display(), "Image written outside the image root"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use sa_core::progress::ProgressEvent;

    fn config(root: &Path) -> AppConfig {
        AppConfig {
            images_path: root.join("images"),
            thumbnails_path: root.join("thumbnails"),
            settings_path: root.join("settings.json"),
            port: 0,
            reduce_memory: false,
        }
    }

    fn quick_settings() -> Settings {
        Settings {
            prompt: "green hills".into(),
            num_inference_steps: 3,
            num_images_per_prompt: 2,
            width: 64,
            height: 64,
            ..Default::default()
        }
    }

    #[test]
    fn test_run_writes_images_and_thumbnails() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = AppContext::new(config(root.path())).unwrap();
        ctx.settings = quick_settings();

        let mut percents = Vec::new();
        let written = ctx
            .run_to_completion(ctx.request_from_settings(), |event| {
                if let WorkerEvent::Progress(ProgressEvent::Percent(p)) = event {
                    percents.push(*p);
                }
            })
            .unwrap();

        assert_eq!(written.len(), 2);
        assert_eq!(percents.last(), Some(&100));
        assert!(root.path().join("thumbnails/outputs/00001.webp").exists());
        assert!(root.path().join("thumbnails/outputs/00002.webp").exists());
        assert_eq!(ctx.collections.images("outputs").unwrap().len(), 2);
    }

    #[test]
    fn test_submit_creates_collection() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = AppContext::new(config(root.path())).unwrap();
        ctx.settings = Settings { collection: "landscapes".into(), ..quick_settings() };

        let written = ctx.run_to_completion(ctx.request_from_settings(), |_| {}).unwrap();
        assert!(ctx.collections.contains("landscapes"));
        assert!(written.iter().all(|p| p.starts_with(root.path().join("images/landscapes"))));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = AppContext::new(config(root.path())).unwrap();
        ctx.settings = Settings { width: 100, ..quick_settings() };

        let result = ctx.submit(ctx.request_from_settings());
        assert!(matches!(result, Err(GenerationError::Configuration(_))));
        assert!(ctx.pump_events().is_empty());

        ctx.settings = Settings { model: String::new(), ..quick_settings() };
        assert!(ctx.submit(ctx.request_from_settings()).is_err());
        assert!(!ctx.cancel());
    }

    #[test]
    fn test_pump_events_drains_a_run() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = AppContext::new(config(root.path())).unwrap();
        ctx.settings = quick_settings();

        ctx.submit(ctx.request_from_settings()).unwrap();

        let mut events = Vec::new();
        while !events.iter().any(WorkerEvent::is_terminal) {
            events.extend(ctx.pump_events());
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(events.iter().filter(|e| matches!(e, WorkerEvent::ImageComplete(_))).count(), 2);
    }

    #[test]
    fn test_settings_persist() {
        let root = tempfile::tempdir().unwrap();
        {
            let mut ctx = AppContext::new(config(root.path())).unwrap();
            ctx.settings.prompt = "saved prompt".into();
            ctx.save_settings().unwrap();
        }

        let ctx = AppContext::new(config(root.path())).unwrap();
        assert_eq!(ctx.settings.prompt, "saved prompt");
    }
}
