//! Seams to the model-backed collaborators.
//!
//! Sampling, upscaling and face restoration are provided by implementations
//! of these traits; the application only orchestrates them.

use std::ops::ControlFlow;
use image::RgbaImage;
use crate::error::Result;
use crate::latents::Latents;
use crate::metadata::{FaceParams, ImageMetadata, UpscaleParams};
use crate::model_types::Fingerprint;

/// Everything a pipeline needs for one sampling call
#[derive(Debug, Clone)]
pub struct SamplingJob {
    pub metadata: ImageMetadata,
    pub image_count: u32,
    /// Prepared img2img source, already resized to the target dimensions
    pub source_image: Option<RgbaImage>,
}

/// Handed to the step callback once per denoising step
#[derive(Debug)]
pub struct StepUpdate<'a> {
    /// 0-based step index
    pub step: u32,
    pub timestep: u32,
    pub latents: &'a Latents,
}

#[derive(Debug)]
pub enum SampleOutcome {
    Images(Vec<RgbaImage>),
    /// The step callback asked to stop
    Cancelled,
}

pub type StepCallback<'a> = dyn FnMut(StepUpdate<'_>) -> ControlFlow<()> + 'a;

pub trait SamplingPipeline: Send {
    fn fingerprint(&self) -> &Fingerprint;

    /// Run the denoising loop, calling `on_step` after every step.
    /// Must return `SampleOutcome::Cancelled` right after `on_step`
    /// returns `ControlFlow::Break`.
    fn sample(
        &mut self,
        job: &SamplingJob,
        on_step: &mut StepCallback<'_>,
    ) -> Result<SampleOutcome>;
}

pub trait PipelineLoader: Send + Sync {
    /// Check that `fingerprint` names a pipeline this loader can build,
    /// without loading it
    fn resolve(&self, fingerprint: &Fingerprint) -> Result<()> {
        let _ = fingerprint;
        Ok(())
    }

    fn load(&self, fingerprint: &Fingerprint) -> Result<Box<dyn SamplingPipeline>>;
}

pub trait Upscaler: Send + Sync {
    fn upscale(&self, image: &RgbaImage, params: &UpscaleParams) -> Result<RgbaImage>;
}

pub trait FaceRestorer: Send + Sync {
    /// Output dimensions equal input dimensions
    fn restore(&self, image: &RgbaImage, params: &FaceParams) -> Result<RgbaImage>;
}

/// Turns a source image into a control map (edges, depth, pose...)
pub trait ControlPreprocessor: Send + Sync {
    fn preprocess(&self, image: &RgbaImage) -> Result<RgbaImage>;
}
