use std::ops::RangeInclusive;
use chrono::{DateTime, Utc};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use sa_core::metadata::{Conditioning, ImageMetadata, Img2Img};
use crate::error::GenerationError;

/// Upscale factors the super-resolution models ship with
pub const UPSCALE_FACTORS: [u32; 2] = [2, 4];

pub const MAX_IMAGE_COUNT: u32 = 99;
pub const MAX_INFERENCE_STEPS: u32 = 99;
/// Accepted image edge lengths, in pixels
pub const SIZE_RANGE: RangeInclusive<u32> = 64..=1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Idle,
    Loading,
    Sampling,
    PostProcessing,
    Writing,
    Cancelling,
    Completed,
}

impl WorkerState {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Loading | Self::Sampling | Self::PostProcessing | Self::Writing | Self::Cancelling
        )
    }

    /// States a cancellation request can move out of
    pub fn can_cancel(&self) -> bool {
        matches!(self, Self::Loading | Self::Sampling | Self::PostProcessing | Self::Writing)
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Sampling => "sampling",
            Self::PostProcessing => "post-processing",
            Self::Writing => "writing",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
        }
    }
}

/// How a run ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { images: u32 },
    /// Stopped at a cancellation point; `images` were written before that
    Cancelled { images: u32 },
}

/// One generation job, fixed for the duration of its run
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub id: Uuid,
    pub submitted_at: DateTime<Utc>,
    pub metadata: ImageMetadata,
    pub image_count: u32,
    /// Collection (sub-directory of the image root) receiving the outputs
    pub collection: String,
    /// img2img source, if the caller already has it decoded. Otherwise it is
    /// read from `metadata.img2img.source_path`.
    pub source_image: Option<RgbaImage>,
}

impl GenerationRequest {
    pub fn new(metadata: ImageMetadata, image_count: u32, collection: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            submitted_at: Utc::now(),
            metadata,
            image_count,
            collection: collection.into(),
            source_image: None,
        }
    }

    pub fn with_source_image(mut self, image: RgbaImage) -> Self {
        self.source_image = Some(image);
        self
    }

    pub fn total_steps(&self) -> u32 {
        self.metadata.total_steps(self.image_count)
    }

    /// Reject requests no pipeline could run
    pub fn validate(&self) -> Result<(), GenerationError> {
        let meta = &self.metadata;
        let invalid = |msg: String| Err(GenerationError::Configuration(msg));

        if meta.model.trim().is_empty() {
            return invalid("no model selected".into());
        }
        if !(1..=MAX_IMAGE_COUNT).contains(&self.image_count) {
            return invalid(format!(
                "image count {} outside 1..={}",
                self.image_count, MAX_IMAGE_COUNT
            ));
        }
        if !(1..=MAX_INFERENCE_STEPS).contains(&meta.num_inference_steps) {
            return invalid(format!(
                "inference steps {} outside 1..={}",
                meta.num_inference_steps, MAX_INFERENCE_STEPS
            ));
        }
        let valid_edge = |edge: u32| SIZE_RANGE.contains(&edge) && edge % 8 == 0;
        if !valid_edge(meta.width) || !valid_edge(meta.height) {
            return invalid(format!(
                "size {}x{} must be multiples of 8 within {}..={}",
                meta.width,
                meta.height,
                SIZE_RANGE.start(),
                SIZE_RANGE.end()
            ));
        }
        if self.collection.is_empty()
            || self.collection.contains(['/', '\\'])
            || self.collection.starts_with('.')
        {
            return invalid(format!("invalid collection name '{}'", self.collection));
        }

        if let Some(Img2Img { source_path, conditioning }) = &meta.img2img {
            if self.source_image.is_none() && source_path.is_empty() {
                return invalid("img2img needs a source image".into());
            }
            match conditioning {
                Conditioning::Image { strength } => {
                    if !(*strength > 0.0 && *strength <= 1.0) {
                        return invalid(format!("img2img strength {} outside (0, 1]", strength));
                    }
                    if meta.pipeline_steps() == 0 {
                        return invalid("img2img strength leaves no steps to run".into());
                    }
                }
                Conditioning::Control { model, scale, guidance_start, guidance_end, .. } => {
                    if model.trim().is_empty() {
                        return invalid("no control model selected".into());
                    }
                    if *scale < 0.0 {
                        return invalid(format!("control scale {} is negative", scale));
                    }
                    if !(0.0..=1.0).contains(guidance_start)
                        || !(0.0..=1.0).contains(guidance_end)
                        || guidance_start > guidance_end
                    {
                        return invalid(format!(
                            "control guidance window {}..{} is invalid",
                            guidance_start, guidance_end
                        ));
                    }
                }
            }
        }

        if let Some(upscale) = &meta.upscale {
            if !UPSCALE_FACTORS.contains(&upscale.factor) {
                return invalid(format!("upscale factor {} not supported", upscale.factor));
            }
            if !is_unit(upscale.denoising_strength) || !is_unit(upscale.blend_strength) {
                return invalid("upscale strengths must lie in [0, 1]".into());
            }
        }
        if let Some(face) = &meta.face {
            if !is_unit(face.blend_strength) {
                return invalid("face blend strength must lie in [0, 1]".into());
            }
        }

        Ok(())
    }
}

fn is_unit(value: f32) -> bool {
    (0.0..=1.0).contains(&value)
}
