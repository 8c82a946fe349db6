//! Generation parameters and their persistence inside PNG files.
//!
//! The full [`ImageMetadata`] is stored as JSON in a single `iTXt` chunk so a
//! generated image carries everything needed to reproduce it.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tracing::warn;
use crate::error::{Error, Result};
use crate::model_types::{Fingerprint, PipelineKind, Scheduler};

/// `iTXt` keyword holding the serialized metadata
pub const METADATA_KEY: &str = "seed-alchemy";

pub const DEFAULT_MODEL: &str = "runwayml/stable-diffusion-v1-5";

/// How an img2img source image steers sampling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Conditioning {
    /// Plain strength blending: the source is noised up to `strength` and
    /// only that fraction of the schedule is run.
    Image { strength: f32 },
    /// Model-guided conditioning through an auxiliary control model
    Control {
        model: String,
        scale: f32,
        preprocess: bool,
        guidance_start: f32,
        guidance_end: f32,
    },
}

impl Default for Conditioning {
    fn default() -> Self {
        Self::Image { strength: 0.5 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Img2Img {
    /// Source path relative to the image root
    pub source_path: String,
    pub conditioning: Conditioning,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UpscaleParams {
    pub factor: u32,
    pub denoising_strength: f32,
    pub blend_strength: f32,
}

impl Default for UpscaleParams {
    fn default() -> Self {
        Self {
            factor: 2,
            denoising_strength: 0.75,
            blend_strength: 0.75,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceParams {
    pub blend_strength: f32,
}

impl Default for FaceParams {
    fn default() -> Self {
        Self { blend_strength: 0.75 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageMetadata {
    pub model: String,
    pub scheduler: Scheduler,
    pub prompt: String,
    pub negative_prompt: String,
    pub seed: u64,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    pub width: u32,
    pub height: u32,
    pub img2img: Option<Img2Img>,
    pub upscale: Option<UpscaleParams>,
    pub face: Option<FaceParams>,
}

impl Default for ImageMetadata {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            scheduler: Scheduler::default(),
            prompt: String::new(),
            negative_prompt: String::new(),
            seed: 1,
            num_inference_steps: 30,
            guidance_scale: 7.0,
            width: 512,
            height: 512,
            img2img: None,
            upscale: None,
            face: None,
        }
    }
}

impl ImageMetadata {
    pub fn pipeline_kind(&self) -> PipelineKind {
        match &self.img2img {
            None => PipelineKind::Txt2Img,
            Some(Img2Img { conditioning: Conditioning::Image { .. }, .. }) => PipelineKind::Img2Img,
            Some(Img2Img { conditioning: Conditioning::Control { model, .. }, .. }) => {
                PipelineKind::ControlNet { model: model.clone() }
            }
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(self.model.clone(), self.pipeline_kind())
    }

    /// Number of denoising steps the sampling pipeline will actually run.
    /// Strength-blended img2img only runs the tail of the schedule.
    pub fn pipeline_steps(&self) -> u32 {
        match &self.img2img {
            Some(Img2Img { conditioning: Conditioning::Image { strength }, .. }) => {
                (self.num_inference_steps as f32 * strength) as u32
            }
            _ => self.num_inference_steps,
        }
    }

    /// Progress units spent on each image after sampling: the write plus one
    /// per enabled post-processing stage.
    pub fn post_steps_per_image(&self) -> u32 {
        1 + self.upscale.is_some() as u32 + self.face.is_some() as u32
    }

    /// Saturates instead of overflowing on absurd image counts
    pub fn total_steps(&self, image_count: u32) -> u32 {
        image_count
            .saturating_mul(self.post_steps_per_image())
            .saturating_add(self.pipeline_steps())
    }

    /// Dimensions of a finished image. Face restoration never resizes.
    pub fn output_size(&self) -> (u32, u32) {
        let factor = self.upscale.map_or(1, |u| u.factor);
        (self.width.saturating_mul(factor), self.height.saturating_mul(factor))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Metadata(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Metadata(e.to_string()))
    }
}

/// Write `image` as an RGBA PNG carrying `metadata`.
///
/// The file is created with `create_new`; an existing file at `path` is an
/// `AlreadyExists` I/O error, never overwritten. A partially written file is
/// removed before the error is returned.
pub fn write_png(path: &Path, image: &RgbaImage, metadata: &ImageMetadata) -> Result<()> {
    let json = metadata.to_json()?;
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;

    let result = encode_png(file, image, json);
    if let Err(e) = &result {
        warn!(path = %path.display(), "PNG encode failed, removing partial file: {}", e);
        let _ = fs::remove_file(path);
    }
    result
}

fn encode_png(file: File, image: &RgbaImage, json: String) -> Result<()> {
    let mut encoder = png::Encoder::new(BufWriter::new(file), image.width(), image.height());
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    encoder.add_itxt_chunk(METADATA_KEY.to_string(), json)?;

    let mut writer = encoder.write_header()?;
    writer.write_image_data(image.as_raw())?;
    writer.finish()?;
    Ok(())
}

/// Read the generation metadata of a PNG, if it has any
pub fn read_png_metadata(path: &Path) -> Result<Option<ImageMetadata>> {
    let decoder = png::Decoder::new(BufReader::new(File::open(path)?));
    let reader = decoder.read_info()?;

    for chunk in &reader.info().utf8_text {
        if chunk.keyword == METADATA_KEY {
            let text = chunk.get_text()?;
            return ImageMetadata::from_json(&text).map(Some);
        }
    }

    Ok(None)
}
