use image::{imageops, DynamicImage, RgbaImage};
use sa_core::metadata::{FaceParams, UpscaleParams};
use sa_core::pipeline::{ControlPreprocessor, FaceRestorer, Upscaler};
use sa_core::{Error, Result};

/// Resamples with Lanczos3, blended against a nearest-neighbour resize
#[derive(Debug, Default, Clone, Copy)]
pub struct LanczosUpscaler;

impl Upscaler for LanczosUpscaler {
    fn upscale(&self, image: &RgbaImage, params: &UpscaleParams) -> Result<RgbaImage> {
        if params.factor == 0 {
            return Err(Error::Processor("upscale factor must be positive".into()));
        }

        let (w, h) = (image.width() * params.factor, image.height() * params.factor);
        let mut sharp = imageops::resize(image, w, h, imageops::FilterType::Lanczos3);
        if params.denoising_strength > 0.0 {
            sharp = imageops::blur(&sharp, params.denoising_strength * 0.8);
        }
        let plain = imageops::resize(image, w, h, imageops::FilterType::Nearest);

        Ok(blend(&plain, &sharp, params.blend_strength))
    }
}

/// Unsharp-mask restoration blended over the input
#[derive(Debug, Default, Clone, Copy)]
pub struct BlendFaceRestorer;

impl FaceRestorer for BlendFaceRestorer {
    fn restore(&self, image: &RgbaImage, params: &FaceParams) -> Result<RgbaImage> {
        let restored = imageops::unsharpen(image, 1.5, 2);
        Ok(blend(image, &restored, params.blend_strength))
    }
}

/// Laplacian edge map, for control conditioning
#[derive(Debug, Default, Clone, Copy)]
pub struct EdgePreprocessor;

impl ControlPreprocessor for EdgePreprocessor {
    fn preprocess(&self, image: &RgbaImage) -> Result<RgbaImage> {
        let gray = imageops::grayscale(image);
        let edges = imageops::filter3x3(&gray, &[0.0, -1.0, 0.0, -1.0, 4.0, -1.0, 0.0, -1.0, 0.0]);
        Ok(DynamicImage::ImageLuma8(edges).to_rgba8())
    }
}

/// `base * (1 - amount) + over * amount`, channel-wise
fn blend(base: &RgbaImage, over: &RgbaImage, amount: f32) -> RgbaImage {
    let amount = amount.clamp(0.0, 1.0);
    let mut out = base.clone();
    for (dst, src) in out.pixels_mut().zip(over.pixels()) {
        for c in 0..4 {
            dst[c] = (dst[c] as f32 * (1.0 - amount) + src[c] as f32 * amount).round() as u8;
        }
    }
    out
}
