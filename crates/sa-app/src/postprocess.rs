use std::sync::Arc;
use image::RgbaImage;
use tracing::debug;
use sa_core::metadata::ImageMetadata;
use sa_core::pipeline::{FaceRestorer, Upscaler};
use sa_core::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostStep {
    Upscaled,
    FaceRestored,
}

/// Optional upscale followed by optional face restoration.
///
/// Order is fixed: face restoration works at the upscaled resolution.
#[derive(Clone)]
pub struct PostProcessor {
    upscaler: Arc<dyn Upscaler>,
    face_restorer: Arc<dyn FaceRestorer>,
}

impl PostProcessor {
    pub fn new(upscaler: Arc<dyn Upscaler>, face_restorer: Arc<dyn FaceRestorer>) -> Self {
        Self {
            upscaler,
            face_restorer,
        }
    }

    /// Run the enabled stages, calling `on_step` after each one that ran
    pub fn apply(
        &self,
        image: RgbaImage,
        metadata: &ImageMetadata,
        mut on_step: impl FnMut(PostStep),
    ) -> Result<RgbaImage> {
        let mut image = image;

        if let Some(params) = &metadata.upscale {
            debug!(factor = params.factor, "Upscaling");
            image = self.upscaler.upscale(&image, params)?;
            on_step(PostStep::Upscaled);
        }

        if let Some(params) = &metadata.face {
            debug!(blend = params.blend_strength, "Restoring faces");
            image = self.face_restorer.restore(&image, params)?;
            on_step(PostStep::FaceRestored);
        }

        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use sa_core::metadata::{FaceParams, UpscaleParams};
    use sa_diffusion::{BlendFaceRestorer, LanczosUpscaler};

    /// Records the dimensions it was handed
    #[derive(Default)]
    struct SpyRestorer(Mutex<Vec<(u32, u32)>>);

    impl FaceRestorer for SpyRestorer {
        fn restore(&self, image: &RgbaImage, _params: &FaceParams) -> Result<RgbaImage> {
            self.0.lock().unwrap().push(image.dimensions());
            Ok(image.clone())
        }
    }

    fn processor() -> PostProcessor {
        PostProcessor::new(Arc::new(LanczosUpscaler), Arc::new(BlendFaceRestorer))
    }

    #[test]
    fn test_nothing_enabled() {
        let mut steps = Vec::new();
        let out = processor()
            .apply(RgbaImage::new(16, 16), &ImageMetadata::default(), |s| steps.push(s))
            .unwrap();

        assert_eq!(out.dimensions(), (16, 16));
        assert!(steps.is_empty());
    }

    #[test]
    fn test_upscale_then_face() {
        let spy = Arc::new(SpyRestorer::default());
        let processor = PostProcessor::new(Arc::new(LanczosUpscaler), spy.clone());
        let meta = ImageMetadata {
            upscale: Some(UpscaleParams { factor: 2, ..Default::default() }),
            face: Some(FaceParams::default()),
            ..Default::default()
        };

        let mut steps = Vec::new();
        let out = processor.apply(RgbaImage::new(16, 8), &meta, |s| steps.push(s)).unwrap();

        assert_eq!(steps, vec![PostStep::Upscaled, PostStep::FaceRestored]);
        assert_eq!(out.dimensions(), (32, 16));
        assert_eq!(*spy.0.lock().unwrap(), vec![(32, 16)]);
    }

    #[test]
    fn test_face_only_keeps_size() {
        let meta = ImageMetadata { face: Some(FaceParams::default()), ..Default::default() };

        let mut steps = Vec::new();
        let out = processor().apply(RgbaImage::new(16, 8), &meta, |s| steps.push(s)).unwrap();

        assert_eq!(steps, vec![PostStep::FaceRestored]);
        assert_eq!(out.dimensions(), (16, 8));
    }

    #[test]
    fn test_upscale_only() {
        let meta = ImageMetadata {
            upscale: Some(UpscaleParams { factor: 4, ..Default::default() }),
            ..Default::default()
        };

        let out = processor().apply(RgbaImage::new(8, 8), &meta, |_| {}).unwrap();
        assert_eq!(out.dimensions(), (8 * 4, 8 * 4));
    }
}
