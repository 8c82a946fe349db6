// crates/sa-diffusion/src/synthetic.rs

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use image::{Rgba, RgbaImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;
use sa_core::latents::{Latents, LATENT_CHANNELS, LATENT_SCALE};
use sa_core::metadata::{Conditioning, Img2Img};
use sa_core::pipeline::{
    PipelineLoader, SampleOutcome, SamplingJob, SamplingPipeline, StepCallback, StepUpdate,
};
use sa_core::{Error, Fingerprint, Result};

/// Training schedule length the timesteps are spread over
const TRAIN_TIMESTEPS: u32 = 1000;

/// Deterministic stand-in for a diffusion pipeline.
///
/// Runs the real step protocol (latents per step, callback, early stop) but
/// renders images procedurally from the seed and a colour hint in the
/// prompt, so the whole generation flow works without model weights.
pub struct SyntheticPipeline {
    fingerprint: Fingerprint,
    step_delay: Duration,
}

impl SyntheticPipeline {
    pub fn new(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            step_delay: Duration::ZERO,
        }
    }

    /// Sleep this long inside every step, to mimic real sampling cost
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }
}

impl SamplingPipeline for SyntheticPipeline {
    fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    fn sample(
        &mut self,
        job: &SamplingJob,
        on_step: &mut StepCallback<'_>,
    ) -> Result<SampleOutcome> {
        let meta = &job.metadata;
        let steps = meta.pipeline_steps();
        let (latent_w, latent_h) = (meta.width / LATENT_SCALE, meta.height / LATENT_SCALE);
        let base_color = prompt_color(&meta.prompt);

        debug!(steps, width = meta.width, height = meta.height, "Synthetic sampling");

        let mut rng = StdRng::seed_from_u64(meta.seed);
        let plane = latent_w as usize * latent_h as usize;
        let noise: Vec<f32> = (0..LATENT_CHANNELS * plane)
            .map(|_| rng.gen_range(-1.0..1.0))
            .collect();
        let target = target_latents(base_color);

        for step in 0..steps {
            if !self.step_delay.is_zero() {
                std::thread::sleep(self.step_delay);
            }

            let t = (step + 1) as f32 / steps as f32;
            let data = noise
                .iter()
                .enumerate()
                .map(|(i, n)| n * (1.0 - t) + target[i / plane] * t)
                .collect();
            let latents = Latents::new(latent_w, latent_h, data);

            let update = StepUpdate {
                step,
                timestep: TRAIN_TIMESTEPS - step * TRAIN_TIMESTEPS / steps,
                latents: &latents,
            };
            if let ControlFlow::Break(()) = on_step(update) {
                debug!(step, "Sampling stopped by callback");
                return Ok(SampleOutcome::Cancelled);
            }
        }

        let images = (0..job.image_count)
            .map(|index| {
                let seed = meta.seed.wrapping_add(index as u64);
                let mut image = generate_view(meta.width, meta.height, seed, base_color);
                if let (Some(source), Some(img2img)) = (&job.source_image, &meta.img2img) {
                    blend_source(&mut image, source, img2img);
                }
                image
            })
            .collect();

        Ok(SampleOutcome::Images(images))
    }
}

/// Loads [`SyntheticPipeline`]s, counting every load
#[derive(Default)]
pub struct SyntheticLoader {
    known_models: Option<Vec<String>>,
    step_delay: Duration,
    loads: AtomicUsize,
}

impl SyntheticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only resolve the listed model ids
    pub fn restricted_to(mut self, models: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.known_models = Some(models.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl PipelineLoader for SyntheticLoader {
    fn resolve(&self, fingerprint: &Fingerprint) -> Result<()> {
        if fingerprint.model.trim().is_empty() {
            return Err(Error::Pipeline("no model id given".into()));
        }
        if let Some(known) = &self.known_models {
            if !known.iter().any(|m| *m == fingerprint.model) {
                return Err(Error::Pipeline(format!("unknown model '{}'", fingerprint.model)));
            }
        }
        Ok(())
    }

    fn load(&self, fingerprint: &Fingerprint) -> Result<Box<dyn SamplingPipeline>> {
        self.resolve(fingerprint)?;

        self.loads.fetch_add(1, Ordering::SeqCst);
        debug!(%fingerprint, "Loading synthetic pipeline");

        Ok(Box::new(SyntheticPipeline::new(fingerprint.clone()).with_step_delay(self.step_delay)))
    }
}

/// Per-channel latent values the denoising converges to
fn target_latents(base_color: [u8; 3]) -> [f32; LATENT_CHANNELS] {
    let [r, g, b] = base_color.map(|c| c as f32 / 127.5 - 1.0);
    [r, g, b, -(r + g + b) / 3.0]
}

/// Base colours a prompt can map to
const PALETTE: [[u8; 3]; 8] = [
    [228, 92, 84],
    [92, 128, 236],
    [104, 196, 112],
    [240, 208, 96],
    [176, 112, 224],
    [236, 148, 72],
    [88, 196, 200],
    [212, 120, 168],
];

/// Colour of an empty prompt
const NEUTRAL: [u8; 3] = [150, 150, 180];

/// Pick a palette colour from an FNV-1a hash of the normalized prompt
fn prompt_color(prompt: &str) -> [u8; 3] {
    let normalized = prompt.trim().to_lowercase();
    if normalized.is_empty() {
        return NEUTRAL;
    }

    let hash = normalized
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x0100_0000_01b3));
    PALETTE[(hash % PALETTE.len() as u64) as usize]
}

/// Render a lit sphere over a gradient; the seed picks the light direction
fn generate_view(width: u32, height: u32, seed: u64, base_color: [u8; 3]) -> RgbaImage {
    let mut img = RgbaImage::new(width, height);

    let center_x = width as f32 / 2.0;
    let center_y = height as f32 / 2.0;
    let radius = width.min(height) as f32 * 0.3;

    let angle = (seed % 360) as f32 * std::f32::consts::PI / 180.0;

    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let rx = x as f32 - center_x;
        let ry = y as f32 - center_y;
        let dist = (rx * rx + ry * ry).sqrt();

        *pixel = if dist < radius {
            let depth = (1.0 - (dist / radius).powi(2)).sqrt();
            let brightness = depth * 0.7 + 0.3;

            let light_dx = rx - angle.cos() * radius * 0.66;
            let light_dy = ry - angle.sin() * radius * 0.66;
            let light_dist = (light_dx * light_dx + light_dy * light_dy).sqrt();
            let light_factor = (1.0 - (light_dist / (radius * 2.0)).min(1.0)) * 0.3 + 0.7;

            let shade = brightness * light_factor;
            Rgba([
                (base_color[0] as f32 * shade) as u8,
                (base_color[1] as f32 * shade) as u8,
                (base_color[2] as f32 * shade) as u8,
                255,
            ])
        } else {
            let bg = 0.2 + (y as f32 / height as f32) * 0.1;
            Rgba([(50.0 * bg) as u8, (50.0 * bg) as u8, (60.0 * bg) as u8, 255])
        };
    }

    img
}

/// Keep `1 - strength` of the source for strength blending, or lay the
/// control map over the render weighted by the control scale.
fn blend_source(image: &mut RgbaImage, source: &RgbaImage, img2img: &Img2Img) {
    if source.dimensions() != image.dimensions() {
        return;
    }

    let keep = match &img2img.conditioning {
        Conditioning::Image { strength } => 1.0 - strength,
        Conditioning::Control { scale, .. } => scale.clamp(0.0, 1.0) * 0.5,
    };

    for (dst, src) in image.pixels_mut().zip(source.pixels()) {
        for c in 0..3 {
            dst[c] = (dst[c] as f32 * (1.0 - keep) + src[c] as f32 * keep) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_core::metadata::ImageMetadata;
    use sa_core::PipelineKind;

    fn job(steps: u32, count: u32) -> SamplingJob {
        SamplingJob {
            metadata: ImageMetadata {
                prompt: "a red cube".into(),
                num_inference_steps: steps,
                width: 64,
                height: 32,
                ..Default::default()
            },
            image_count: count,
            source_image: None,
        }
    }

    fn pipeline() -> SyntheticPipeline {
        SyntheticPipeline::new(Fingerprint::new("test", PipelineKind::Txt2Img))
    }

    #[test]
    fn test_calls_back_once_per_step() {
        let mut seen = Vec::new();
        let outcome = pipeline()
            .sample(&job(5, 2), &mut |update| {
                assert_eq!(update.latents.width, 8);
                assert_eq!(update.latents.height, 4);
                seen.push(update.step);
                ControlFlow::Continue(())
            })
            .unwrap();

        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        match outcome {
            SampleOutcome::Images(images) => {
                assert_eq!(images.len(), 2);
                assert_eq!(images[0].dimensions(), (64, 32));
            }
            SampleOutcome::Cancelled => panic!("not cancelled"),
        }
    }

    #[test]
    fn test_break_stops_sampling() {
        let mut calls = 0;
        let outcome = pipeline()
            .sample(&job(10, 1), &mut |update| {
                calls += 1;
                if update.step == 2 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) }
            })
            .unwrap();

        assert_eq!(calls, 3);
        assert!(matches!(outcome, SampleOutcome::Cancelled));
    }

    #[test]
    fn test_same_seed_same_image() {
        let mut a = pipeline();
        let mut b = pipeline();
        let run = |p: &mut SyntheticPipeline| {
            match p.sample(&job(2, 1), &mut |_| ControlFlow::Continue(())).unwrap() {
                SampleOutcome::Images(mut images) => images.remove(0),
                SampleOutcome::Cancelled => unreachable!(),
            }
        };
        assert_eq!(run(&mut a), run(&mut b));
    }

    #[test]
    fn test_prompt_color_is_stable() {
        assert_eq!(prompt_color(""), NEUTRAL);
        assert_eq!(prompt_color("  "), NEUTRAL);
        assert_eq!(prompt_color("A Red Apple "), prompt_color("a red apple"));
        assert!(PALETTE.contains(&prompt_color("a lighthouse at dusk")));
    }

    #[test]
    fn test_loader_rejects_unknown_models() {
        let loader = SyntheticLoader::new().restricted_to(["sd-1.5"]);
        assert!(loader.load(&Fingerprint::new("sd-1.5", PipelineKind::Txt2Img)).is_ok());
        assert!(loader.load(&Fingerprint::new("other", PipelineKind::Txt2Img)).is_err());
        let blank = Fingerprint::new(" ", PipelineKind::Txt2Img);
        assert!(SyntheticLoader::new().load(&blank).is_err());
        assert_eq!(loader.load_count(), 1);

        assert!(loader.resolve(&Fingerprint::new("other", PipelineKind::Txt2Img)).is_err());
        assert!(loader.resolve(&Fingerprint::new("sd-1.5", PipelineKind::Txt2Img)).is_ok());
        assert_eq!(loader.load_count(), 1);
    }
}
