use std::fs;
use std::io;
use std::path::Path;
use anyhow::Context;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use sa_core::metadata::{
    Conditioning, FaceParams, ImageMetadata, Img2Img, UpscaleParams, DEFAULT_MODEL,
};
use sa_core::Scheduler;
use crate::job::GenerationRequest;

/// Largest seed handed out when seeds are randomised
pub const MAX_RANDOM_SEED: u64 = 0x7fff_ffff_ffff_ffff;

/// Persisted user preferences and generation defaults.
///
/// Keys missing from the file fall back to their defaults, so older files
/// keep loading as fields are added.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub reduce_memory: bool,
    pub safety_checker: bool,
    pub collection: String,

    pub model: String,
    pub scheduler: Scheduler,
    pub prompt: String,
    pub negative_prompt: String,
    pub manual_seed: bool,
    pub seed: u64,
    pub num_images_per_prompt: u32,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    pub width: u32,
    pub height: u32,

    pub img2img_enabled: bool,
    pub img2img_source: String,
    pub img2img_strength: f32,

    pub control_net_enabled: bool,
    pub control_net_model: String,
    pub control_net_scale: f32,
    pub control_net_preprocess: bool,
    pub control_net_guidance_start: f32,
    pub control_net_guidance_end: f32,

    pub upscale_enabled: bool,
    pub upscale_factor: u32,
    pub upscale_denoising: f32,
    pub upscale_blend: f32,

    pub face_enabled: bool,
    pub face_blend: f32,
}

impl Default for Settings {
    fn default() -> Self {
        let upscale = UpscaleParams::default();

        Self {
            reduce_memory: true,
            safety_checker: true,
            collection: "outputs".into(),
            model: DEFAULT_MODEL.into(),
            scheduler: Scheduler::default(),
            prompt: String::new(),
            negative_prompt: String::new(),
            manual_seed: false,
            seed: 1,
            num_images_per_prompt: 1,
            num_inference_steps: 30,
            guidance_scale: 7.0,
            width: 512,
            height: 512,
            img2img_enabled: false,
            img2img_source: String::new(),
            img2img_strength: 0.5,
            control_net_enabled: false,
            control_net_model: "canny".into(),
            control_net_scale: 1.0,
            control_net_preprocess: true,
            control_net_guidance_start: 0.0,
            control_net_guidance_end: 1.0,
            upscale_enabled: false,
            upscale_factor: upscale.factor,
            upscale_denoising: upscale.denoising_strength,
            upscale_blend: upscale.blend_strength,
            face_enabled: false,
            face_blend: FaceParams::default().blend_strength,
        }
    }
}

impl Settings {
    /// Load from `path`; a missing file gives the defaults
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match fs::read_to_string(path) {
            Ok(json) => {
                let settings = serde_json::from_str(&json)
                    .with_context(|| format!("Failed to parse settings {}", path.display()))?;
                debug!(path = %path.display(), "Settings loaded");
                Ok(settings)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No settings file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to read settings {}", path.display())),
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write settings {}", path.display()))?;
        Ok(())
    }

    /// Request from these settings with `overrides` applied on top. An
    /// explicit seed counts as a manual seed.
    pub fn request(&self, overrides: &Overrides) -> GenerationRequest {
        let mut meta = self.to_metadata();
        let o = overrides.clone();

        if let Some(prompt) = o.prompt {
            meta.prompt = prompt;
        }
        if let Some(negative_prompt) = o.negative_prompt {
            meta.negative_prompt = negative_prompt;
        }
        if let Some(model) = o.model {
            meta.model = model;
        }
        if let Some(scheduler) = o.scheduler {
            meta.scheduler = scheduler;
        }
        if let Some(seed) = o.seed {
            meta.seed = seed;
        }
        if let Some(steps) = o.steps {
            meta.num_inference_steps = steps;
        }
        if let Some(guidance_scale) = o.guidance_scale {
            meta.guidance_scale = guidance_scale;
        }
        if let Some(width) = o.width {
            meta.width = width;
        }
        if let Some(height) = o.height {
            meta.height = height;
        }
        if let Some(factor) = o.upscale {
            meta.upscale = Some(UpscaleParams { factor, ..meta.upscale.unwrap_or_default() });
        }
        if let Some(face) = o.face {
            meta.face = face.then(|| meta.face.unwrap_or_default());
        }

        GenerationRequest::new(
            meta,
            o.count.unwrap_or(self.num_images_per_prompt),
            o.collection.unwrap_or_else(|| self.collection.clone()),
        )
    }

    /// Metadata for the next request. Draws a fresh seed unless
    /// `manual_seed` is set. Control conditioning wins over plain img2img
    /// when both are enabled.
    pub fn to_metadata(&self) -> ImageMetadata {
        let seed = if self.manual_seed {
            self.seed
        } else {
            rand::thread_rng().gen_range(0..=MAX_RANDOM_SEED)
        };

        let conditioning = if self.control_net_enabled {
            Some(Conditioning::Control {
                model: self.control_net_model.clone(),
                scale: self.control_net_scale,
                preprocess: self.control_net_preprocess,
                guidance_start: self.control_net_guidance_start,
                guidance_end: self.control_net_guidance_end,
            })
        } else if self.img2img_enabled {
            Some(Conditioning::Image { strength: self.img2img_strength })
        } else {
            None
        };

        ImageMetadata {
            model: self.model.clone(),
            scheduler: self.scheduler,
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            seed,
            num_inference_steps: self.num_inference_steps,
            guidance_scale: self.guidance_scale,
            width: self.width,
            height: self.height,
            img2img: conditioning.map(|conditioning| Img2Img {
                source_path: self.img2img_source.clone(),
                conditioning,
            }),
            upscale: self.upscale_enabled.then(|| UpscaleParams {
                factor: self.upscale_factor,
                denoising_strength: self.upscale_denoising,
                blend_strength: self.upscale_blend,
            }),
            face: self.face_enabled.then(|| FaceParams { blend_strength: self.face_blend }),
        }
    }
}

/// Per-request changes to the stored settings, as sent by the CLI and the
/// HTTP backend
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Overrides {
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub model: Option<String>,
    pub scheduler: Option<Scheduler>,
    pub seed: Option<u64>,
    pub steps: Option<u32>,
    pub guidance_scale: Option<f32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub count: Option<u32>,
    pub collection: Option<String>,
    /// Upscale factor; enables upscaling
    pub upscale: Option<u32>,
    pub face: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("settings.json")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.collection, "outputs");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/settings.json");

        let settings = Settings {
            prompt: "lighthouse".into(),
            upscale_enabled: true,
            ..Default::default()
        };
        settings.save(&path).unwrap();

        assert_eq!(Settings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "prompt": "fog", "width": 768 }"#).unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.prompt, "fog");
        assert_eq!(settings.width, 768);
        assert_eq!(settings.height, 512);
        assert_eq!(settings.scheduler, Scheduler::EulerAncestral);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(Settings::load(&path).is_err());
    }

    #[test]
    fn test_manual_seed_is_kept() {
        let settings = Settings { manual_seed: true, seed: 1234, ..Default::default() };
        assert_eq!(settings.to_metadata().seed, 1234);
    }

    #[test]
    fn test_random_seed_in_range() {
        let settings = Settings::default();
        for _ in 0..20 {
            assert!(settings.to_metadata().seed <= MAX_RANDOM_SEED);
        }
    }

    #[test]
    fn test_to_metadata_sections() {
        let plain = Settings { manual_seed: true, ..Default::default() }.to_metadata();
        assert!(plain.img2img.is_none() && plain.upscale.is_none() && plain.face.is_none());

        let settings = Settings {
            img2img_enabled: true,
            img2img_source: "outputs/00001.png".into(),
            control_net_enabled: true,
            face_enabled: true,
            ..Default::default()
        };
        let meta = settings.to_metadata();
        let img2img = meta.img2img.unwrap();
        assert_eq!(img2img.source_path, "outputs/00001.png");
        assert!(matches!(
            img2img.conditioning,
            Conditioning::Control { ref model, .. } if model == "canny"
        ));
        assert_eq!(meta.face, Some(FaceParams::default()));
    }

    #[test]
    fn test_overrides_win() {
        let settings = Settings { face_enabled: true, ..Default::default() };
        let overrides = Overrides {
            prompt: Some("night market".into()),
            seed: Some(7),
            count: Some(3),
            collection: Some("markets".into()),
            upscale: Some(4),
            face: Some(false),
            ..Default::default()
        };

        let request = settings.request(&overrides);
        assert_eq!(request.metadata.prompt, "night market");
        assert_eq!(request.metadata.seed, 7);
        assert_eq!(request.image_count, 3);
        assert_eq!(request.collection, "markets");
        assert_eq!(request.metadata.upscale.map(|u| u.factor), Some(4));
        assert_eq!(request.metadata.face, None);

        let plain = settings.request(&Overrides::default());
        assert_eq!(plain.collection, "outputs");
        assert_eq!(plain.image_count, 1);
        assert!(plain.metadata.face.is_some());
    }
}
