use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use image::RgbaImage;
use tracing::{debug, info};
use sa_core::metadata::{self, ImageMetadata};
use crate::error::OutputError;
use crate::retry::RetryPolicy;

/// Next free sequential id in `dir`: one past the largest `NNNNN.png`.
/// Other file names are ignored.
pub fn next_image_id(dir: &Path) -> io::Result<u32> {
    let mut id = 0;
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        if let Some(n) = name.to_str().and_then(parse_image_id) {
            id = id.max(n);
        }
    }
    Ok(id + 1)
}

/// Id of a `NNNNN.png` file name
pub fn parse_image_id(file_name: &str) -> Option<u32> {
    let stem = file_name.strip_suffix(".png")?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

pub fn image_file_name(id: u32) -> String {
    format!("{:05}.png", id)
}

/// Persists images under sequential five-digit names.
///
/// The id is allocated from a directory scan right before each write, so
/// writers targeting the same directory must be serialized by the caller.
#[derive(Debug, Clone, Default)]
pub struct OutputWriter {
    retry: RetryPolicy,
}

impl OutputWriter {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    /// Write `image` with embedded `metadata` into `dir`, returning the
    /// written path. Each attempt allocates a fresh id.
    pub fn write(
        &self,
        image: &RgbaImage,
        meta: &ImageMetadata,
        dir: &Path,
    ) -> Result<PathBuf, OutputError> {
        let path = self.retry.run(|| -> Result<PathBuf, OutputError> {
            let path = dir.join(image_file_name(next_image_id(dir)?));
            metadata::write_png(&path, image, meta)?;
            Ok(path)
        })?;

        info!(path = %path.display(), "Image written");
        Ok(path)
    }

    /// Copy an external image into `dir`, keeping its generation metadata
    /// when it has any.
    pub fn import(&self, source: &Path, dir: &Path) -> Result<PathBuf, OutputError> {
        let image = image::open(source)
            .map_err(|e| OutputError::Encode(e.into()))?
            .to_rgba8();
        let meta = match metadata::read_png_metadata(source) {
            Ok(Some(meta)) => meta,
            Ok(None) | Err(_) => {
                debug!(source = %source.display(), "No generation metadata on import");
                ImageMetadata::default()
            }
        };

        self.write(&image, &meta, dir)
    }

    /// Move an existing image into `dir` under that directory's next id
    pub fn relocate(&self, source: &Path, dir: &Path) -> Result<PathBuf, OutputError> {
        let path = self.retry.run(|| -> Result<PathBuf, OutputError> {
            let target = dir.join(image_file_name(next_image_id(dir)?));
            if target.exists() {
                let taken = target.display().to_string();
                return Err(io::Error::new(io::ErrorKind::AlreadyExists, taken).into());
            }
            fs::rename(source, &target)?;
            Ok(target)
        })?;

        info!(from = %source.display(), to = %path.display(), "Image moved");
        Ok(path)
    }
}
