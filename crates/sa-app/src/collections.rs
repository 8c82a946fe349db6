use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use anyhow::{bail, Context};
use image::{imageops, RgbaImage};
use tracing::{debug, info};
use crate::error::AppError;
use crate::output::{image_file_name, parse_image_id, OutputWriter};

pub const DEFAULT_COLLECTION: &str = "outputs";

/// Edge length of the square thumbnails
pub const THUMBNAIL_SIZE: u32 = 256;

/// Named sub-directories of the image root, plus the thumbnail mirror of
/// each.
///
/// Images are addressed by paths relative to the image root
/// (`outputs/00003.png`), which is what image metadata stores as img2img
/// source.
pub struct Collections {
    images_root: PathBuf,
    thumbnails_root: PathBuf,
    names: Vec<String>,
    writer: OutputWriter,
}

impl Collections {
    /// Create both roots if needed and scan the existing collections. An
    /// empty image root gets the default collection.
    pub fn open(
        images_root: impl Into<PathBuf>,
        thumbnails_root: impl Into<PathBuf>,
    ) -> anyhow::Result<Self> {
        let images_root = images_root.into();
        let thumbnails_root = thumbnails_root.into();

        fs::create_dir_all(&images_root)
            .with_context(|| format!("Failed to create image root {}", images_root.display()))?;
        fs::create_dir_all(&thumbnails_root).with_context(|| {
            format!("Failed to create thumbnail root {}", thumbnails_root.display())
        })?;

        let mut names = Vec::new();
        for entry in fs::read_dir(&images_root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();

        let mut collections = Self {
            images_root,
            thumbnails_root,
            names,
            writer: OutputWriter::default(),
        };

        if collections.names.is_empty() {
            collections.create(DEFAULT_COLLECTION)?;
        }

        info!(
            root = %collections.images_root.display(),
            count = collections.names.len(),
            "Collections opened"
        );
        Ok(collections)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn path(&self, name: &str) -> Result<PathBuf, AppError> {
        if self.contains(name) {
            Ok(self.images_root.join(name))
        } else {
            Err(AppError::UnknownCollection(name.to_string()))
        }
    }

    pub fn create(&mut self, name: &str) -> anyhow::Result<PathBuf> {
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            bail!(AppError::Config(format!("invalid collection name '{}'", name)));
        }

        let path = self.images_root.join(name);
        fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create collection {}", path.display()))?;

        if !self.contains(name) {
            self.names.push(name.to_string());
            self.names.sort();
            info!(name, "Collection created");
        }
        Ok(path)
    }

    /// Images of `name` as root-relative paths, newest first
    pub fn images(&self, name: &str) -> anyhow::Result<Vec<String>> {
        let dir = self.path(name)?;

        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let file_name = entry?.file_name();
            if let Some(id) = file_name.to_str().and_then(parse_image_id) {
                ids.push(id);
            }
        }
        ids.sort_unstable_by(|a, b| b.cmp(a));

        Ok(ids.into_iter().map(|id| format!("{}/{}", name, image_file_name(id))).collect())
    }

    /// Copy an outside image file into collection `to` under its next id.
    /// Returns the new root-relative path.
    pub fn import_image(&self, source: &Path, to: &str) -> anyhow::Result<String> {
        let imported = self.writer.import(source, &self.path(to)?)?;
        info!(source = %source.display(), collection = to, "Image imported");
        relative_name(to, &imported)
    }

    /// Move an image into collection `to` under that collection's next id.
    /// Returns the new root-relative path.
    pub fn move_image(&self, rel_path: &str, to: &str) -> anyhow::Result<String> {
        let source = self.resolve(rel_path)?;
        let target_dir = self.path(to)?;

        let moved = self.writer.relocate(&source, &target_dir)?;
        self.remove_thumbnail(rel_path)?;
        relative_name(to, &moved)
    }

    /// Remove an image together with its thumbnail
    pub fn delete_image(&self, rel_path: &str) -> anyhow::Result<()> {
        let path = self.resolve(rel_path)?;
        fs::remove_file(&path).with_context(|| format!("Failed to delete {}", path.display()))?;
        self.remove_thumbnail(rel_path)?;
        info!(path = rel_path, "Image deleted");
        Ok(())
    }

    /// Path of the thumbnail for `rel_path`, rendering it first if it is
    /// missing or older than the image
    pub fn thumbnail(&self, rel_path: &str) -> anyhow::Result<PathBuf> {
        let source = self.resolve(rel_path)?;
        let thumb = self.thumbnail_path(rel_path);

        if is_fresh(&thumb, &source)? {
            return Ok(thumb);
        }

        let image = image::open(&source)
            .with_context(|| format!("Failed to open {}", source.display()))?
            .to_rgba8();
        let square = make_thumbnail(&image, THUMBNAIL_SIZE);

        if let Some(parent) = thumb.parent() {
            fs::create_dir_all(parent)?;
        }
        square
            .save_with_format(&thumb, image::ImageFormat::WebP)
            .with_context(|| format!("Failed to write thumbnail {}", thumb.display()))?;

        debug!(path = %thumb.display(), "Thumbnail created");
        Ok(thumb)
    }

    fn resolve(&self, rel_path: &str) -> anyhow::Result<PathBuf> {
        let path = Path::new(rel_path);
        let mut parts = path.components();
        let (Some(collection), Some(_file), None) = (parts.next(), parts.next(), parts.next())
        else {
            bail!(AppError::Config(format!("'{}' is not a collection image path", rel_path)));
        };

        let collection = collection.as_os_str().to_str().unwrap_or_default();
        self.path(collection)?;
        Ok(self.images_root.join(path))
    }

    fn thumbnail_path(&self, rel_path: &str) -> PathBuf {
        self.thumbnails_root.join(rel_path).with_extension("webp")
    }

    fn remove_thumbnail(&self, rel_path: &str) -> anyhow::Result<()> {
        match fs::remove_file(self.thumbnail_path(rel_path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn relative_name(collection: &str, path: &Path) -> anyhow::Result<String> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("Image path has no file name")?;
    Ok(format!("{}/{}", collection, file_name))
}

fn is_fresh(thumb: &Path, source: &Path) -> io::Result<bool> {
    let thumb_meta = match fs::metadata(thumb) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    Ok(thumb_meta.modified()? >= fs::metadata(source)?.modified()?)
}

/// Fit `image` inside a `size`×`size` square, centred on transparency
fn make_thumbnail(image: &RgbaImage, size: u32) -> RgbaImage {
    let (w, h) = image.dimensions();
    let scale = size as f32 / w.max(h).max(1) as f32;
    let fit_w = ((w as f32 * scale).round() as u32).clamp(1, size);
    let fit_h = ((h as f32 * scale).round() as u32).clamp(1, size);

    let resized = imageops::resize(image, fit_w, fit_h, imageops::FilterType::Lanczos3);
    let mut square = RgbaImage::new(size, size);
    let (x, y) = ((size - fit_w) / 2, (size - fit_h) / 2);
    imageops::overlay(&mut square, &resized, x as i64, y as i64);
    square
}
