use std::path::PathBuf;
use image::RgbImage;
use sa_core::progress::ProgressEvent;

/// Everything the generation worker reports back to its owner.
///
/// Within one run `Progress` percentages never decrease and `TaskComplete`
/// is sent exactly once, as the last event of the run.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Progress(ProgressEvent),
    /// Approximate view of the image being denoised
    Preview(RgbImage),
    /// A finished image was written
    ImageComplete(PathBuf),
    TaskComplete,
}

impl WorkerEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TaskComplete)
    }
}
