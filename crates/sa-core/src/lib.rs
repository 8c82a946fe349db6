pub mod error;
pub mod latents;
pub mod metadata;
pub mod pipeline;
pub mod progress;
mod model_types;

pub use error::{Error, Result};
pub use model_types::{Fingerprint, PipelineKind, Scheduler};
