//! Model-free collaborators for the generation worker: a procedural
//! sampling pipeline and lightweight image processors.

mod processors;
mod synthetic;

pub use processors::{BlendFaceRestorer, EdgePreprocessor, LanczosUpscaler};
pub use synthetic::{SyntheticLoader, SyntheticPipeline};
