pub mod backend;
pub mod cache;
pub mod collections;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod job;
pub mod output;
pub mod postprocess;
pub mod retry;
pub mod settings;
pub mod worker;

pub use crate::context::AppContext;
pub use crate::events::WorkerEvent;
pub use crate::job::{GenerationRequest, WorkerState};
pub use crate::worker::{CancellationToken, GenerationWorker, WorkerControl, WorkerDeps};
