use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unknown collection: {0}")]
    UnknownCollection(String),
}

/// Failures surfaced by `GenerationWorker::start`, before any work begins
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Invalid request: {0}")]
    Configuration(String),

    #[error("A generation is already running")]
    Busy,

    #[error("Generation worker is not running")]
    WorkerUnavailable,
}

/// A write that still failed after the retry budget ran out
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode image: {0}")]
    Encode(#[source] sa_core::Error),
}

impl From<sa_core::Error> for OutputError {
    fn from(err: sa_core::Error) -> Self {
        match err {
            sa_core::Error::Io(e) => Self::Io(e),
            other => Self::Encode(other),
        }
    }
}
