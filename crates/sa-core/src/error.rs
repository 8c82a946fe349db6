use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Processor error: {0}")]
    Processor(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PNG encoding failed: {0}")]
    PngEncode(#[from] png::EncodingError),

    #[error("PNG decoding failed: {0}")]
    PngDecode(#[from] png::DecodingError),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, Error>;
