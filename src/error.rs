//! Error types for open-nsfw.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the open-nsfw library.
#[derive(Error, Debug)]
pub enum Error {
    /// The bytes handed to the decoder are not a supported image.
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    /// Re-encoding the resized image failed.
    #[error("failed to encode resized image: {0}")]
    Encode(#[source] image::ImageError),

    /// Network weights could not be loaded.
    #[error("failed to load model weights from {path}: {source}")]
    ModelLoad {
        path: PathBuf,
        #[source]
        source: candle_core::Error,
    },

    /// The weights file is not a Caffe `NetParameter`.
    #[error("failed to decode caffemodel {path}: {source}")]
    CaffeDecode {
        path: PathBuf,
        #[source]
        source: prost::DecodeError,
    },

    #[error("weight layer {layer:?}: {reason}")]
    BadLayer { layer: String, reason: String },

    /// The deploy definition is missing or malformed.
    #[error("invalid deploy definition {path}: {reason}")]
    Deploy { path: PathBuf, reason: String },

    /// The network has no blob with this name.
    #[error("unknown blob {0:?}")]
    UnknownBlob(String),

    /// The network returned no tensor for a requested output.
    #[error("network produced no output for blob {0:?}")]
    MissingOutput(String),

    /// The resized image is smaller than the network's input crop.
    #[error("image {width}x{height} is smaller than the {crop_width}x{crop_height} input crop")]
    UndersizedImage {
        width: usize,
        height: usize,
        crop_width: usize,
        crop_height: usize,
    },

    /// Shape mismatch in tensor operations.
    #[error("tensor shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// Invalid parameter value.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// Tensor runtime error.
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for open-nsfw operations.
pub type Result<T> = std::result::Result<T, Error>;
