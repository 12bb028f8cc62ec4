//! Model and preprocessing configuration.

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::resize::{DEFAULT_QUALITY, DEFAULT_SIZE};

/// Configuration for loading the network and preparing images.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the deploy definition and the weights.
    pub model_dir: PathBuf,

    /// Deploy definition file name, relative to `model_dir`.
    pub deploy_file: String,

    /// Weights file name, relative to `model_dir`: a Caffe `.caffemodel`, or
    /// `.safetensors` with the same tensor names.
    pub weights_file: String,

    /// Size (width, height) every image is resized to before cropping.
    pub resize: (u32, u32),

    /// Quality of the intermediate JPEG (1-100).
    pub jpeg_quality: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("nsfw_model"),
            deploy_file: "deploy.prototxt".to_string(),
            weights_file: "resnet_50_1by2_nsfw.caffemodel".to_string(),
            resize: DEFAULT_SIZE,
            jpeg_quality: DEFAULT_QUALITY,
        }
    }
}

impl Config {
    /// Full path of the deploy definition.
    #[must_use]
    pub fn deploy_path(&self) -> PathBuf {
        self.model_dir.join(&self.deploy_file)
    }

    /// Full path of the weights file.
    #[must_use]
    pub fn weights_path(&self) -> PathBuf {
        self.model_dir.join(&self.weights_file)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.resize.0 == 0 || self.resize.1 == 0 {
            return Err(Error::InvalidParameter {
                name: "resize".to_string(),
                reason: "width and height must be greater than 0".to_string(),
            });
        }

        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(Error::InvalidParameter {
                name: "jpeg_quality".to_string(),
                reason: "must be between 1 and 100".to_string(),
            });
        }

        Ok(())
    }
}
