//! # open-nsfw
//!
//! Scores images for "not safe for work" content with the ResNet-50-1by2
//! open NSFW classifier, running on candle.
//!
//! Every image goes through the same preparation the network was trained on:
//! a bilinear resize to 256x256, a JPEG round-trip, a centered crop to the
//! network's input size, then BGR mean-subtracted `[0, 255]` values.
//!
//! ## Example
//!
//! ```no_run
//! use open_nsfw::{Config, NsfwModel};
//!
//! # fn main() -> open_nsfw::Result<()> {
//! let model = NsfwModel::new(Config::default())?;
//! let score = model.predict("photo.jpg")?;
//! println!("nsfw probability: {score}");
//! # Ok(())
//! # }
//! ```

pub mod caffe;
pub mod config;
pub mod deploy;
pub mod error;
pub mod model;
pub mod network;
pub mod nsfw_net;
pub mod resize;
pub mod resnet;
pub mod transform;

pub use config::Config;
pub use error::{Error, Result};
pub use model::{extract_score, NsfwModel};
pub use network::{Network, DATA_BLOB, PROB_BLOB};
pub use nsfw_net::NsfwNet;
pub use transform::Transformer;
