//! The scorer: one owned network plus the preprocessing it needs.

use std::fs;
use std::path::Path;

use candle_core::{IndexOp, Tensor};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::network::{Network, DATA_BLOB, PROB_BLOB};
use crate::nsfw_net::NsfwNet;
use crate::resize::resize_image;
use crate::transform::{center_crop, load_image, Transformer};

/// Index of the "nsfw" class in the probability vector.
pub const NSFW_CLASS: usize = 1;

/// Scores images with a constructed network.
///
/// The network and transformer are built once and only read afterwards, so
/// scoring the same bytes twice gives the same result.
#[derive(Debug)]
pub struct NsfwModel<N = NsfwNet> {
    net: N,
    transformer: Transformer,
    input: String,
    crop: (usize, usize),
    config: Config,
}

impl NsfwModel<NsfwNet> {
    /// Load the network named by `config`.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let net = NsfwNet::load(&config)?;
        Self::with_network(net, config)
    }
}

impl<N: Network> NsfwModel<N> {
    /// Wrap an already constructed network.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the network does not
    /// declare a 3-channel `(N, C, H, W)` input.
    pub fn with_network(net: N, config: Config) -> Result<Self> {
        config.validate()?;
        let input = net
            .inputs()
            .first()
            .cloned()
            .ok_or_else(|| Error::UnknownBlob(DATA_BLOB.to_string()))?;
        // the crop size comes from the `data` blob even when the input is named otherwise
        let shape = net.blob_shape(DATA_BLOB).or_else(|_| net.blob_shape(&input))?;
        let (_, _, height, width) = shape.dims4()?;
        let transformer = Transformer::nsfw(&input, shape)?;
        Ok(Self {
            net,
            transformer,
            input,
            crop: (height, width),
            config,
        })
    }

    pub fn network(&self) -> &N {
        &self.net
    }

    /// Score the image at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read, plus every error of
    /// [`NsfwModel::score_bytes`].
    pub fn predict<P: AsRef<Path>>(&self, path: P) -> Result<f64> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        let score = self.score_bytes(&data)?;
        tracing::debug!(path = %path.display(), score, "scored image");
        Ok(score)
    }

    /// Score encoded image bytes: the `prob` of the nsfw class, rounded to 3 decimals.
    pub fn score_bytes(&self, data: &[u8]) -> Result<f64> {
        let scores = self.preprocess_and_compute(data, Some(&[PROB_BLOB][..]))?;
        extract_score(&scores)
    }

    /// Build the `(1, 3, h, w)` input tensor for encoded image bytes.
    pub fn prepare(&self, data: &[u8]) -> Result<Tensor> {
        let resized = resize_image(data, self.config.resize, self.config.jpeg_quality)?;
        let image = load_image(resized.get_ref())?;
        let (height, width) = self.crop;
        let crop = center_crop(&image, height, width)?;
        let xs = self.transformer.preprocess(&self.input, &crop)?;
        Ok(xs.unsqueeze(0)?)
    }

    /// Run the network on encoded image bytes and return the first requested
    /// output layer for the single batch element.
    ///
    /// `output_layers` defaults to the network's declared outputs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingOutput`] if the network does not produce the
    /// first requested layer.
    pub fn preprocess_and_compute(
        &self,
        data: &[u8],
        output_layers: Option<&[&str]>,
    ) -> Result<Vec<f64>> {
        let defaults: Vec<&str>;
        let output_layers = match output_layers {
            Some(layers) => layers,
            None => {
                defaults = self.net.outputs().iter().map(String::as_str).collect();
                &defaults
            }
        };
        let first = *output_layers
            .first()
            .ok_or_else(|| Error::MissingOutput("<none requested>".to_string()))?;

        let xs = self.prepare(data)?;
        let outputs = self.net.forward_all(output_layers, &[(self.input.as_str(), &xs)])?;
        let output = outputs.get(first).ok_or_else(|| Error::MissingOutput(first.to_string()))?;

        let values = output.i(0)?.flatten_all()?.to_vec1::<f32>()?;
        Ok(values.into_iter().map(f64::from).collect())
    }
}

/// Pick the nsfw class probability out of a batch element's scores.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] if there are fewer than two classes.
pub fn extract_score(scores: &[f64]) -> Result<f64> {
    let score = scores.get(NSFW_CLASS).ok_or_else(|| Error::ShapeMismatch {
        expected: "at least 2 class scores".to_string(),
        actual: format!("{} scores", scores.len()),
    })?;
    Ok(round3(*score))
}

/// Round to three decimal places.
#[must_use]
pub fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}
