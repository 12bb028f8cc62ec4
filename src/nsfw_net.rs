//! The ResNet-50-1by2 NSFW network behind the [`Network`] seam.

use std::collections::HashMap;

use candle_core::{DType, Device, Module, Shape, Tensor, D};
use candle_nn::VarBuilder;

use crate::caffe;
use crate::config::Config;
use crate::deploy::DeployDef;
use crate::error::{Error, Result};
use crate::network::{Network, DATA_BLOB, PROB_BLOB};
use crate::resnet::{resnet50_1by2, ResNet50Half};

/// Name of the classifier logits blob.
pub const LOGITS_BLOB: &str = "fc_nsfw";

/// Classes scored by the network: `[safe, nsfw]`.
pub const NUM_CLASSES: usize = 2;

/// The NSFW classifier with its declared input blob.
#[derive(Debug)]
pub struct NsfwNet {
    model: ResNet50Half,
    input_shape: Shape,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl NsfwNet {
    /// Load the deploy definition and weights named by `config`.
    ///
    /// A `.safetensors` weights file is memory-mapped; any other file is
    /// decoded as a Caffe `.caffemodel`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Deploy`] for a bad deploy definition and
    /// [`Error::ModelLoad`] if the weights are missing or do not fit the network.
    pub fn load(config: &Config) -> Result<Self> {
        let deploy = DeployDef::from_file(config.deploy_path())?;
        let input = deploy
            .input(DATA_BLOB)
            .or_else(|| deploy.inputs.first())
            .ok_or_else(|| Error::UnknownBlob(DATA_BLOB.to_string()))?;

        let weights = config.weights_path();
        let load_error = |err: Error| match err {
            Error::Tensor(source) => Error::ModelLoad {
                path: weights.clone(),
                source,
            },
            err => err,
        };
        let device = Device::Cpu;
        let vb = if weights.extension().is_some_and(|ext| ext == "safetensors") {
            // SAFETY: the weights file is mapped read-only and not modified while the net lives.
            unsafe { VarBuilder::from_mmaped_safetensors(&[&weights], DType::F32, &device) }
                .map_err(Error::Tensor)
                .map_err(load_error)?
        } else {
            let tensors = caffe::load_caffemodel(&weights, &device).map_err(load_error)?;
            VarBuilder::from_tensors(tensors, DType::F32, &device)
        };
        let net = Self::from_var_builder(vb, &input.name, input.shape.clone())
            .map_err(load_error)?;

        tracing::info!(
            name = deploy.name.as_deref().unwrap_or("unnamed"),
            input = %input.name,
            shape = ?input.shape,
            weights = %weights.display(),
            "nsfw model loaded"
        );
        Ok(net)
    }

    /// Build the network from already opened variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `input_shape` is not `(N, 3, H, W)` or a variable is
    /// missing from `vb`.
    pub fn from_var_builder(vb: VarBuilder, input: &str, input_shape: Shape) -> Result<Self> {
        let (_, channels, _, _) = input_shape.dims4()?;
        if channels != 3 {
            return Err(Error::ShapeMismatch {
                expected: "3 input channels".to_string(),
                actual: format!("{input_shape:?}"),
            });
        }
        let model = resnet50_1by2(vb, NUM_CLASSES)?;
        Ok(Self {
            model,
            input_shape,
            inputs: vec![input.to_string()],
            outputs: vec![PROB_BLOB.to_string()],
        })
    }
}

impl Network for NsfwNet {
    fn blob_shape(&self, name: &str) -> Result<Shape> {
        let (batch, _, _, _) = self.input_shape.dims4()?;
        if name == self.inputs[0] {
            Ok(self.input_shape.clone())
        } else if name == LOGITS_BLOB || name == PROB_BLOB {
            Ok(Shape::from((batch, NUM_CLASSES)))
        } else {
            Err(Error::UnknownBlob(name.to_string()))
        }
    }

    fn inputs(&self) -> &[String] {
        &self.inputs
    }

    fn outputs(&self) -> &[String] {
        &self.outputs
    }

    fn forward_all(
        &self,
        blobs: &[&str],
        inputs: &[(&str, &Tensor)],
    ) -> Result<HashMap<String, Tensor>> {
        let input_name = &self.inputs[0];
        let data = inputs
            .iter()
            .find(|(name, _)| *name == input_name.as_str())
            .map(|(_, tensor)| *tensor)
            .ok_or_else(|| Error::UnknownBlob(input_name.clone()))?;

        let (_, channels, height, width) = self.input_shape.dims4()?;
        let (_, c, h, w) = data.dims4()?;
        if (c, h, w) != (channels, height, width) {
            return Err(Error::ShapeMismatch {
                expected: format!("(N, {channels}, {height}, {width})"),
                actual: format!("{:?}", data.dims()),
            });
        }

        let logits = self.model.forward(data)?;
        let prob = candle_nn::ops::softmax(&logits, D::Minus1)?;

        let mut outputs = HashMap::with_capacity(blobs.len());
        for &blob in blobs {
            let tensor = match blob {
                PROB_BLOB => prob.clone(),
                LOGITS_BLOB => logits.clone(),
                name if name == input_name.as_str() => data.clone(),
                name => return Err(Error::UnknownBlob(name.to_string())),
            };
            outputs.insert(blob.to_string(), tensor);
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;

    fn zero_net(size: usize) -> Result<NsfwNet> {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        NsfwNet::from_var_builder(vb, DATA_BLOB, Shape::from((1, 3, size, size)))
    }

    #[test]
    fn test_blob_shapes() -> Result<()> {
        let net = zero_net(224)?;
        assert_eq!(net.blob_shape(DATA_BLOB)?.dims(), &[1, 3, 224, 224]);
        assert_eq!(net.blob_shape(PROB_BLOB)?.dims(), &[1, 2]);
        assert!(matches!(net.blob_shape("pool1"), Err(Error::UnknownBlob(_))));
        assert_eq!(net.inputs(), &[DATA_BLOB.to_string()]);
        assert_eq!(net.outputs(), &[PROB_BLOB.to_string()]);
        Ok(())
    }

    #[test]
    fn test_zero_weights_give_even_odds() -> Result<()> {
        let net = zero_net(32)?;
        let data = Tensor::rand(-100f32, 100.0, (1, 3, 32, 32), &Device::Cpu)?;
        let outputs = net.forward_all(&[PROB_BLOB, LOGITS_BLOB], &[(DATA_BLOB, &data)])?;
        let prob = outputs[PROB_BLOB].i(0)?.to_vec1::<f32>()?;
        assert_eq!(prob, vec![0.5, 0.5]);
        let logits = outputs[LOGITS_BLOB].i(0)?.to_vec1::<f32>()?;
        assert_eq!(logits, vec![0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_rejects_wrong_input() -> Result<()> {
        let net = zero_net(32)?;
        let data = Tensor::zeros((1, 3, 16, 16), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            net.forward_all(&[PROB_BLOB], &[(DATA_BLOB, &data)]),
            Err(Error::ShapeMismatch { .. })
        ));
        assert!(matches!(
            net.forward_all(&[PROB_BLOB], &[("image", &data)]),
            Err(Error::UnknownBlob(_))
        ));
        Ok(())
    }

    #[test]
    fn test_rejects_grayscale_input() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let net = NsfwNet::from_var_builder(vb, DATA_BLOB, Shape::from((1, 1, 32, 32)));
        assert!(matches!(net, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_missing_weights() {
        let dir = std::env::temp_dir().join(format!("open-nsfw-missing-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let deploy = "input: \"data\"\ninput_shape { dim: 1 dim: 3 dim: 224 dim: 224 }\n";
        std::fs::write(dir.join("deploy.prototxt"), deploy).unwrap();

        let config = Config {
            model_dir: dir.clone(),
            ..Config::default()
        };
        let err = NsfwNet::load(&config).unwrap_err();
        assert!(matches!(err, Error::ModelLoad { .. }), "{err:?}");

        let config = Config {
            weights_file: "absent.safetensors".to_string(),
            ..config
        };
        let err = NsfwNet::load(&config).unwrap_err();
        assert!(matches!(err, Error::ModelLoad { .. }), "{err:?}");
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
