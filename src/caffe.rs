//! Reads Caffe `.caffemodel` weights into named candle tensors.
//!
//! Only the parts of `NetParameter` that carry weights are decoded; every
//! other field is skipped by the protobuf decoder. Tensor names follow
//! [`crate::resnet`]: `Convolution` and `InnerProduct` layers give
//! `{layer}.weight` and `{layer}.bias`, and a `BatchNorm` layer `bn_X` is
//! folded with its `Scale` layer `scale_X` into `bn_X.running_mean`,
//! `bn_X.running_var`, `bn_X.weight` and `bn_X.bias`.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use prost::Message;

use crate::error::{Error, Result};

#[derive(Clone, PartialEq, Message)]
pub struct NetParameter {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(message, repeated, tag = "100")]
    pub layer: Vec<LayerParameter>,
}

#[derive(Clone, PartialEq, Message)]
pub struct LayerParameter {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub kind: Option<String>,
    #[prost(message, repeated, tag = "7")]
    pub blobs: Vec<BlobProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct BlobShape {
    #[prost(int64, repeated, packed = "true", tag = "1")]
    pub dim: Vec<i64>,
}

/// A weight blob. Older files carry the legacy 4-d `num`/`channels`/
/// `height`/`width` fields instead of `shape`.
#[derive(Clone, PartialEq, Message)]
pub struct BlobProto {
    #[prost(int32, optional, tag = "1")]
    pub num: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub channels: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub height: Option<i32>,
    #[prost(int32, optional, tag = "4")]
    pub width: Option<i32>,
    #[prost(float, repeated, packed = "true", tag = "5")]
    pub data: Vec<f32>,
    #[prost(message, optional, tag = "7")]
    pub shape: Option<BlobShape>,
    #[prost(double, repeated, packed = "true", tag = "8")]
    pub double_data: Vec<f64>,
}

impl BlobProto {
    fn dims(&self) -> Vec<usize> {
        match &self.shape {
            Some(shape) => shape.dim.iter().map(|&d| usize::try_from(d).unwrap_or(0)).collect(),
            None => [self.num, self.channels, self.height, self.width]
                .iter()
                .flatten()
                .map(|&d| usize::try_from(d).unwrap_or(0))
                .collect(),
        }
    }

    fn values(&self) -> Vec<f32> {
        if self.data.is_empty() {
            self.double_data.iter().map(|&v| v as f32).collect()
        } else {
            self.data.clone()
        }
    }

    fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(self.values(), self.dims(), device)?)
    }

    fn to_vector(&self, device: &Device) -> Result<Tensor> {
        let values = self.values();
        let len = values.len();
        Ok(Tensor::from_vec(values, len, device)?)
    }
}

/// Decode a `.caffemodel` file into tensors named the way the network expects.
///
/// # Errors
///
/// Returns [`Error::ModelLoad`] if the file cannot be read,
/// [`Error::CaffeDecode`] if it is not a `NetParameter`, and
/// [`Error::BadLayer`] if a weight layer lacks its blobs.
pub fn load_caffemodel<P: AsRef<Path>>(
    path: P,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let path = path.as_ref();
    let buffer = std::fs::read(path).map_err(|err| Error::ModelLoad {
        path: path.to_path_buf(),
        source: err.into(),
    })?;
    let net = NetParameter::decode(buffer.as_slice()).map_err(|source| Error::CaffeDecode {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(
        name = net.name.as_deref().unwrap_or("unnamed"),
        layers = net.layer.len(),
        "caffemodel decoded"
    );
    tensors_from_net(&net, device)
}

pub fn tensors_from_net(net: &NetParameter, device: &Device) -> Result<HashMap<String, Tensor>> {
    let mut tensors = HashMap::new();
    let mut batch_norms = Vec::new();

    for layer in &net.layer {
        let name = layer.name.as_deref().unwrap_or_default();
        match layer.kind.as_deref().unwrap_or_default() {
            "Convolution" => {
                let weight = first_blob(layer)?.to_tensor(device)?;
                insert_bias(&mut tensors, layer, weight.dim(0)?, device)?;
                tensors.insert(format!("{name}.weight"), weight);
            }
            "InnerProduct" => {
                let blob = first_blob(layer)?;
                let dims = blob.dims();
                let &[.., out, inp] = dims.as_slice() else {
                    return Err(bad_layer(name, format!("weight blob has shape {dims:?}")));
                };
                let weight = blob.to_tensor(device)?.reshape((out, inp))?;
                insert_bias(&mut tensors, layer, out, device)?;
                tensors.insert(format!("{name}.weight"), weight);
            }
            "BatchNorm" => {
                let [mean, var, factor, ..] = &layer.blobs[..] else {
                    let reason = format!("expected 3 blobs, got {}", layer.blobs.len());
                    return Err(bad_layer(name, reason));
                };
                let factor = factor.values().first().copied().unwrap_or(0.0);
                let scale = if factor == 0.0 { 0.0 } else { 1.0 / f64::from(factor) };
                let mean = mean.to_vector(device)?.affine(scale, 0.0)?;
                let var = var.to_vector(device)?.affine(scale, 0.0)?;
                tensors.insert(format!("{name}.running_mean"), mean);
                tensors.insert(format!("{name}.running_var"), var);
                batch_norms.push(name.to_string());
            }
            "Scale" => {
                let target = match name.strip_prefix("scale_") {
                    Some(suffix) => format!("bn_{suffix}"),
                    None => name.to_string(),
                };
                let gamma = first_blob(layer)?.to_vector(device)?;
                let beta = match layer.blobs.get(1) {
                    Some(blob) => blob.to_vector(device)?,
                    None => gamma.zeros_like()?,
                };
                tensors.insert(format!("{target}.weight"), gamma);
                tensors.insert(format!("{target}.bias"), beta);
            }
            _ => {}
        }
    }

    // a BatchNorm with no Scale after it only normalizes
    for name in batch_norms {
        let mean = &tensors[&format!("{name}.running_mean")];
        let (ones, zeros) = (mean.ones_like()?, mean.zeros_like()?);
        tensors.entry(format!("{name}.weight")).or_insert(ones);
        tensors.entry(format!("{name}.bias")).or_insert(zeros);
    }

    Ok(tensors)
}

fn first_blob(layer: &LayerParameter) -> Result<&BlobProto> {
    let name = layer.name.as_deref().unwrap_or_default();
    layer.blobs.first().ok_or_else(|| bad_layer(name, "no weight blob".into()))
}

fn insert_bias(
    tensors: &mut HashMap<String, Tensor>,
    layer: &LayerParameter,
    out: usize,
    device: &Device,
) -> Result<()> {
    let name = layer.name.as_deref().unwrap_or_default();
    let bias = match layer.blobs.get(1) {
        Some(blob) => blob.to_vector(device)?,
        None => Tensor::zeros(out, DType::F32, device)?,
    };
    tensors.insert(format!("{name}.bias"), bias);
    Ok(())
}

fn bad_layer(layer: &str, reason: String) -> Error {
    Error::BadLayer {
        layer: layer.to_string(),
        reason,
    }
}
