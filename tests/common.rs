#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::path::PathBuf;

use candle_core::{Device, Shape, Tensor};
use candle_nn::VarMap;
use image::{DynamicImage, ImageFormat};
use open_nsfw::caffe::{BlobProto, BlobShape, LayerParameter, NetParameter};
use open_nsfw::{Error, Network, Result, DATA_BLOB, PROB_BLOB};
use prost::Message;

/// Network double with a fixed input shape and a canned `prob` output.
pub struct StubNetwork {
    shape: Shape,
    prob: Vec<f32>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    pub last_input: RefCell<Option<Tensor>>,
}

impl StubNetwork {
    pub fn new(height: usize, width: usize, prob: &[f32]) -> Self {
        Self {
            shape: Shape::from((1, 3, height, width)),
            prob: prob.to_vec(),
            inputs: vec![DATA_BLOB.to_string()],
            outputs: vec![PROB_BLOB.to_string()],
            last_input: RefCell::new(None),
        }
    }

    /// A network that runs but never produces any output blob.
    pub fn silent(height: usize, width: usize) -> Self {
        Self::new(height, width, &[])
    }
}

impl Network for StubNetwork {
    fn blob_shape(&self, name: &str) -> Result<Shape> {
        match name {
            DATA_BLOB => Ok(self.shape.clone()),
            PROB_BLOB => Ok(Shape::from((1, self.prob.len()))),
            name => Err(Error::UnknownBlob(name.to_string())),
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
        let (_, data) = inputs
            .iter()
            .find(|(name, _)| *name == DATA_BLOB)
            .ok_or_else(|| Error::UnknownBlob(DATA_BLOB.to_string()))?;
        *self.last_input.borrow_mut() = Some((*data).clone());

        let mut outputs = HashMap::new();
        if blobs.contains(&PROB_BLOB) && !self.prob.is_empty() {
            let prob = Tensor::new(self.prob.as_slice(), &Device::Cpu)?;
            let prob = prob.reshape((1, self.prob.len()))?;
            outputs.insert(PROB_BLOB.to_string(), prob);
        }
        Ok(outputs)
    }
}

pub fn encode(img: &DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    img.write_to(&mut cursor, format).expect("encode test image");
    cursor.into_inner()
}

/// A non-uniform RGB test image.
pub fn gradient(width: u32, height: u32) -> DynamicImage {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 255 / width) as u8, (y * 255 / height) as u8, ((x + y) % 256) as u8])
    });
    DynamicImage::ImageRgb8(img)
}

/// A fresh scratch directory for one test.
pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("open-nsfw-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

fn blob(tensor: &Tensor) -> Result<BlobProto> {
    Ok(BlobProto {
        shape: Some(BlobShape {
            dim: tensor.dims().iter().map(|&d| d as i64).collect(),
        }),
        data: tensor.flatten_all()?.to_vec1::<f32>()?,
        ..Default::default()
    })
}

fn layer(name: &str, kind: &str, blobs: Vec<BlobProto>) -> LayerParameter {
    LayerParameter {
        name: Some(name.to_string()),
        kind: Some(kind.to_string()),
        blobs,
    }
}

/// Serialize the variables of a network as a caffemodel, splitting every
/// `bn_*` entry back into a `BatchNorm` layer with the given scale factor and
/// a `Scale` layer.
pub fn caffemodel_from_varmap(varmap: &VarMap, scale_factor: f32) -> Result<Vec<u8>> {
    let vars = varmap.data().lock().unwrap();
    let mut layers: BTreeMap<&str, BTreeMap<&str, &Tensor>> = BTreeMap::new();
    for (name, var) in vars.iter() {
        let (layer, param) = name.rsplit_once('.').expect("variable names are layer.param");
        layers.entry(layer).or_default().insert(param, var.as_tensor());
    }

    let mut net = NetParameter {
        name: Some("test".to_string()),
        layer: vec![],
    };
    for (name, params) in layers {
        if let Some(suffix) = name.strip_prefix("bn_") {
            let mean = params["running_mean"].affine(f64::from(scale_factor), 0.0)?;
            let var = params["running_var"].affine(f64::from(scale_factor), 0.0)?;
            let factor = Tensor::new(&[scale_factor], &Device::Cpu)?;
            let stats = vec![blob(&mean)?, blob(&var)?, blob(&factor)?];
            net.layer.push(layer(name, "BatchNorm", stats));
            let scale = vec![blob(params["weight"])?, blob(params["bias"])?];
            net.layer.push(layer(&format!("scale_{suffix}"), "Scale", scale));
        } else {
            let kind = if name.starts_with("fc_") { "InnerProduct" } else { "Convolution" };
            let blobs = vec![blob(params["weight"])?, blob(params["bias"])?];
            net.layer.push(layer(name, kind, blobs));
        }
    }
    Ok(net.encode_to_vec())
}
