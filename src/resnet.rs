//! ResNet-50 "1by2": a bottleneck ResNet-50 whose stages run at half width,
//! laid out the way the Caffe NSFW model defines it. The 7x7 stem keeps its
//! full 64 channels.
//!
//! Differences from the torchvision bottleneck ResNet:
//! - stage strides sit on the first 1x1 convolution (`branch2a`), not the 3x3
//! - every convolution carries a bias
//! - `pool1` rounds its output size up
//!
//! Weight names follow the Caffe layer names, with each `BatchNorm` + `Scale`
//! pair folded into one `bn_*` entry (`weight`, `bias`, `running_mean`,
//! `running_var`); see [`crate::caffe`].

use candle_core::{Result, Tensor, D};
use candle_nn as nn;
use nn::{Conv2d, Linear, Module, VarBuilder};

/// Output channels of `conv_1`.
const STEM_WIDTH: usize = 64;

/// Inner width of the first stage; torchvision's ResNet-50 uses 64.
const BASE_WIDTH: usize = 32;

/// Bottleneck expansion.
const EXPANSION: usize = 4;

fn conv2d(
    in_planes: usize,
    out_planes: usize,
    ksize: usize,
    padding: usize,
    stride: usize,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let conv2d_cfg = candle_nn::Conv2dConfig {
        stride,
        padding,
        ..Default::default()
    };
    candle_nn::conv2d(in_planes, out_planes, ksize, conv2d_cfg, vb)
}

/// Output padding that makes a floor-mode pool produce Caffe's ceil-mode size.
fn ceil_pad(size: usize, kernel: usize, stride: usize) -> usize {
    if size < kernel {
        return kernel - size;
    }
    match (size - kernel) % stride {
        0 => 0,
        rem => stride - rem,
    }
}

// Inputs are post-ReLU, so trailing zero padding never beats a real value.
fn max_pool2d_ceil(xs: &Tensor, kernel: usize, stride: usize) -> Result<Tensor> {
    let (_, _, h, w) = xs.dims4()?;
    xs.pad_with_zeros(D::Minus2, 0, ceil_pad(h, kernel, stride))?
        .pad_with_zeros(D::Minus1, 0, ceil_pad(w, kernel, stride))?
        .max_pool2d_with_stride(kernel, stride)
}

/// A convolution followed by its batch norm, named `conv_{name}` / `bn_{name}`.
#[derive(Debug, Clone)]
pub struct ConvBn {
    conv: Conv2d,
    bn: nn::BatchNorm,
}

impl ConvBn {
    fn new(
        vb: &VarBuilder,
        name: &str,
        in_planes: usize,
        out_planes: usize,
        ksize: usize,
        padding: usize,
        stride: usize,
    ) -> Result<Self> {
        let conv_vb = vb.pp(format!("conv_{name}"));
        let conv = conv2d(in_planes, out_planes, ksize, padding, stride, conv_vb)?;
        let bn = nn::batch_norm(out_planes, 1e-5, vb.pp(format!("bn_{name}")))?;
        Ok(Self { conv, bn })
    }
}

impl Module for ConvBn {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.conv)?.apply_t(&self.bn, false)
    }
}

#[derive(Debug, Clone)]
pub struct BottleneckBlock {
    branch2a: ConvBn,
    branch2b: ConvBn,
    branch2c: ConvBn,
    proj_shortcut: Option<ConvBn>,
}

impl BottleneckBlock {
    pub fn new(
        vb: &VarBuilder,
        prefix: &str,
        in_planes: usize,
        planes: usize,
        stride: usize,
    ) -> Result<Self> {
        let out_planes = EXPANSION * planes;
        let name = |branch: &str| format!("{prefix}_{branch}");
        let branch2a = ConvBn::new(vb, &name("branch2a"), in_planes, planes, 1, 0, stride)?;
        let branch2b = ConvBn::new(vb, &name("branch2b"), planes, planes, 3, 1, 1)?;
        let branch2c = ConvBn::new(vb, &name("branch2c"), planes, out_planes, 1, 0, 1)?;
        let proj_shortcut = if stride != 1 || in_planes != out_planes {
            let proj = name("proj_shortcut");
            Some(ConvBn::new(vb, &proj, in_planes, out_planes, 1, 0, stride)?)
        } else {
            None
        };
        Ok(Self {
            branch2a,
            branch2b,
            branch2c,
            proj_shortcut,
        })
    }
}

impl Module for BottleneckBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = xs
            .apply(&self.branch2a)?
            .relu()?
            .apply(&self.branch2b)?
            .relu()?
            .apply(&self.branch2c)?;

        if let Some(proj) = &self.proj_shortcut {
            (xs.apply(proj)? + ys)?.relu()
        } else {
            (xs + ys)?.relu()
        }
    }
}

/// One stage of bottleneck blocks, run in order.
#[derive(Debug, Clone)]
pub struct Stage {
    blocks: Vec<BottleneckBlock>,
}

impl Stage {
    fn new(
        vb: &VarBuilder,
        stage: usize,
        in_planes: usize,
        planes: usize,
        stride: usize,
        cnt: usize,
    ) -> Result<Self> {
        let mut blocks = Vec::with_capacity(cnt);
        for block_index in 0..cnt {
            let l_in = if block_index == 0 { in_planes } else { EXPANSION * planes };
            let stride = if block_index == 0 { stride } else { 1 };
            let prefix = format!("stage{stage}_block{block_index}");
            blocks.push(BottleneckBlock::new(vb, &prefix, l_in, planes, stride)?);
        }
        Ok(Self { blocks })
    }

    pub fn blocks(&self) -> &[BottleneckBlock] {
        &self.blocks
    }
}

impl Module for Stage {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.blocks.iter().try_fold(xs.clone(), |xs, block| xs.apply(block))
    }
}

#[derive(Debug, Clone)]
pub struct ResNet50Half {
    conv_1: ConvBn,
    stages: Vec<Stage>,
    fc: Linear,
}

impl ResNet50Half {
    /// Build the network; the classifier layer is loaded from `{fc_name}`.
    pub fn new(vb: VarBuilder, fc_name: &str, nclasses: usize) -> Result<Self> {
        let conv_1 = ConvBn::new(&vb, "1", 3, STEM_WIDTH, 7, 3, 2)?;

        let mut stages = Vec::with_capacity(4);
        let mut in_planes = STEM_WIDTH;
        for (stage, cnt) in [3, 4, 6, 3].into_iter().enumerate() {
            let planes = BASE_WIDTH << stage;
            let stride = if stage == 0 { 1 } else { 2 };
            stages.push(Stage::new(&vb, stage, in_planes, planes, stride, cnt)?);
            in_planes = EXPANSION * planes;
        }

        let fc = nn::linear(in_planes, nclasses, vb.pp(fc_name))?;
        Ok(Self { conv_1, stages, fc })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }
}

impl Module for ResNet50Half {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = xs.apply(&self.conv_1)?.relu()?;
        let xs = max_pool2d_ceil(&xs, 3, 2)?;
        let xs = self.stages.iter().try_fold(xs, |xs, stage| xs.apply(stage))?;
        // global average pool, the 7x7 "pool" layer at the trained input size
        let xs = xs.mean_keepdim(D::Minus2)?.mean_keepdim(D::Minus1)?;
        xs.flatten_from(1)?.apply(&self.fc)
    }
}

/// Creates the ResNet-50-1by2 NSFW classifier.
pub fn resnet50_1by2(vb: VarBuilder, num_classes: usize) -> Result<ResNet50Half> {
    ResNet50Half::new(vb, "fc_nsfw", num_classes)
}
