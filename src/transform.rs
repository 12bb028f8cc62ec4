//! Preprocessing: decode to a float array, center-crop, and run the
//! [`Transformer`] that turns a crop into the network's input layout.

use std::collections::HashMap;

use candle_core::{DType, Device, Shape, Tensor};

use crate::error::{Error, Result};

/// Per-channel dataset mean the network was trained with, applied in BGR order.
pub const NSFW_MEAN: [f32; 3] = [104.0, 117.0, 123.0];

/// Decode image bytes into an `(H, W, 3)` RGB tensor with values in `[0, 1]`.
///
/// # Errors
///
/// Returns [`Error::Decode`] if the bytes are not a supported image.
pub fn load_image(data: &[u8]) -> Result<Tensor> {
    let img = image::load_from_memory(data).map_err(Error::Decode)?.into_rgb8();
    let (width, height) = img.dimensions();
    let data = img.into_raw();
    let xs = Tensor::from_vec(data, (height as usize, width as usize, 3), &Device::Cpu)?;
    Ok((xs.to_dtype(DType::F32)? / 255.0)?)
}

/// `(h_off, w_off)` of a centered window, clamped at zero.
#[must_use]
pub fn crop_offsets(
    height: usize,
    width: usize,
    crop_height: usize,
    crop_width: usize,
) -> (usize, usize) {
    (height.saturating_sub(crop_height) / 2, width.saturating_sub(crop_width) / 2)
}

/// Center-crop an `(H, W, C)` tensor to `(crop_height, crop_width, C)`.
///
/// # Errors
///
/// Returns [`Error::UndersizedImage`] when the image is smaller than the crop
/// in either dimension.
pub fn center_crop(image: &Tensor, crop_height: usize, crop_width: usize) -> Result<Tensor> {
    let (height, width, _) = image.dims3()?;
    if height < crop_height || width < crop_width {
        return Err(Error::UndersizedImage {
            width,
            height,
            crop_width,
            crop_height,
        });
    }
    let (h_off, w_off) = crop_offsets(height, width, crop_height, crop_width);
    tracing::debug!(h_off, w_off, crop_height, crop_width, "center crop");
    Ok(image.narrow(0, h_off, crop_height)?.narrow(1, w_off, crop_width)?)
}

#[derive(Debug, Clone, Default)]
struct InputParams {
    transpose: Option<[usize; 3]>,
    channel_swap: Option<[usize; 3]>,
    raw_scale: Option<f64>,
    mean: Option<[f32; 3]>,
}

/// Preprocessing parameters for the network inputs, keyed by input blob name.
///
/// [`Transformer::preprocess`] always applies the configured steps in the same
/// order: transpose, channel swap, raw scale, mean subtraction. The mean is
/// therefore indexed by the channel order *after* the swap.
#[derive(Debug, Clone)]
pub struct Transformer {
    inputs: HashMap<String, Shape>,
    params: HashMap<String, InputParams>,
}

impl Transformer {
    /// Create a transformer for inputs with the given declared `(N, C, H, W)` shapes.
    pub fn new(inputs: HashMap<String, Shape>) -> Self {
        Self {
            inputs,
            params: HashMap::new(),
        }
    }

    /// The fixed configuration the NSFW network expects on `input`:
    /// HWC to CHW, RGB to BGR, `[0, 1]` to `[0, 255]`, minus [`NSFW_MEAN`].
    pub fn nsfw(input: &str, shape: Shape) -> Result<Self> {
        let mut transformer = Self::new(HashMap::from([(input.to_string(), shape)]));
        transformer.set_transpose(input, [2, 0, 1])?;
        transformer.set_mean(input, NSFW_MEAN)?;
        transformer.set_raw_scale(input, 255.0)?;
        transformer.set_channel_swap(input, [2, 1, 0])?;
        Ok(transformer)
    }

    fn check_input(&mut self, name: &str) -> Result<&mut InputParams> {
        let shape = self.inputs.get(name).ok_or_else(|| Error::UnknownBlob(name.to_string()))?;
        let (_, channels, _, _) = shape.dims4()?;
        if channels != 3 {
            return Err(Error::ShapeMismatch {
                expected: "3 input channels".to_string(),
                actual: format!("{shape:?}"),
            });
        }
        Ok(self.params.entry(name.to_string()).or_default())
    }

    /// Axis order applied to the `(H, W, C)` crop; `[2, 0, 1]` yields `(C, H, W)`.
    pub fn set_transpose(&mut self, name: &str, order: [usize; 3]) -> Result<()> {
        validate_permutation("transpose", order)?;
        self.check_input(name)?.transpose = Some(order);
        Ok(())
    }

    /// Channel order of the output, e.g. `[2, 1, 0]` for RGB to BGR.
    pub fn set_channel_swap(&mut self, name: &str, order: [usize; 3]) -> Result<()> {
        validate_permutation("channel_swap", order)?;
        self.check_input(name)?.channel_swap = Some(order);
        Ok(())
    }

    /// Multiplier applied to raw intensities.
    pub fn set_raw_scale(&mut self, name: &str, scale: f64) -> Result<()> {
        if !scale.is_finite() {
            return Err(Error::InvalidParameter {
                name: "raw_scale".to_string(),
                reason: "must be finite".to_string(),
            });
        }
        self.check_input(name)?.raw_scale = Some(scale);
        Ok(())
    }

    pub fn set_mean(&mut self, name: &str, mean: [f32; 3]) -> Result<()> {
        self.check_input(name)?.mean = Some(mean);
        Ok(())
    }

    /// Turn an `(H, W, 3)` crop into the `(3, H, W)` layout of input `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownBlob`] for an unknown input and
    /// [`Error::ShapeMismatch`] if the result does not match the declared
    /// channel count and spatial size.
    pub fn preprocess(&self, name: &str, data: &Tensor) -> Result<Tensor> {
        let shape = self.inputs.get(name).ok_or_else(|| Error::UnknownBlob(name.to_string()))?;
        let params = self.params.get(name).cloned().unwrap_or_default();

        let mut xs = data.to_dtype(DType::F32)?;
        if let Some([a, b, c]) = params.transpose {
            xs = xs.permute((a, b, c))?;
        }
        if let Some(order) = params.channel_swap {
            let planes = order
                .iter()
                .map(|&c| xs.narrow(0, c, 1))
                .collect::<candle_core::Result<Vec<_>>>()?;
            xs = Tensor::cat(&planes, 0)?;
        }
        if let Some(scale) = params.raw_scale {
            xs = xs.affine(scale, 0.0)?;
        }
        if let Some(mean) = params.mean {
            let mean = Tensor::new(&mean, xs.device())?.reshape((3, 1, 1))?;
            xs = xs.broadcast_sub(&mean)?;
        }

        let (_, channels, height, width) = shape.dims4()?;
        if xs.dims() != [channels, height, width] {
            return Err(Error::ShapeMismatch {
                expected: format!("[{channels}, {height}, {width}]"),
                actual: format!("{:?}", xs.dims()),
            });
        }
        Ok(xs)
    }
}

fn validate_permutation(name: &str, order: [usize; 3]) -> Result<()> {
    let mut sorted = order;
    sorted.sort_unstable();
    if sorted != [0, 1, 2] {
        return Err(Error::InvalidParameter {
            name: name.to_string(),
            reason: format!("{order:?} is not a permutation of [0, 1, 2]"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crop_offsets_centered() {
        assert_eq!(crop_offsets(256, 256, 224, 224), (16, 16));
        assert_eq!(crop_offsets(257, 300, 224, 224), (16, 38));
        assert_eq!(crop_offsets(100, 100, 224, 224), (0, 0));
    }

    #[test]
    fn test_center_crop_shape() -> Result<()> {
        let image = Tensor::zeros((256, 256, 3), DType::F32, &Device::Cpu)?;
        let crop = center_crop(&image, 224, 224)?;
        assert_eq!(crop.dims(), &[224, 224, 3]);
        Ok(())
    }

    #[test]
    fn test_center_crop_takes_middle() -> Result<()> {
        // rows 0..4 hold their own index in every column and channel
        let image = Tensor::arange(0f32, 4.0, &Device::Cpu)?
            .reshape((4, 1, 1))?
            .broadcast_as((4, 4, 3))?
            .contiguous()?;
        let crop = center_crop(&image, 2, 2)?;
        let rows = crop.narrow(2, 0, 1)?.squeeze(2)?.to_vec2::<f32>()?;
        assert_eq!(rows, vec![vec![1.0, 1.0], vec![2.0, 2.0]]);
        Ok(())
    }

    #[test]
    fn test_undersized_crop_errors() -> Result<()> {
        let image = Tensor::zeros((200, 256, 3), DType::F32, &Device::Cpu)?;
        match center_crop(&image, 224, 224) {
            Err(Error::UndersizedImage {
                height,
                crop_height,
                ..
            }) => {
                assert_eq!(height, 200);
                assert_eq!(crop_height, 224);
            }
            other => panic!("expected UndersizedImage, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_preprocess_order() -> Result<()> {
        let transformer = Transformer::nsfw("data", Shape::from((1, 3, 1, 1)))?;
        // one pixel, R = 1.0, G = 0.0, B = 0.5
        let crop = Tensor::new(&[[[1.0f32, 0.0, 0.5]]], &Device::Cpu)?;
        let xs = transformer.preprocess("data", &crop)?;
        assert_eq!(xs.dims(), &[3, 1, 1]);
        let values = xs.flatten_all()?.to_vec1::<f32>()?;
        // BGR, scaled to 0..255, then minus [104, 117, 123]
        let expected = [127.5 - 104.0, -117.0, 255.0 - 123.0];
        for (v, e) in values.iter().zip(expected) {
            assert!((v - e).abs() < 1e-3, "{values:?}");
        }
        Ok(())
    }

    #[test]
    fn test_preprocess_is_deterministic() -> Result<()> {
        let transformer = Transformer::nsfw("data", Shape::from((1, 3, 4, 4)))?;
        let crop = Tensor::rand(0f32, 1.0, (4, 4, 3), &Device::Cpu)?;
        let a = transformer.preprocess("data", &crop)?.flatten_all()?.to_vec1::<f32>()?;
        let b = transformer.preprocess("data", &crop)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_preprocess_rejects_wrong_size() -> Result<()> {
        let transformer = Transformer::nsfw("data", Shape::from((1, 3, 4, 4)))?;
        let crop = Tensor::zeros((3, 4, 3), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            transformer.preprocess("data", &crop),
            Err(Error::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_unknown_input() -> Result<()> {
        let mut transformer = Transformer::nsfw("data", Shape::from((1, 3, 4, 4)))?;
        assert!(matches!(transformer.set_raw_scale("label", 1.0), Err(Error::UnknownBlob(_))));
        let crop = Tensor::zeros((4, 4, 3), DType::F32, &Device::Cpu)?;
        assert!(matches!(transformer.preprocess("label", &crop), Err(Error::UnknownBlob(_))));
        Ok(())
    }

    #[test]
    fn test_channel_swap_must_be_permutation() -> Result<()> {
        let mut transformer = Transformer::nsfw("data", Shape::from((1, 3, 4, 4)))?;
        assert!(matches!(
            transformer.set_channel_swap("data", [0, 0, 1]),
            Err(Error::InvalidParameter { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_load_image_range() -> Result<()> {
        let img = image::RgbImage::from_pixel(3, 2, image::Rgb([255, 0, 51]));
        let mut cursor = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut cursor, image::ImageFormat::Png)
            .map_err(Error::Encode)?;
        let xs = load_image(cursor.get_ref())?;
        assert_eq!(xs.dims(), &[2, 3, 3]);
        let first = xs.narrow(0, 0, 1)?.narrow(1, 0, 1)?.flatten_all()?.to_vec1::<f32>()?;
        for (v, e) in first.iter().zip([1.0, 0.0, 0.2]) {
            assert!((v - e).abs() < 1e-6, "{first:?}");
        }
        Ok(())
    }
}
