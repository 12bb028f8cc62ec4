//! The inference seam: anything that maps named input blobs to named output blobs.

use std::collections::HashMap;

use candle_core::{Shape, Tensor};

use crate::error::Result;

/// Name of the image input blob.
pub const DATA_BLOB: &str = "data";

/// Name of the class probability output blob.
pub const PROB_BLOB: &str = "prob";

/// A constructed network ready for forward passes.
pub trait Network {
    /// Declared shape of blob `name`.
    fn blob_shape(&self, name: &str) -> Result<Shape>;

    /// Names of the input blobs, in declaration order.
    fn inputs(&self) -> &[String];

    /// Names of the default output blobs.
    fn outputs(&self) -> &[String];

    /// Run one forward pass over `inputs` and return the requested `blobs`.
    fn forward_all(
        &self,
        blobs: &[&str],
        inputs: &[(&str, &Tensor)],
    ) -> Result<HashMap<String, Tensor>>;
}

impl<N: Network + ?Sized> Network for Box<N> {
    fn blob_shape(&self, name: &str) -> Result<Shape> {
        (**self).blob_shape(name)
    }

    fn inputs(&self) -> &[String] {
        (**self).inputs()
    }

    fn outputs(&self) -> &[String] {
        (**self).outputs()
    }

    fn forward_all(
        &self,
        blobs: &[&str],
        inputs: &[(&str, &Tensor)],
    ) -> Result<HashMap<String, Tensor>> {
        (**self).forward_all(blobs, inputs)
    }
}
