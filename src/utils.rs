use std::path::Path;

use candle_core::{shape::Dim, DType, Tensor};
use image::{GrayImage, RgbImage};

use crate::error::{ModelError, Result};

pub trait TensorExt {
  fn reflection_pad<D: Dim>(
    &self,
    dim: D,
    left: usize,
    right: usize,
  ) -> Result<Self, candle_core::Error>
  where
    Self: Sized;
}

impl TensorExt for Tensor {
  fn reflection_pad<D: Dim>(
    &self,
    dim: D,
    left: usize,
    right: usize,
  ) -> Result<Self, candle_core::Error> {
    if left == 0 && right == 0 {
      return Ok(self.clone());
    }

    let dim = dim.to_index(self.shape(), "reflection_pad")?;
    let size = self.dim(dim)?;

    if left >= size || right >= size {
      return Err(
        candle_core::Error::Msg(format!(
          "reflection_pad of ({left}, {right}) needs a dimension larger than {size}"
        ))
        .bt(),
      );
    }

    let mut v = Vec::with_capacity(left + right + 1);
    for i in 0..left {
      v.push(self.narrow(dim, left - i, 1)?);
    }
    v.push(self.clone());
    for i in 0..right {
      v.push(self.narrow(dim, size - i - 2, 1)?);
    }
    Tensor::cat(&v, dim)
  }
}

/// Writes the first image of a `(N, C, H, W)` or `(C, H, W)` tensor with values in
/// `[-1, 1]` as an 8-bit PNG. Only 1 and 3 channel images are supported.
pub fn save_visual(visual: &Tensor, path: impl AsRef<Path>) -> Result<()> {
  let image = match visual.rank() {
    4 => visual.get(0)?,
    3 => visual.clone(),
    rank => {
      return Err(ModelError::config(format!(
        "visuals must have rank 3 or 4, got rank {rank}"
      )))
    }
  };

  let (c, h, w) = image.dims3()?;

  let pixels = ((image.to_dtype(DType::F32)? + 1.)? * 127.5)?
    .clamp(0f32, 255f32)?
    .round()?
    .to_dtype(DType::U8)?
    .permute((1, 2, 0))?
    .flatten_all()?
    .to_vec1::<u8>()?;

  let (width, height) = (w as u32, h as u32);
  let buffer_err = || ModelError::config("image buffer does not match its dimensions");

  match c {
    1 => GrayImage::from_raw(width, height, pixels)
      .ok_or_else(buffer_err)?
      .save(path.as_ref())?,
    3 => RgbImage::from_raw(width, height, pixels)
      .ok_or_else(buffer_err)?
      .save(path.as_ref())?,
    c => {
      return Err(ModelError::config(format!(
        "visuals must have 1 or 3 channels, got {c}"
      )))
    }
  }

  tracing::debug!("Saved visual to {}", path.as_ref().display());

  Ok(())
}
