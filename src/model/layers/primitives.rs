use std::fmt;

use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{layer_norm, LayerNorm, VarBuilder};

#[derive(Clone, Copy, Debug, Default)]
pub struct Identity;

impl Module for Identity {
  fn forward(&self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
    Ok(x.clone())
  }
}

impl fmt::Display for Identity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("Identity()")
  }
}

/// `fn(x) + x`
pub struct Residual<M> {
  pub inner: M,
}

impl<M> Residual<M> {
  pub fn new(inner: M) -> Self {
    Self { inner }
  }
}

impl<M: ModuleT> ModuleT for Residual<M> {
  fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor, candle_core::Error> {
    self.inner.forward_t(x, train)? + x
  }
}

impl<M: fmt::Display> fmt::Display for Residual<M> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Residual({})", self.inner)
  }
}

/// Layer normalization over the last dimension, followed by `fn`.
pub struct Norm<M> {
  norm: LayerNorm,
  dim: usize,
  pub inner: M,
}

impl<M> Norm<M> {
  pub fn new(dim: usize, inner: M, vb: VarBuilder) -> Result<Self, candle_core::Error> {
    let norm = layer_norm(dim, 1e-5, vb.pp("norm"))?;
    Ok(Self { norm, dim, inner })
  }
}

impl<M: ModuleT> ModuleT for Norm<M> {
  fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor, candle_core::Error> {
    let x = self.norm.forward(x)?;
    self.inner.forward_t(&x, train)
  }
}

impl<M: fmt::Display> fmt::Display for Norm<M> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Norm(LayerNorm({}), {})", self.dim, self.inner)
  }
}

#[cfg(test)]
mod tests {
  use candle_core::{DType, Device};
  use candle_nn::VarMap;

  use super::*;

  #[test]
  fn residual_adds_input() -> candle_core::Result<()> {
    let x = Tensor::new(&[[1f32, -2., 3.]], &Device::Cpu)?;
    let y = Residual::new(Identity).forward_t(&x, false)?;
    assert_eq!(y.to_vec2::<f32>()?, vec![vec![2., -4., 6.]]);
    Ok(())
  }

  #[test]
  fn norm_normalizes_before_fn() -> candle_core::Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let norm = Norm::new(4, Identity, vb)?;

    let x = Tensor::new(&[[1f32, 2., 3., 4.], [10., 10., 10., 10.]], &Device::Cpu)?;
    let y = norm.forward_t(&x, false)?.to_vec2::<f32>()?;

    let row_sum: f32 = y[0].iter().sum();
    assert!(row_sum.abs() < 1e-4);
    assert!(y[1].iter().all(|v| v.abs() < 1e-4));
    assert_eq!(varmap.all_vars().len(), 2);
    Ok(())
  }
}
