use std::fmt;

use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{linear, Dropout, Linear, VarBuilder};

/// `dim -> hidden -> dim` projection with GELU in between and dropout on both sides
/// of the bottleneck.
pub struct FeedForward {
  fc1: Linear,
  fc2: Linear,
  dropout: Dropout,
  dim: usize,
  hidden_dim: usize,
  drop_p: f32,
}

impl FeedForward {
  pub fn new(
    dim: usize,
    hidden_dim: usize,
    drop_p: f32,
    vb: VarBuilder,
  ) -> Result<Self, candle_core::Error> {
    let fc1 = linear(dim, hidden_dim, vb.pp("fc1"))?;
    let fc2 = linear(hidden_dim, dim, vb.pp("fc2"))?;

    Ok(Self {
      fc1,
      fc2,
      dropout: Dropout::new(drop_p),
      dim,
      hidden_dim,
      drop_p,
    })
  }
}

impl ModuleT for FeedForward {
  fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor, candle_core::Error> {
    let mut x = self.fc1.forward(x)?;
    x = x.gelu_erf()?;
    x = self.dropout.forward_t(&x, train)?;
    x = self.fc2.forward(&x)?;
    self.dropout.forward_t(&x, train)
  }
}

impl fmt::Display for FeedForward {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "FeedForward(Linear({} -> {}), GELU, Dropout({}), Linear({} -> {}), Dropout({}))",
      self.dim, self.hidden_dim, self.drop_p, self.hidden_dim, self.dim, self.drop_p
    )
  }
}

#[cfg(test)]
mod tests {
  use candle_core::{DType, Device};
  use candle_nn::VarMap;

  use super::*;

  #[test]
  fn keeps_feature_dim() -> candle_core::Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let ff = FeedForward::new(32, 128, 0.1, vb)?;

    let x = Tensor::randn(0f32, 1., (4, 10, 32), &Device::Cpu)?;
    assert_eq!(ff.forward_t(&x, true)?.dims(), &[4, 10, 32]);
    assert_eq!(ff.forward_t(&x, false)?.dims(), &[4, 10, 32]);

    // two weights, two biases
    assert_eq!(varmap.all_vars().len(), 4);
    Ok(())
  }

  #[test]
  fn inference_is_deterministic() -> candle_core::Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let ff = FeedForward::new(8, 16, 0.5, vb)?;

    let x = Tensor::randn(0f32, 1., (3, 8), &Device::Cpu)?;
    let a = ff.forward_t(&x, false)?.to_vec2::<f32>()?;
    let b = ff.forward_t(&x, false)?.to_vec2::<f32>()?;
    assert_eq!(a, b);
    Ok(())
  }
}
