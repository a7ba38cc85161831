use std::{fmt, str::FromStr};

use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{batch_norm, BatchNorm, BatchNormConfig, VarBuilder};

use crate::error::ModelError;

/// Normalization injected into [`super::ResnetBlock`] and [`super::UnetBlock`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum NormKind {
  #[default]
  Batch,
  Instance,
  None,
}

impl NormKind {
  pub fn is_instance(self) -> bool {
    self == NormKind::Instance
  }

  /// Instance norm recenters every channel, so a convolution bias in front of it is redundant.
  pub fn use_bias(self) -> bool {
    !self.is_instance()
  }

  pub fn build(self, channels: usize, vb: VarBuilder) -> Result<NormLayer, candle_core::Error> {
    Ok(match self {
      NormKind::Batch => NormLayer::Batch(
        batch_norm(channels, BatchNormConfig::default(), vb)?,
        channels,
      ),
      NormKind::Instance => NormLayer::Instance(InstanceNorm2d::new(channels, vb.prefix())),
      NormKind::None => NormLayer::Identity,
    })
  }
}

impl FromStr for NormKind {
  type Err = ModelError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "batch" => Ok(NormKind::Batch),
      "instance" => Ok(NormKind::Instance),
      "none" => Ok(NormKind::None),
      _ => Err(ModelError::config(format!(
        "normalization layer [{s}] is not found"
      ))),
    }
  }
}

impl fmt::Display for NormKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      NormKind::Batch => "batch",
      NormKind::Instance => "instance",
      NormKind::None => "none",
    })
  }
}

/// Per-sample, per-channel normalization over the spatial dims of a `(N, C, H, W)` input.
/// Holds no affine parameters and no running statistics.
#[derive(Clone, Debug)]
pub struct InstanceNorm2d {
  channels: usize,
  eps: f64,
  path: String,
}

impl InstanceNorm2d {
  pub fn new(channels: usize, path: String) -> Self {
    Self {
      channels,
      eps: 1e-5,
      path,
    }
  }

  /// Dotted path this layer was built under.
  pub fn path(&self) -> &str {
    &self.path
  }
}

impl Module for InstanceNorm2d {
  fn forward(&self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
    let (_, c, _, _) = x.dims4()?;
    if c != self.channels {
      return Err(
        candle_core::Error::Msg(format!(
          "InstanceNorm2d expects {} channels, got {c}",
          self.channels
        ))
        .bt(),
      );
    }

    let mean = x.mean_keepdim((2, 3))?;
    let centered = x.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim((2, 3))?;
    centered.broadcast_div(&(var + self.eps)?.sqrt()?)
  }
}

pub enum NormLayer {
  Batch(BatchNorm, usize),
  Instance(InstanceNorm2d),
  Identity,
}

impl NormLayer {
  pub fn instance_norm_path(&self) -> Option<&str> {
    match self {
      NormLayer::Instance(m) => Some(m.path()),
      _ => None,
    }
  }
}

impl ModuleT for NormLayer {
  fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor, candle_core::Error> {
    match self {
      NormLayer::Batch(m, _) => m.forward_t(x, train),
      NormLayer::Instance(m) => m.forward(x),
      NormLayer::Identity => Ok(x.clone()),
    }
  }
}

impl fmt::Display for NormLayer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      NormLayer::Batch(_, c) => write!(f, "BatchNorm2d({c})"),
      NormLayer::Instance(m) => write!(f, "InstanceNorm2d({})", m.channels),
      NormLayer::Identity => f.write_str("Identity"),
    }
  }
}

#[cfg(test)]
mod tests {
  use candle_core::{DType, Device, D};
  use candle_nn::VarMap;

  use super::*;

  #[test]
  fn instance_norm_zero_mean_unit_var() -> candle_core::Result<()> {
    let dev = Device::Cpu;
    let x = (Tensor::randn(0f32, 3., (2, 4, 8, 8), &dev)? + 5.)?;
    let y = InstanceNorm2d::new(4, "norm".to_owned()).forward(&x)?;

    let flat = y.flatten_from(2)?;
    let mean = flat.mean(D::Minus1)?.abs()?.max_all()?.to_scalar::<f32>()?;
    let var = flat.sqr()?.mean(D::Minus1)?.to_vec2::<f32>()?;

    assert!(mean < 1e-4);
    for row in var {
      for v in row {
        assert!((v - 1.).abs() < 1e-2);
      }
    }
    Ok(())
  }

  #[test]
  fn instance_norm_has_no_variables() -> candle_core::Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let layer = NormKind::Instance.build(16, vb.pp("up_norm"))?;

    assert!(varmap.all_vars().is_empty());
    assert_eq!(layer.instance_norm_path(), Some("up_norm"));
    Ok(())
  }

  #[test]
  fn parse_norm_kind() {
    assert_eq!("instance".parse::<NormKind>().ok(), Some(NormKind::Instance));
    assert!(matches!(
      "group".parse::<NormKind>(),
      Err(ModelError::Configuration(_))
    ));
  }
}
