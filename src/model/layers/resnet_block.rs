use std::{fmt, str::FromStr};

use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{conv2d, conv2d_no_bias, Conv2d, Conv2dConfig, Dropout, VarBuilder};

use super::{NormKind, NormLayer};
use crate::{error::ModelError, utils::TensorExt};

/// How the 3x3 convolutions of a [`ResnetBlock`] see past the border.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum PaddingType {
  Reflect,
  Replicate,
  Zero,
}

impl PaddingType {
  /// Zero padding is folded into the convolution itself.
  fn conv_padding(self) -> usize {
    match self {
      PaddingType::Zero => 1,
      _ => 0,
    }
  }

  fn pad(self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
    match self {
      PaddingType::Reflect => x.reflection_pad(3, 1, 1)?.reflection_pad(2, 1, 1),
      PaddingType::Replicate => x.pad_with_same(3, 1, 1)?.pad_with_same(2, 1, 1),
      PaddingType::Zero => Ok(x.clone()),
    }
  }
}

impl FromStr for PaddingType {
  type Err = ModelError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "reflect" => Ok(PaddingType::Reflect),
      "replicate" => Ok(PaddingType::Replicate),
      "zero" => Ok(PaddingType::Zero),
      _ => Err(ModelError::config(format!("padding [{s}] is not implemented"))),
    }
  }
}

impl fmt::Display for PaddingType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      PaddingType::Reflect => "reflect",
      PaddingType::Replicate => "replicate",
      PaddingType::Zero => "zero",
    })
  }
}

/// `x + conv_block(x)` where the block is
/// `pad, conv3x3, norm, relu, [dropout], pad, conv3x3, norm`.
pub struct ResnetBlock {
  dim: usize,
  padding: PaddingType,
  conv1: Conv2d,
  norm1: NormLayer,
  dropout: Option<Dropout>,
  conv2: Conv2d,
  norm2: NormLayer,
}

impl ResnetBlock {
  pub fn new(
    dim: usize,
    padding: PaddingType,
    norm: NormKind,
    use_dropout: bool,
    use_bias: bool,
    vb: VarBuilder,
  ) -> Result<Self, candle_core::Error> {
    let conf = Conv2dConfig {
      padding: padding.conv_padding(),
      ..Default::default()
    };

    let conv1 = if use_bias { conv2d } else { conv2d_no_bias }(dim, dim, 3, conf, vb.pp("conv1"))?;
    let norm1 = norm.build(dim, vb.pp("norm1"))?;

    let conv2 = if use_bias { conv2d } else { conv2d_no_bias }(dim, dim, 3, conf, vb.pp("conv2"))?;
    let norm2 = norm.build(dim, vb.pp("norm2"))?;

    Ok(Self {
      dim,
      padding,
      conv1,
      norm1,
      dropout: use_dropout.then(|| Dropout::new(0.5)),
      conv2,
      norm2,
    })
  }

  pub fn instance_norm_paths(&self) -> Vec<String> {
    [&self.norm1, &self.norm2]
      .into_iter()
      .filter_map(NormLayer::instance_norm_path)
      .map(str::to_owned)
      .collect()
  }
}

impl ModuleT for ResnetBlock {
  fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor, candle_core::Error> {
    let mut y = self.padding.pad(x)?;
    y = self.conv1.forward(&y)?;
    y = self.norm1.forward_t(&y, train)?.relu()?;

    if let Some(dropout) = &self.dropout {
      y = dropout.forward_t(&y, train)?;
    }

    y = self.padding.pad(&y)?;
    y = self.conv2.forward(&y)?;
    y = self.norm2.forward_t(&y, train)?;

    x + y
  }
}

impl fmt::Display for ResnetBlock {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "ResnetBlock(dim={}, padding={}, norm={}, dropout={})",
      self.dim,
      self.padding,
      self.norm1,
      self.dropout.is_some()
    )
  }
}
