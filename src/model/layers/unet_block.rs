use std::fmt;

use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{
  conv2d, conv2d_no_bias, conv_transpose2d, conv_transpose2d_no_bias, ops::leaky_relu, Conv2d,
  Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig, Dropout, VarBuilder,
};

use super::{NormKind, NormLayer};
use crate::error::ModelError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnetVariant {
  /// Input/output boundary of the network, no skip concatenation.
  Outermost,
  Middle,
  /// Bottleneck, wraps no other block.
  Innermost,
}

impl fmt::Display for UnetVariant {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      UnetVariant::Outermost => "outermost",
      UnetVariant::Middle => "middle",
      UnetVariant::Innermost => "innermost",
    })
  }
}

#[derive(Clone, Copy, Debug)]
pub struct UnetBlockConfig {
  /// Defaults to `out_channel`.
  pub in_channel: Option<usize>,
  pub out_channel: usize,
  pub hidden_channel: usize,
  pub norm: NormKind,
  /// Only honored by middle blocks.
  pub use_dropout: bool,
}

impl Default for UnetBlockConfig {
  fn default() -> Self {
    Self {
      in_channel: None,
      out_channel: 1,
      hidden_channel: 1,
      norm: NormKind::Batch,
      use_dropout: false,
    }
  }
}

enum Layers {
  Outermost {
    down_conv: Conv2d,
    inner: Box<UnetBlock>,
    up_conv: ConvTranspose2d,
  },
  Middle {
    down_conv: Conv2d,
    down_norm: NormLayer,
    inner: Box<UnetBlock>,
    up_conv: ConvTranspose2d,
    up_norm: NormLayer,
    dropout: Option<Dropout>,
  },
  Innermost {
    down_conv: Conv2d,
    up_conv: ConvTranspose2d,
    up_norm: NormLayer,
  },
}

/// One level of a U-Net. Blocks are assembled bottom-up: an innermost block first, then
/// each middle block wraps the previous one, and an outermost block closes the tree.
///
/// Non-outermost blocks return `cat([x, up(inner(down(x)))], 1)`, so their output has
/// `in_channel + out_channel` channels.
pub struct UnetBlock {
  in_channel: usize,
  out_channel: usize,
  hidden_channel: usize,
  norm: NormKind,
  layers: Layers,
}

/// k4 s2 p1, halves the spatial size
fn down_config() -> Conv2dConfig {
  Conv2dConfig {
    padding: 1,
    stride: 2,
    ..Default::default()
  }
}

/// k4 s2 p1, doubles the spatial size
fn up_config() -> ConvTranspose2dConfig {
  ConvTranspose2dConfig {
    padding: 1,
    stride: 2,
    ..Default::default()
  }
}

fn down_conv(
  in_channel: usize,
  hidden_channel: usize,
  bias: bool,
  vb: VarBuilder,
) -> Result<Conv2d, candle_core::Error> {
  (if bias { conv2d } else { conv2d_no_bias })(in_channel, hidden_channel, 4, down_config(), vb)
}

fn up_conv(
  in_channel: usize,
  out_channel: usize,
  bias: bool,
  vb: VarBuilder,
) -> Result<ConvTranspose2d, candle_core::Error> {
  let conv = if bias {
    conv_transpose2d
  } else {
    conv_transpose2d_no_bias
  };
  conv(in_channel, out_channel, 4, up_config(), vb)
}

fn config_error(msg: String) -> candle_core::Error {
  candle_core::Error::wrap(ModelError::Configuration(msg)).bt()
}

impl UnetBlock {
  pub fn innermost(config: UnetBlockConfig, vb: VarBuilder) -> Result<Self, candle_core::Error> {
    let in_channel = config.in_channel.unwrap_or(config.out_channel);
    let bias = config.norm.use_bias();

    let down_conv = down_conv(in_channel, config.hidden_channel, bias, vb.pp("down_conv"))?;
    let up_conv = up_conv(config.hidden_channel, config.out_channel, bias, vb.pp("up_conv"))?;
    let up_norm = config.norm.build(config.out_channel, vb.pp("up_norm"))?;

    Ok(Self::with_layers(
      config,
      in_channel,
      Layers::Innermost {
        down_conv,
        up_conv,
        up_norm,
      },
    ))
  }

  pub fn middle(
    config: UnetBlockConfig,
    inner: UnetBlock,
    vb: VarBuilder,
  ) -> Result<Self, candle_core::Error> {
    let in_channel = config.in_channel.unwrap_or(config.out_channel);
    let bias = config.norm.use_bias();
    Self::check_inner(&config, &inner)?;

    let down_conv = down_conv(in_channel, config.hidden_channel, bias, vb.pp("down_conv"))?;
    let down_norm = config.norm.build(config.hidden_channel, vb.pp("down_norm"))?;
    let up_conv = up_conv(
      config.hidden_channel * 2,
      config.out_channel,
      bias,
      vb.pp("up_conv"),
    )?;
    let up_norm = config.norm.build(config.out_channel, vb.pp("up_norm"))?;

    Ok(Self::with_layers(
      config,
      in_channel,
      Layers::Middle {
        down_conv,
        down_norm,
        inner: Box::new(inner),
        up_conv,
        up_norm,
        dropout: config.use_dropout.then(|| Dropout::new(0.5)),
      },
    ))
  }

  pub fn outermost(
    config: UnetBlockConfig,
    inner: UnetBlock,
    vb: VarBuilder,
  ) -> Result<Self, candle_core::Error> {
    let in_channel = config.in_channel.unwrap_or(config.out_channel);
    Self::check_inner(&config, &inner)?;

    let down_conv = down_conv(
      in_channel,
      config.hidden_channel,
      config.norm.use_bias(),
      vb.pp("down_conv"),
    )?;
    // the final projection always carries a bias, there is no norm after it
    let up_conv = up_conv(
      config.hidden_channel * 2,
      config.out_channel,
      true,
      vb.pp("up_conv"),
    )?;

    Ok(Self::with_layers(
      config,
      in_channel,
      Layers::Outermost {
        down_conv,
        inner: Box::new(inner),
        up_conv,
      },
    ))
  }

  fn with_layers(config: UnetBlockConfig, in_channel: usize, layers: Layers) -> Self {
    Self {
      in_channel,
      out_channel: config.out_channel,
      hidden_channel: config.hidden_channel,
      norm: config.norm,
      layers,
    }
  }

  fn check_inner(config: &UnetBlockConfig, inner: &UnetBlock) -> Result<(), candle_core::Error> {
    if inner.variant() == UnetVariant::Outermost {
      return Err(config_error(
        "an outermost UnetBlock cannot be wrapped by another block".to_owned(),
      ));
    }

    if inner.in_channel != config.hidden_channel {
      return Err(config_error(format!(
        "inner UnetBlock takes {} channels, but hidden_channel is {}",
        inner.in_channel, config.hidden_channel
      )));
    }

    if inner.output_channels() != config.hidden_channel * 2 {
      return Err(config_error(format!(
        "inner UnetBlock yields {} channels, the up convolution expects {}",
        inner.output_channels(),
        config.hidden_channel * 2
      )));
    }

    Ok(())
  }

  pub fn variant(&self) -> UnetVariant {
    match self.layers {
      Layers::Outermost { .. } => UnetVariant::Outermost,
      Layers::Middle { .. } => UnetVariant::Middle,
      Layers::Innermost { .. } => UnetVariant::Innermost,
    }
  }

  pub fn in_channels(&self) -> usize {
    self.in_channel
  }

  pub fn output_channels(&self) -> usize {
    match self.variant() {
      UnetVariant::Outermost => self.out_channel,
      _ => self.in_channel + self.out_channel,
    }
  }

  /// Number of blocks from here down to the innermost one, inclusive.
  pub fn depth(&self) -> usize {
    match &self.layers {
      Layers::Outermost { inner, .. } | Layers::Middle { inner, .. } => inner.depth() + 1,
      Layers::Innermost { .. } => 1,
    }
  }

  pub fn instance_norm_paths(&self) -> Vec<String> {
    let (norms, inner): (Vec<&NormLayer>, _) = match &self.layers {
      Layers::Outermost { inner, .. } => (vec![], Some(inner)),
      Layers::Middle {
        down_norm,
        up_norm,
        inner,
        ..
      } => (vec![down_norm, up_norm], Some(inner)),
      Layers::Innermost { up_norm, .. } => (vec![up_norm], None),
    };

    let mut paths: Vec<String> = norms
      .into_iter()
      .filter_map(NormLayer::instance_norm_path)
      .map(str::to_owned)
      .collect();

    if let Some(inner) = inner {
      paths.extend(inner.instance_norm_paths());
    }

    paths
  }

  fn fmt_nested(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    let pad = depth * 2;
    writeln!(
      f,
      "{:pad$}UnetBlock[{}](in={}, out={}, hidden={}, norm={})",
      "",
      self.variant(),
      self.in_channel,
      self.out_channel,
      self.hidden_channel,
      self.norm,
    )?;

    let pad = pad + 2;
    let bias = self.norm.use_bias();
    let down = format!(
      "Conv2d({} -> {}, k=4, s=2, p=1, bias={bias})",
      self.in_channel, self.hidden_channel
    );
    let up = |in_channel: usize, bias: bool| {
      format!(
        "ConvTranspose2d({in_channel} -> {}, k=4, s=2, p=1, bias={bias})",
        self.out_channel
      )
    };

    match &self.layers {
      Layers::Outermost { inner, .. } => {
        writeln!(f, "{:pad$}{down}", "")?;
        inner.fmt_nested(f, depth + 1)?;
        writeln!(f, "{:pad$}ReLU", "")?;
        writeln!(f, "{:pad$}{}", "", up(self.hidden_channel * 2, true))?;
        writeln!(f, "{:pad$}Tanh", "")
      }

      Layers::Middle {
        down_norm,
        inner,
        up_norm,
        dropout,
        ..
      } => {
        writeln!(f, "{:pad$}LeakyReLU(0.2)", "")?;
        writeln!(f, "{:pad$}{down}", "")?;
        writeln!(f, "{:pad$}{down_norm}", "")?;
        inner.fmt_nested(f, depth + 1)?;
        writeln!(f, "{:pad$}ReLU", "")?;
        writeln!(f, "{:pad$}{}", "", up(self.hidden_channel * 2, bias))?;
        writeln!(f, "{:pad$}{up_norm}", "")?;
        if dropout.is_some() {
          writeln!(f, "{:pad$}Dropout(0.5)", "")?;
        }
        Ok(())
      }

      Layers::Innermost { up_norm, .. } => {
        writeln!(f, "{:pad$}LeakyReLU(0.2)", "")?;
        writeln!(f, "{:pad$}{down}", "")?;
        writeln!(f, "{:pad$}ReLU", "")?;
        writeln!(f, "{:pad$}{}", "", up(self.hidden_channel, bias))?;
        writeln!(f, "{:pad$}{up_norm}", "")
      }
    }
  }
}

impl ModuleT for UnetBlock {
  fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor, candle_core::Error> {
    match &self.layers {
      Layers::Outermost {
        down_conv,
        inner,
        up_conv,
      } => {
        let mut y = down_conv.forward(x)?;
        y = inner.forward_t(&y, train)?;
        y = up_conv.forward(&y.relu()?)?;
        y.tanh()
      }

      Layers::Innermost {
        down_conv,
        up_conv,
        up_norm,
      } => {
        let mut y = down_conv.forward(&leaky_relu(x, 0.2)?)?;
        y = up_conv.forward(&y.relu()?)?;
        y = up_norm.forward_t(&y, train)?;
        Tensor::cat(&[x, &y], 1)
      }

      Layers::Middle {
        down_conv,
        down_norm,
        inner,
        up_conv,
        up_norm,
        dropout,
      } => {
        let mut y = down_conv.forward(&leaky_relu(x, 0.2)?)?;
        y = down_norm.forward_t(&y, train)?;
        y = inner.forward_t(&y, train)?;
        y = up_conv.forward(&y.relu()?)?;
        y = up_norm.forward_t(&y, train)?;

        if let Some(dropout) = dropout {
          y = dropout.forward_t(&y, train)?;
        }

        Tensor::cat(&[x, &y], 1)
      }
    }
  }
}

impl fmt::Display for UnetBlock {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.fmt_nested(f, 0)
  }
}

/// Classic U-Net generator: `num_downs` halvings, so a 256x256 input with `num_downs = 8`
/// reaches a 1x1 bottleneck.
pub fn unet_generator(
  in_channel: usize,
  out_channel: usize,
  num_downs: usize,
  ngf: usize,
  norm: NormKind,
  use_dropout: bool,
  vb: VarBuilder,
) -> Result<UnetBlock, candle_core::Error> {
  if num_downs < 5 {
    return Err(config_error(format!(
      "a U-Net generator needs at least 5 downsamplings, got {num_downs}"
    )));
  }

  // block k sits under k "submodule" segments, the outermost block at k = 0
  let vb_at = |k: usize| (0..k).fold(vb.clone(), |vb, _| vb.pp("submodule"));
  let config = |out_channel: usize, hidden_channel: usize| UnetBlockConfig {
    in_channel: None,
    out_channel,
    hidden_channel,
    norm,
    use_dropout: false,
  };

  let mut level = num_downs - 1;
  let mut block = UnetBlock::innermost(config(ngf * 8, ngf * 8), vb_at(level))?;

  for _ in 0..num_downs - 5 {
    level -= 1;
    block = UnetBlock::middle(
      UnetBlockConfig {
        use_dropout,
        ..config(ngf * 8, ngf * 8)
      },
      block,
      vb_at(level),
    )?;
  }

  for (out, hidden) in [(ngf * 4, ngf * 8), (ngf * 2, ngf * 4), (ngf, ngf * 2)] {
    level -= 1;
    block = UnetBlock::middle(config(out, hidden), block, vb_at(level))?;
  }

  UnetBlock::outermost(
    UnetBlockConfig {
      in_channel: Some(in_channel),
      ..config(out_channel, ngf)
    },
    block,
    vb_at(0),
  )
}
