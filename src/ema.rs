use candle_core::{Tensor, Var};

use crate::error::{ModelError, Result};

/// Averaged shadow weights that can be swapped into the live network.
pub trait EmaShadow {
  /// Folds the current live weights into the shadow.
  fn update(&mut self) -> Result<()>;

  /// Overwrites the live weights with the shadow.
  fn apply_shadow(&mut self) -> Result<()>;
}

/// Exponential moving average of a set of variables.
pub struct Ema {
  decay: f64,
  vars: Vec<Var>,
  shadow: Vec<Tensor>,
  backup: Option<Vec<Tensor>>,
}

impl Ema {
  pub fn new(vars: Vec<Var>, decay: f64) -> Result<Self> {
    if !(0. ..=1.).contains(&decay) {
      return Err(ModelError::config(format!(
        "EMA decay must be within [0, 1], got {decay}"
      )));
    }

    let shadow = vars
      .iter()
      .map(|v| v.as_tensor().detach().copy())
      .collect::<Result<Vec<_>, _>>()?;

    Ok(Self {
      decay,
      vars,
      shadow,
      backup: None,
    })
  }

  /// Puts the live weights saved by [`EmaShadow::apply_shadow`] back.
  pub fn restore(&mut self) -> Result<()> {
    let Some(backup) = self.backup.take() else {
      return Ok(());
    };

    for (var, saved) in self.vars.iter().zip(backup) {
      var.set(&saved)?;
    }
    Ok(())
  }

  pub fn shadow(&self) -> &[Tensor] {
    &self.shadow
  }
}

impl EmaShadow for Ema {
  /// `shadow = decay * shadow + (1 - decay) * live`
  fn update(&mut self) -> Result<()> {
    for (var, shadow) in self.vars.iter().zip(self.shadow.iter_mut()) {
      let live = var.as_tensor().detach();
      *shadow = (shadow.affine(self.decay, 0.)? + live.affine(1. - self.decay, 0.)?)?;
    }
    Ok(())
  }

  fn apply_shadow(&mut self) -> Result<()> {
    let backup = self
      .vars
      .iter()
      .map(|v| v.as_tensor().detach().copy())
      .collect::<Result<Vec<_>, _>>()?;

    for (var, shadow) in self.vars.iter().zip(&self.shadow) {
      var.set(shadow)?;
    }

    self.backup = Some(backup);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use candle_core::Device;

  use super::*;

  #[test]
  fn shadow_trails_live_weights() -> Result<()> {
    let w = Var::new(&[0f32, 0.], &Device::Cpu)?;
    let mut ema = Ema::new(vec![w.clone()], 0.5)?;

    w.set(&Tensor::new(&[4f32, -4.], &Device::Cpu)?)?;
    ema.update()?;
    assert_eq!(ema.shadow()[0].to_vec1::<f32>()?, vec![2., -2.]);

    ema.update()?;
    assert_eq!(ema.shadow()[0].to_vec1::<f32>()?, vec![3., -3.]);
    Ok(())
  }

  #[test]
  fn apply_then_restore() -> Result<()> {
    let w = Var::new(&[1f32], &Device::Cpu)?;
    let mut ema = Ema::new(vec![w.clone()], 0.9)?;

    w.set(&Tensor::new(&[5f32], &Device::Cpu)?)?;
    ema.apply_shadow()?;
    assert_eq!(w.to_vec1::<f32>()?, vec![1.]);

    ema.restore()?;
    assert_eq!(w.to_vec1::<f32>()?, vec![5.]);
    Ok(())
  }

  #[test]
  fn decay_out_of_range() {
    assert!(Ema::new(Vec::new(), 1.5).is_err());
  }
}
