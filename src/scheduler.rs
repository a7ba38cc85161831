use std::f64::consts::PI;

use crate::{
  config::{LrPolicy, ModelConfig},
  error::{ModelError, Result},
};

/// Learning-rate schedule bound to one optimizer. `step` is called once per epoch and
/// returns the learning rate the optimizer should use next.
#[derive(Clone, Debug)]
pub enum LrScheduler {
  Linear {
    base_lr: f64,
    epoch: usize,
    epoch_count: usize,
    n_epochs: usize,
    n_epochs_decay: usize,
  },
  Step {
    base_lr: f64,
    epoch: usize,
    step_size: usize,
    gamma: f64,
  },
  Plateau(Plateau),
  Cosine {
    base_lr: f64,
    epoch: usize,
    t_max: usize,
    eta_min: f64,
  },
}

/// Reduces the learning rate once a minimized metric stops improving.
#[derive(Clone, Debug)]
pub struct Plateau {
  factor: f64,
  patience: usize,
  threshold: f64,
  min_lr: f64,
  eps: f64,
  best: f64,
  num_bad_epochs: usize,
}

impl Default for Plateau {
  fn default() -> Self {
    Self {
      factor: 0.2,
      patience: 5,
      threshold: 0.01,
      min_lr: 0.,
      eps: 1e-8,
      best: f64::INFINITY,
      num_bad_epochs: 0,
    }
  }
}

impl Plateau {
  fn step(&mut self, lr: f64, metric: f64) -> f64 {
    // relative threshold in `min` mode
    if metric < self.best * (1. - self.threshold) {
      self.best = metric;
      self.num_bad_epochs = 0;
    } else {
      self.num_bad_epochs += 1;
    }

    if self.num_bad_epochs <= self.patience {
      return lr;
    }

    self.num_bad_epochs = 0;
    let new_lr = (lr * self.factor).max(self.min_lr);
    if lr - new_lr > self.eps {
      new_lr
    } else {
      lr
    }
  }
}

impl LrScheduler {
  pub fn new(conf: &ModelConfig, base_lr: f64) -> Result<Self> {
    Ok(match conf.lr_policy {
      LrPolicy::Linear => LrScheduler::Linear {
        base_lr,
        epoch: 0,
        epoch_count: conf.epoch_count,
        n_epochs: conf.n_epochs,
        n_epochs_decay: conf.n_epochs_decay,
      },
      LrPolicy::Step => {
        if conf.lr_decay_iters == 0 {
          return Err(ModelError::config("step policy needs lr_decay_iters > 0"));
        }
        LrScheduler::Step {
          base_lr,
          epoch: 0,
          step_size: conf.lr_decay_iters,
          gamma: 0.1,
        }
      }
      LrPolicy::Plateau => LrScheduler::Plateau(Plateau::default()),
      LrPolicy::Cosine => {
        if conf.n_epochs == 0 {
          return Err(ModelError::config("cosine policy needs n_epochs > 0"));
        }
        LrScheduler::Cosine {
          base_lr,
          epoch: 0,
          t_max: conf.n_epochs,
          eta_min: 0.,
        }
      }
    })
  }

  pub fn needs_metric(&self) -> bool {
    matches!(self, LrScheduler::Plateau(_))
  }

  /// Advances one epoch. `metric` is only read by the plateau policy, which fails
  /// without one.
  pub fn step(&mut self, lr: f64, metric: Option<f64>) -> Result<f64> {
    match self {
      LrScheduler::Linear {
        base_lr,
        epoch,
        epoch_count,
        n_epochs,
        n_epochs_decay,
      } => {
        *epoch += 1;
        let over = (*epoch + *epoch_count).saturating_sub(*n_epochs) as f64;
        let factor = 1. - over / (*n_epochs_decay as f64 + 1.);
        Ok(*base_lr * factor)
      }

      LrScheduler::Step {
        base_lr,
        epoch,
        step_size,
        gamma,
      } => {
        *epoch += 1;
        Ok(*base_lr * gamma.powi((*epoch / *step_size) as i32))
      }

      LrScheduler::Plateau(plateau) => {
        let metric = metric.ok_or(ModelError::MetricUnset)?;
        Ok(plateau.step(lr, metric))
      }

      LrScheduler::Cosine {
        base_lr,
        epoch,
        t_max,
        eta_min,
      } => {
        *epoch += 1;
        let progress = PI * *epoch as f64 / *t_max as f64;
        Ok(*eta_min + (*base_lr - *eta_min) * (1. + progress.cos()) / 2.)
      }
    }
  }
}
