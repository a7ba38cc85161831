use std::{fmt, path::PathBuf, str::FromStr};

use candle_core::Device;
use clap::{Args, ValueEnum};

use crate::checkpoint::KeyRemap;

/// Learning-rate policy applied to every optimizer once `setup` runs in training mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LrPolicy {
  Linear,
  Step,
  Plateau,
  Cosine,
}

impl fmt::Display for LrPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      LrPolicy::Linear => "linear",
      LrPolicy::Step => "step",
      LrPolicy::Plateau => "plateau",
      LrPolicy::Cosine => "cosine",
    };
    f.write_str(name)
  }
}

/// Which checkpoint `setup` loads: `latest`, or an iteration count where `0` falls back to `epoch`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadIter {
  Latest,
  Iter(usize),
}

impl FromStr for LoadIter {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if s == "latest" {
      return Ok(LoadIter::Latest);
    }

    s.parse()
      .map(LoadIter::Iter)
      .map_err(|_| format!("load iteration must be `latest` or a number, got `{s}`"))
  }
}

#[derive(Args, Clone, Debug)]
pub struct ModelConfig {
  #[arg(long, help = "Run in training mode")]
  pub is_train: bool,

  #[arg(long, help = "GPU ids, e.g. 0,1 (empty for CPU)", value_delimiter = ',')]
  #[arg(value_name = "IDS")]
  pub gpu_ids: Vec<usize>,

  #[arg(long, help = "Root directory for checkpoints")]
  #[arg(value_name = "DIR", default_value = "./checkpoints")]
  pub save_dir: PathBuf,

  #[arg(long, help = "Dataset name, part of the checkpoint directory")]
  #[arg(default_value = "")]
  pub dataset: String,

  #[arg(long, help = "Task name, part of the checkpoint directory")]
  #[arg(default_value = "")]
  pub task: String,

  #[arg(long, help = "Model name, part of the checkpoint directory")]
  #[arg(default_value = "unet")]
  pub model: String,

  #[arg(long, help = "Load the latest checkpoint and continue training")]
  pub continue_train: bool,

  #[arg(long, help = "Checkpoint iteration to load (`latest` or a number, 0 uses --epoch)")]
  #[arg(value_name = "ITER", default_value = "0")]
  pub load_iter: LoadIter,

  #[arg(long, help = "Checkpoint epoch to load when --load-iter is 0")]
  #[arg(default_value = "latest")]
  pub epoch: String,

  #[arg(long, value_enum, help = "Learning rate policy")]
  #[arg(default_value_t = LrPolicy::Linear)]
  pub lr_policy: LrPolicy,

  #[arg(long, help = "Initial learning rate")]
  #[arg(default_value_t = 0.0002)]
  pub lr: f64,

  #[arg(long, help = "Epochs with the initial learning rate")]
  #[arg(default_value_t = 100)]
  pub n_epochs: usize,

  #[arg(long, help = "Epochs to linearly decay the learning rate to zero")]
  #[arg(default_value_t = 100)]
  pub n_epochs_decay: usize,

  #[arg(long, help = "Starting epoch count")]
  #[arg(default_value_t = 1)]
  pub epoch_count: usize,

  #[arg(long, help = "Multiply the learning rate by 0.1 every N epochs (step policy)")]
  #[arg(default_value_t = 50)]
  pub lr_decay_iters: usize,

  #[arg(short, long, help = "Print network architectures")]
  pub verbose: bool,

  #[arg(long, help = "Key prefix written to and required from checkpoints, e.g. `module.`")]
  #[arg(value_name = "PREFIX")]
  pub checkpoint_prefix: Option<String>,

  #[arg(long, help = "Drop stale instance-norm buffers when loading old checkpoints")]
  pub legacy_instance_norm: bool,
}

impl Default for ModelConfig {
  fn default() -> Self {
    Self {
      is_train: false,
      gpu_ids: Vec::new(),
      save_dir: PathBuf::from("./checkpoints"),
      dataset: String::new(),
      task: String::new(),
      model: "unet".to_owned(),
      continue_train: false,
      load_iter: LoadIter::Iter(0),
      epoch: "latest".to_owned(),
      lr_policy: LrPolicy::Linear,
      lr: 0.0002,
      n_epochs: 100,
      n_epochs_decay: 100,
      epoch_count: 1,
      lr_decay_iters: 50,
      verbose: false,
      checkpoint_prefix: None,
      legacy_instance_norm: false,
    }
  }
}

impl ModelConfig {
  pub fn device(&self) -> candle_core::Result<Device> {
    match self.gpu_ids.first() {
      Some(&id) => Device::new_cuda(id),
      None => Ok(Device::Cpu),
    }
  }

  /// `<save_dir>/<dataset><task><model>`
  pub fn checkpoint_dir(&self) -> PathBuf {
    self
      .save_dir
      .join(format!("{}{}{}", self.dataset, self.task, self.model))
  }

  /// `latest` wins over a positive iteration, which wins over the raw epoch.
  pub fn load_suffix(&self) -> String {
    match self.load_iter {
      LoadIter::Latest => "latest".to_owned(),
      LoadIter::Iter(n) if n > 0 => format!("iter_{n}"),
      LoadIter::Iter(_) => self.epoch.clone(),
    }
  }

  pub fn key_remap(&self) -> KeyRemap {
    match &self.checkpoint_prefix {
      Some(prefix) if !prefix.is_empty() => KeyRemap::Prefixed(prefix.clone()),
      _ => KeyRemap::Verbatim,
    }
  }
}
