use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = ModelError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ModelError {
  #[error("configuration error: {0}")]
  Configuration(String),

  #[error(
    "checkpoint {} does not match network [{network}]: missing keys {missing:?}, unexpected keys {unexpected:?}",
    path.display()
  )]
  CheckpointMismatch {
    network: String,
    path: PathBuf,
    missing: Vec<String>,
    unexpected: Vec<String>,
  },

  #[error(
    "checkpoint {} holds `{key}` of shape {found:?} for network [{network}], expected {expected:?}",
    path.display()
  )]
  CheckpointShape {
    network: String,
    path: PathBuf,
    key: String,
    expected: Vec<usize>,
    found: Vec<usize>,
  },

  #[error("checkpoint key `{key}` does not start with the expected prefix `{prefix}`")]
  MissingKeyPrefix { key: String, prefix: String },

  #[error("filesystem error at {}: {source}", path.display())]
  Filesystem {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to write checkpoint {}: {source}", path.display())]
  CheckpointWrite {
    path: PathBuf,
    #[source]
    source: candle_core::Error,
  },

  #[error("learning rate policy `plateau` needs a metric, but none has been set")]
  MetricUnset,

  #[error(transparent)]
  Candle(#[from] candle_core::Error),

  #[error(transparent)]
  Image(#[from] image::ImageError),
}

impl ModelError {
  pub fn config(msg: impl Into<String>) -> Self {
    Self::Configuration(msg.into())
  }

  pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
    Self::Filesystem {
      path: path.into(),
      source,
    }
  }
}
