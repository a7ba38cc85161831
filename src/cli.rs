use std::path::PathBuf;

use clap::Parser;
use i2i::{ModelConfig, NormKind};

#[derive(Parser)]
#[command(version)]
#[command(about = "Train a U-Net image-to-image translator on synthetic pairs", long_about = None)]
pub struct Cli {
  #[command(flatten)]
  pub conf: ModelConfig,

  #[arg(long, help = "Number of epochs to train")]
  #[arg(value_name = "EPOCHS", default_value = "2")]
  pub epochs: usize,

  #[arg(long, help = "Optimization steps per epoch")]
  #[arg(value_name = "STEPS", default_value = "4")]
  pub steps_per_epoch: usize,

  #[arg(short, long, help = "Images per batch")]
  #[arg(value_name = "BATCH", default_value = "4")]
  pub batch_size: usize,

  #[arg(short, long, help = "Height and width of the synthetic images")]
  #[arg(value_name = "SIZE", default_value = "64")]
  pub image_size: usize,

  #[arg(long, help = "Filters in the outermost generator block")]
  #[arg(value_name = "NGF", default_value = "8")]
  pub ngf: usize,

  #[arg(long, help = "Number of downsamplings in the generator")]
  #[arg(value_name = "DOWNS", default_value = "6")]
  pub num_downs: usize,

  #[arg(long, value_enum, help = "Normalization layer")]
  #[arg(default_value_t = NormKind::Batch)]
  pub norm: NormKind,

  #[arg(long, help = "Use dropout in the generator")]
  pub use_dropout: bool,

  #[arg(long, help = "Keep an exponential moving average of the generator weights")]
  #[arg(value_name = "DECAY")]
  pub ema_decay: Option<f64>,

  #[arg(long, help = "Write the final visuals as PNG files into this directory")]
  #[arg(value_name = "DIR")]
  pub visuals_dir: Option<PathBuf>,
}
