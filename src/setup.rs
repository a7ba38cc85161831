use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::cli::Cli;

pub fn setup_tracing(verbose: bool) {
  let subscriber = FmtSubscriber::builder()
    .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
    .with_target(false)
    .finish();

  tracing::subscriber::set_global_default(subscriber).expect("Setting default subscriber failed");
}

pub fn setup_args(args: &Cli) -> Result<(), String> {
  if args.num_downs < 5 {
    return Err(format!(
      "The generator needs at least 5 downsamplings, got {}",
      args.num_downs
    ));
  }

  let factor = 1usize << args.num_downs;
  if args.image_size == 0 || args.image_size % factor != 0 {
    return Err(format!(
      "Image size must be a positive multiple of {factor} for {} downsamplings",
      args.num_downs
    ));
  }

  if args.batch_size == 0 {
    return Err("Batch size must be positive".to_owned());
  }

  if !args.conf.is_train && args.ema_decay.is_some() {
    tracing::warn!("EMA only works in training mode! Ignoring `--ema-decay`...");
  }

  if args.conf.gpu_ids.len() > 1 {
    tracing::warn!("Only the first GPU is used, others are ignored");
  }

  Ok(())
}
