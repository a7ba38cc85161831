mod cli;
mod setup;
mod translator;

use clap::Parser;
use i2i::{ema::Ema, utils::save_visual, BaseModel};

use crate::{
  cli::Cli,
  setup::{setup_args, setup_tracing},
  translator::{Pair, UnetTranslator},
};

fn main() -> i2i::Result<()> {
  let args = Cli::parse();

  setup_tracing(args.conf.verbose);

  if let Err(err) = setup_args(&args) {
    tracing::error!("{err}");
    std::process::exit(1);
  }

  let mut model = BaseModel::new(args.conf.clone(), |state| {
    UnetTranslator::build(state, &args)
  })?;

  if let (true, Some(decay)) = (args.conf.is_train, args.ema_decay) {
    let ema = Ema::new(model.state().network("G")?.parameters(), decay)?;
    model.state_mut().attach_ema(Box::new(ema));
  }

  model.setup()?;

  let device = model.state().device().clone();

  if args.conf.is_train {
    let first = args.conf.epoch_count;
    for epoch in first..first + args.epochs {
      for _ in 0..args.steps_per_epoch {
        model.set_input(Pair::synthetic(&device, args.batch_size, args.image_size)?)?;
        model.optimize_parameters()?;
      }

      let losses = model.get_current_losses()?;
      for (name, value) in &losses {
        tracing::info!("(epoch: {epoch}) {name}: {value:.4}");
      }
      if let Some((_, l1)) = losses.first() {
        model.state_mut().set_metric(*l1);
      }

      model.save_networks(&epoch.to_string())?;
      model.update_learning_rate()?;
    }

    model.save_networks("latest")?;
  }

  model.eval();
  model.set_input(Pair::synthetic(&device, args.batch_size, args.image_size)?)?;
  model.test()?;

  if let Some(dir) = &args.visuals_dir {
    std::fs::create_dir_all(dir).map_err(|e| i2i::ModelError::fs(dir, e))?;
    for (name, visual) in model.get_current_visuals()? {
      save_visual(&visual, dir.join(format!("{name}.png")))?;
    }
    tracing::info!("Visuals written to {}", dir.display());
  }

  Ok(())
}
