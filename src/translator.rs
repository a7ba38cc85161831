use std::path::PathBuf;

use candle_core::{Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use i2i::{unet_generator, ModelError, ModelState, Result, TrainableModel};

use crate::cli::Cli;

pub struct Pair {
  pub real_a: Tensor,
  pub real_b: Tensor,
  pub paths: Vec<PathBuf>,
}

impl Pair {
  /// Random images in `[-1, 1]` paired with their color inversion.
  pub fn synthetic(device: &Device, batch: usize, size: usize) -> Result<Self> {
    let real_a = Tensor::rand(-1f32, 1., (batch, 3, size, size), device)?;
    let real_b = real_a.neg()?;

    Ok(Self {
      real_a,
      real_b,
      paths: Vec::new(),
    })
  }
}

/// U-Net generator `G` trained with an L1 objective from domain A to domain B.
pub struct UnetTranslator {
  real_a: Option<Tensor>,
  real_b: Option<Tensor>,
  fake_b: Option<Tensor>,
}

impl UnetTranslator {
  pub fn build(state: &mut ModelState, args: &Cli) -> Result<Self> {
    state.register_network("G", |vb| {
      unet_generator(
        3,
        3,
        args.num_downs,
        args.ngf,
        args.norm,
        args.use_dropout,
        vb,
      )
    })?;

    state.set_loss_names(["G_L1"]);
    state.set_visual_names(["real_A", "fake_B", "real_B"]);

    if state.is_train() {
      let params = ParamsAdamW {
        lr: state.conf().lr,
        beta1: 0.5,
        beta2: 0.999,
        ..Default::default()
      };
      let optimizer = AdamW::new(state.network("G")?.parameters(), params)?;
      state.add_optimizer(Box::new(optimizer));
    }

    Ok(Self {
      real_a: None,
      real_b: None,
      fake_b: None,
    })
  }

  fn staged(t: &Option<Tensor>, name: &str) -> Result<Tensor> {
    t.clone()
      .ok_or_else(|| ModelError::config(format!("`{name}` is not staged, call set_input first")))
  }
}

impl TrainableModel for UnetTranslator {
  type Input = Pair;

  fn set_input(&mut self, state: &mut ModelState, input: Pair) -> Result<()> {
    self.real_a = Some(input.real_a.to_device(state.device())?);
    self.real_b = Some(input.real_b.to_device(state.device())?);
    state.set_image_paths(input.paths);
    Ok(())
  }

  fn forward(&mut self, state: &mut ModelState) -> Result<()> {
    let real_a = Self::staged(&self.real_a, "real_A")?;
    let real_b = Self::staged(&self.real_b, "real_B")?;
    let fake_b = state.network("G")?.forward(&real_a)?;

    state.set_visual("real_A", &real_a);
    state.set_visual("fake_B", &fake_b);
    state.set_visual("real_B", &real_b);

    self.fake_b = Some(fake_b);
    Ok(())
  }

  fn optimize_parameters(&mut self, state: &mut ModelState) -> Result<()> {
    self.forward(state)?;

    let fake_b = Self::staged(&self.fake_b, "fake_B")?;
    let real_b = Self::staged(&self.real_b, "real_B")?;
    let loss = (fake_b - real_b)?.abs()?.mean_all()?;
    state.set_loss("G_L1", &loss);

    state.backward_step(0, &loss)?;
    state.update_ema()
  }
}
