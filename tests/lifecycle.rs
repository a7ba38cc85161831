use std::{cell::Cell, collections::HashMap, path::PathBuf, rc::Rc};

use candle_core::{Device, Tensor};
use candle_nn::{Optimizer, SGD};
use i2i::{
  checkpoint::checkpoint_file_name, ema::EmaShadow, BaseModel, FeedForward, NormKind, UnetBlock,
  UnetBlockConfig,
  LoadIter, LrPolicy, ModelConfig, ModelError, ModelState, Result, TrainableModel,
};

/// Single feed-forward generator `G` with a mean-square "loss" on its output.
struct Probe {
  x: Option<Tensor>,
  grad_enabled_in_visuals: Option<bool>,
}

impl TrainableModel for Probe {
  type Input = Tensor;

  fn set_input(&mut self, state: &mut ModelState, input: Tensor) -> Result<()> {
    self.x = Some(input.to_device(state.device())?);
    Ok(())
  }

  fn forward(&mut self, state: &mut ModelState) -> Result<()> {
    let x = self
      .x
      .clone()
      .ok_or_else(|| ModelError::config("no input staged"))?;
    let y = state.network("G")?.forward(&x)?;
    let loss = y.sqr()?.mean_all()?;

    state.set_visual("out", &y);
    state.set_loss("G", &loss);
    Ok(())
  }

  fn optimize_parameters(&mut self, state: &mut ModelState) -> Result<()> {
    let x = self
      .x
      .clone()
      .ok_or_else(|| ModelError::config("no input staged"))?;
    let loss = state.network("G")?.forward(&x)?.sqr()?.mean_all()?;
    state.set_loss("G", &loss);
    state.backward_step(0, &loss)
  }

  fn compute_visuals(&mut self, state: &mut ModelState) -> Result<()> {
    self.grad_enabled_in_visuals = Some(state.is_grad_enabled());
    Ok(())
  }
}

struct TempDir(PathBuf);

impl TempDir {
  fn new(tag: &str) -> Self {
    let path = std::env::temp_dir().join(format!("i2i-lifecycle-{tag}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&path);
    Self(path)
  }
}

impl Drop for TempDir {
  fn drop(&mut self) {
    let _ = std::fs::remove_dir_all(&self.0);
  }
}

fn conf(dir: &TempDir) -> ModelConfig {
  ModelConfig {
    is_train: true,
    save_dir: dir.0.clone(),
    dataset: "synthetic".to_owned(),
    task: "AtoB".to_owned(),
    model: "probe".to_owned(),
    lr: 0.1,
    ..Default::default()
  }
}

fn probe(conf: ModelConfig) -> Result<BaseModel<Probe>> {
  BaseModel::new(conf, |state| {
    state.register_network("G", |vb| FeedForward::new(4, 8, 0., vb))?;
    state.set_loss_names(["G"]);
    state.set_visual_names(["out"]);

    let lr = state.conf().lr;
    let sgd = SGD::new(state.network("G")?.parameters(), lr)?;
    state.add_optimizer(Box::new(sgd));

    Ok(Probe {
      x: None,
      grad_enabled_in_visuals: None,
    })
  })
}

fn flat(state: &HashMap<String, Tensor>) -> Vec<(String, Vec<f32>)> {
  let mut v: Vec<_> = state
    .iter()
    .map(|(k, t)| (k.clone(), t.flatten_all().unwrap().to_vec1::<f32>().unwrap()))
    .collect();
  v.sort_by(|a, b| a.0.cmp(&b.0));
  v
}

fn zero_weights(model: &BaseModel<Probe>) -> Result<()> {
  for (_, var) in model.state().network("G")?.named_vars() {
    var.set(&var.zeros_like()?)?;
  }
  Ok(())
}

#[test]
fn save_dir_is_created_lazily() -> Result<()> {
  let dir = TempDir::new("lazy");
  let mut model = probe(conf(&dir))?;

  let expected = dir.0.join("syntheticAtoBprobe");
  assert_eq!(model.state().save_dir(), expected);
  assert!(!expected.exists());

  model.save_networks("1")?;
  assert!(expected.join(checkpoint_file_name("1", "G")).is_file());

  // idempotent
  model.save_networks("1")?;
  Ok(())
}

#[test]
fn save_then_load_is_bit_identical() -> Result<()> {
  let dir = TempDir::new("roundtrip");
  let mut model = probe(conf(&dir))?;
  let before = flat(&model.state().network("G")?.state_dict()?);

  model.save_networks("3")?;
  zero_weights(&model)?;
  assert_ne!(flat(&model.state().network("G")?.state_dict()?), before);

  model.load_networks("3")?;
  assert_eq!(flat(&model.state().network("G")?.state_dict()?), before);
  Ok(())
}

#[test]
fn prefixed_checkpoints_round_trip() -> Result<()> {
  let dir = TempDir::new("prefix");
  let mut wrapped = conf(&dir);
  wrapped.checkpoint_prefix = Some("module.".to_owned());

  let mut model = probe(wrapped.clone())?;
  let before = flat(&model.state().network("G")?.state_dict()?);
  model.save_networks("latest")?;

  let path = model.state().save_dir().join(checkpoint_file_name("latest", "G"));
  let on_disk = candle_core::safetensors::load(&path, &Device::Cpu)?;
  assert!(on_disk.keys().all(|k| k.starts_with("module.")));

  zero_weights(&model)?;
  model.load_networks("latest")?;
  assert_eq!(flat(&model.state().network("G")?.state_dict()?), before);

  // the same files read without the prefix rule do not line up with the network
  let mut plain = probe(conf(&dir))?;
  assert!(matches!(
    plain.load_networks("latest"),
    Err(ModelError::CheckpointMismatch { .. })
  ));

  // and unprefixed files are refused when a prefix is required
  plain.save_networks("2")?;
  assert!(matches!(
    model.load_networks("2"),
    Err(ModelError::MissingKeyPrefix { .. })
  ));
  Ok(())
}

#[test]
fn superset_checkpoint_is_rejected() -> Result<()> {
  let dir = TempDir::new("superset");
  let mut model = probe(conf(&dir))?;
  let save_dir = model.state().ensure_save_dir()?.to_owned();

  let mut state = model.state().network("G")?.state_dict()?;
  state.insert(
    "extra.weight".to_owned(),
    Tensor::zeros(3, candle_core::DType::F32, &Device::Cpu)?,
  );
  candle_core::safetensors::save(&state, save_dir.join(checkpoint_file_name("7", "G")))?;

  match model.load_networks("7") {
    Err(ModelError::CheckpointMismatch {
      network,
      missing,
      unexpected,
      ..
    }) => {
      assert_eq!(network, "G");
      assert!(missing.is_empty());
      assert_eq!(unexpected, vec!["extra.weight"]);
    }
    other => panic!("expected a key mismatch, got {other:?}"),
  }
  Ok(())
}

#[test]
fn missing_checkpoint_is_a_filesystem_error() -> Result<()> {
  let dir = TempDir::new("missing");
  let mut model = probe(conf(&dir))?;
  assert!(matches!(
    model.load_networks("42"),
    Err(ModelError::Filesystem { .. })
  ));
  Ok(())
}

struct CountingEma(Rc<Cell<usize>>);

impl EmaShadow for CountingEma {
  fn update(&mut self) -> Result<()> {
    Ok(())
  }

  fn apply_shadow(&mut self) -> Result<()> {
    self.0.set(self.0.get() + 1);
    Ok(())
  }
}

#[test]
fn latest_checkpoint_applies_ema_once() -> Result<()> {
  let dir = TempDir::new("ema");
  let mut model = probe(conf(&dir))?;

  // no EMA attached: nothing to apply
  model.save_networks("latest")?;

  let applied = Rc::new(Cell::new(0));
  model
    .state_mut()
    .attach_ema(Box::new(CountingEma(applied.clone())));

  model.save_networks("5")?;
  assert_eq!(applied.get(), 0);

  model.save_networks("latest")?;
  assert_eq!(applied.get(), 1);
  Ok(())
}

#[test]
fn latest_checkpoint_stores_ema_weights() -> Result<()> {
  let dir = TempDir::new("ema-weights");
  let mut model = probe(conf(&dir))?;

  let vars = model.state().network("G")?.parameters();
  let ema = i2i::ema::Ema::new(vars, 0.5)?;
  model.state_mut().attach_ema(Box::new(ema));
  let shadow = flat(&model.state().network("G")?.state_dict()?);

  zero_weights(&model)?;
  model.save_networks("latest")?;

  // the live network now holds the shadow weights
  assert_eq!(flat(&model.state().network("G")?.state_dict()?), shadow);
  Ok(())
}

#[test]
fn linear_policy_needs_no_metric() -> Result<()> {
  let dir = TempDir::new("linear");
  let mut model = probe(ModelConfig {
    n_epochs: 1,
    n_epochs_decay: 1,
    ..conf(&dir)
  })?;
  model.setup()?;
  assert_eq!(model.state().schedulers().len(), 1);

  let lr = model.update_learning_rate()?;
  assert!((lr - 0.05).abs() < 1e-12);
  assert!((model.state().optimizers()[0].learning_rate() - 0.05).abs() < 1e-12);
  Ok(())
}

#[test]
fn plateau_policy_uses_metric() -> Result<()> {
  let dir = TempDir::new("plateau");
  let mut model = probe(ModelConfig {
    lr_policy: LrPolicy::Plateau,
    ..conf(&dir)
  })?;
  model.setup()?;

  assert!(matches!(
    model.update_learning_rate(),
    Err(ModelError::MetricUnset)
  ));

  model.state_mut().set_metric(0.3);
  assert_eq!(model.update_learning_rate()?, 0.1);
  Ok(())
}

#[test]
fn update_learning_rate_needs_an_optimizer() -> Result<()> {
  let dir = TempDir::new("no-optim");
  let mut state = ModelState::new(conf(&dir))?;
  state.register_network("G", |vb| FeedForward::new(2, 2, 0., vb))?;

  assert!(matches!(
    state.update_learning_rate(),
    Err(ModelError::Configuration(_))
  ));
  Ok(())
}

#[test]
fn update_learning_rate_before_setup_is_rejected() -> Result<()> {
  let dir = TempDir::new("no-setup");
  let mut model = probe(conf(&dir))?;

  assert!(matches!(
    model.update_learning_rate(),
    Err(ModelError::Configuration(msg)) if msg.contains("setup")
  ));

  // an optimizer added after setup has no scheduler either
  model.setup()?;
  let extra = SGD::new(model.state().network("G")?.parameters(), 0.1)?;
  model.state_mut().add_optimizer(Box::new(extra));
  assert!(matches!(
    model.update_learning_rate(),
    Err(ModelError::Configuration(_))
  ));
  assert_eq!(model.state().optimizers()[0].learning_rate(), 0.1);
  Ok(())
}

#[test]
fn bad_shape_leaves_network_untouched() -> Result<()> {
  let dir = TempDir::new("bad-shape");
  let mut model = probe(conf(&dir))?;
  let save_dir = model.state().ensure_save_dir()?.to_owned();
  let before = flat(&model.state().network("G")?.state_dict()?);

  // fc2.weight sorts last, every other tensor would load fine
  let mut state = HashMap::new();
  for (key, tensor) in model.state().network("G")?.state_dict()? {
    let tensor = if key == "fc2.weight" {
      Tensor::zeros((3, 3), candle_core::DType::F32, &Device::Cpu)?
    } else {
      tensor.zeros_like()?
    };
    state.insert(key, tensor);
  }
  candle_core::safetensors::save(&state, save_dir.join(checkpoint_file_name("8", "G")))?;

  assert!(matches!(
    model.load_networks("8"),
    Err(ModelError::CheckpointShape { key, .. }) if key == "fc2.weight"
  ));
  assert_eq!(flat(&model.state().network("G")?.state_dict()?), before);
  Ok(())
}

#[test]
fn legacy_instance_norm_buffers_are_dropped_on_load() -> Result<()> {
  let dir = TempDir::new("legacy");
  let build = |conf: ModelConfig| -> Result<ModelState> {
    let mut state = ModelState::new(conf)?;
    state.register_network("G", |vb| {
      let config = UnetBlockConfig {
        out_channel: 4,
        hidden_channel: 4,
        norm: NormKind::Instance,
        ..Default::default()
      };
      UnetBlock::innermost(config, vb)
    })?;
    Ok(state)
  };

  let state = build(conf(&dir))?;
  let weights = flat(&state.network("G")?.state_dict()?);

  let mut old = state.network("G")?.state_dict()?;
  for key in ["up_norm.running_mean", "up_norm.running_var"] {
    old.insert(key.to_owned(), Tensor::ones(4, candle_core::DType::F32, &Device::Cpu)?);
  }
  old.insert(
    "up_norm.num_batches_tracked".to_owned(),
    Tensor::zeros(1, candle_core::DType::F32, &Device::Cpu)?,
  );
  let save_dir = state.ensure_save_dir()?.to_owned();
  candle_core::safetensors::save(&old, save_dir.join(checkpoint_file_name("9", "G")))?;

  // without the patch the stale buffers are unexpected keys
  let mut strict = build(conf(&dir))?;
  match strict.load_networks("9") {
    Err(ModelError::CheckpointMismatch { unexpected, .. }) => assert_eq!(unexpected.len(), 3),
    other => panic!("expected a key mismatch, got {other:?}"),
  }

  let mut legacy = build(ModelConfig {
    legacy_instance_norm: true,
    ..conf(&dir)
  })?;
  legacy.load_networks("9")?;
  assert_eq!(flat(&legacy.network("G")?.state_dict()?), weights);
  Ok(())
}

#[test]
fn losses_are_reported_by_name() -> Result<()> {
  let dir = TempDir::new("losses");
  let mut model = probe(conf(&dir))?;

  assert!(matches!(
    model.get_current_losses(),
    Err(ModelError::Configuration(_))
  ));

  model.set_input(Tensor::ones((2, 4), candle_core::DType::F32, &Device::Cpu)?)?;
  model.forward()?;

  let losses = model.get_current_losses()?;
  assert_eq!(losses.len(), 1);
  assert_eq!(losses[0].0, "G");
  assert!(losses[0].1.is_finite() && losses[0].1 >= 0.);

  let visuals = model.get_current_visuals()?;
  assert_eq!(visuals[0].0, "out");
  assert_eq!(visuals[0].1.dims(), &[2, 4]);

  // a declared loss without a value is a configuration error
  model.state_mut().set_loss_names(["G", "D"]);
  assert!(matches!(
    model.get_current_losses(),
    Err(ModelError::Configuration(msg)) if msg.contains("[D]")
  ));
  Ok(())
}

#[test]
fn test_runs_without_gradients() -> Result<()> {
  let dir = TempDir::new("no-grad");
  let mut model = probe(conf(&dir))?;

  model.set_input(Tensor::ones((1, 4), candle_core::DType::F32, &Device::Cpu)?)?;
  model.test()?;

  assert_eq!(model.model().grad_enabled_in_visuals, Some(false));
  assert!(model.state().is_grad_enabled());

  {
    let _guard = model.state().no_grad();
    let loss = Tensor::zeros((), candle_core::DType::F32, &Device::Cpu)?;
    assert!(model.state_mut().backward_step(0, &loss).is_err());
  }
  assert!(model.state().is_grad_enabled());
  Ok(())
}

#[test]
fn frozen_networks_are_not_updated() -> Result<()> {
  let dir = TempDir::new("freeze");
  let mut state = ModelState::new(conf(&dir))?;
  state.register_network("A", |vb| FeedForward::new(3, 5, 0., vb))?;
  state.register_network("B", |vb| FeedForward::new(3, 5, 0., vb))?;

  let mut vars = state.network("A")?.parameters();
  vars.extend(state.network("B")?.parameters());
  state.add_optimizer(Box::new(SGD::new(vars, 0.5)?));

  state.set_requires_grad(["B"], false)?;
  assert!(!state.network("B")?.requires_grad());
  assert!(state.set_requires_grad(["C"], false).is_err());

  let a_before = flat(&state.network("A")?.state_dict()?);
  let b_before = flat(&state.network("B")?.state_dict()?);

  let x = Tensor::ones((2, 3), candle_core::DType::F32, &Device::Cpu)?;
  let a = state.network("A")?.forward(&x)?.sum_all()?;
  let b = state.network("B")?.forward(&x)?.sum_all()?;
  state.backward_step(0, &(a + b)?)?;

  assert_ne!(flat(&state.network("A")?.state_dict()?), a_before);
  assert_eq!(flat(&state.network("B")?.state_dict()?), b_before);
  Ok(())
}

#[test]
fn setup_loads_requested_checkpoint_for_inference() -> Result<()> {
  let dir = TempDir::new("setup");
  let mut trained = probe(conf(&dir))?;
  trained.save_networks("4")?;
  let weights = flat(&trained.state().network("G")?.state_dict()?);

  let inference = ModelConfig {
    is_train: false,
    epoch: "4".to_owned(),
    ..conf(&dir)
  };

  let mut model = probe(inference.clone())?;
  model.setup()?;
  assert!(model.state().schedulers().is_empty());
  assert_eq!(flat(&model.state().network("G")?.state_dict()?), weights);

  // a positive iteration takes priority over the epoch
  let mut model = probe(ModelConfig {
    load_iter: LoadIter::Iter(2),
    ..inference
  })?;
  assert!(matches!(
    model.setup(),
    Err(ModelError::Filesystem { path, .. }) if path.ends_with("iter_2_net_G.safetensors")
  ));
  Ok(())
}

#[test]
fn eval_and_train_switch_every_network() -> Result<()> {
  let dir = TempDir::new("eval");
  let mut model = probe(conf(&dir))?;
  assert!(model.state().network("G")?.is_training());

  model.eval();
  assert!(model.state().networks().iter().all(|e| !e.is_training()));

  model.train();
  assert!(model.state().network("G")?.is_training());
  Ok(())
}

#[test]
fn optimize_parameters_reduces_loss() -> Result<()> {
  let dir = TempDir::new("optimize");
  let mut model = probe(conf(&dir))?;
  model.set_input(Tensor::ones((4, 4), candle_core::DType::F32, &Device::Cpu)?)?;

  model.forward()?;
  let first = model.get_current_losses()?[0].1;

  for _ in 0..20 {
    model.optimize_parameters()?;
  }
  model.forward()?;
  let last = model.get_current_losses()?[0].1;

  assert!(last < first, "{last} >= {first}");
  Ok(())
}
