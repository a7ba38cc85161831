use std::{
  cell::Cell,
  collections::HashMap,
  path::{Path, PathBuf},
  rc::Rc,
};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use super::{Network, NetworkEntry, NetworkRegistry};
use crate::{
  checkpoint::{checkpoint_path, load_network, save_network, LoadOptions},
  config::{LrPolicy, ModelConfig},
  ema::EmaShadow,
  error::{ModelError, Result},
  optim::DynOptimizer,
  scheduler::LrScheduler,
};

/// Behaviour a concrete model (a GAN generator, a classifier, ...) plugs into [`BaseModel`].
///
/// Implementations keep their staged inputs and intermediate tensors themselves and talk
/// to their networks, optimizers, losses and visuals through the [`ModelState`].
pub trait TrainableModel {
  type Input;

  /// Stages `input` on [`ModelState::device`].
  fn set_input(&mut self, state: &mut ModelState, input: Self::Input) -> Result<()>;

  /// Runs the networks and records every declared visual through [`ModelState::set_visual`].
  fn forward(&mut self, state: &mut ModelState) -> Result<()>;

  /// One full step: forward, losses, backward and optimizer updates.
  fn optimize_parameters(&mut self, state: &mut ModelState) -> Result<()>;

  fn compute_visuals(&mut self, state: &mut ModelState) -> Result<()> {
    let _ = state;
    Ok(())
  }
}

/// Disables gradient tracking on a [`ModelState`] until dropped.
#[must_use = "gradient tracking is restored as soon as the guard is dropped"]
pub struct NoGradGuard {
  flag: Rc<Cell<bool>>,
  prev: bool,
}

impl Drop for NoGradGuard {
  fn drop(&mut self) {
    self.flag.set(self.prev);
  }
}

/// Registries and lifecycle state shared by every model: networks, declared losses and
/// visuals, optimizers with their schedulers, the plateau metric and an optional EMA.
pub struct ModelState {
  conf: ModelConfig,
  device: Device,
  save_dir: PathBuf,
  networks: NetworkRegistry,
  loss_names: Vec<String>,
  visual_names: Vec<String>,
  losses: HashMap<String, Tensor>,
  visuals: HashMap<String, Tensor>,
  image_paths: Vec<PathBuf>,
  optimizers: Vec<Box<dyn DynOptimizer>>,
  schedulers: Vec<LrScheduler>,
  metric: Option<f64>,
  ema: Option<Box<dyn EmaShadow>>,
  grad_enabled: Rc<Cell<bool>>,
}

impl ModelState {
  pub fn new(conf: ModelConfig) -> Result<Self> {
    let device = conf.device()?;
    let save_dir = conf.checkpoint_dir();

    Ok(Self {
      conf,
      device,
      save_dir,
      networks: NetworkRegistry::default(),
      loss_names: Vec::new(),
      visual_names: Vec::new(),
      losses: HashMap::new(),
      visuals: HashMap::new(),
      image_paths: Vec::new(),
      optimizers: Vec::new(),
      schedulers: Vec::new(),
      metric: None,
      ema: None,
      grad_enabled: Rc::new(Cell::new(true)),
    })
  }

  pub fn conf(&self) -> &ModelConfig {
    &self.conf
  }

  pub fn device(&self) -> &Device {
    &self.device
  }

  pub fn is_train(&self) -> bool {
    self.conf.is_train
  }

  pub fn save_dir(&self) -> &Path {
    &self.save_dir
  }

  /// Creates the checkpoint directory if needed. Safe to call any number of times.
  pub fn ensure_save_dir(&self) -> Result<&Path> {
    std::fs::create_dir_all(&self.save_dir).map_err(|e| ModelError::fs(&self.save_dir, e))?;
    Ok(&self.save_dir)
  }

  // ---- registries ----

  pub fn register_network<N, F>(&mut self, name: &str, build: F) -> Result<()>
  where
    N: Network + 'static,
    F: FnOnce(VarBuilder) -> Result<N, candle_core::Error>,
  {
    self.networks.register(name, &self.device, build)
  }

  pub fn network(&self, name: &str) -> Result<&NetworkEntry> {
    self.networks.get(name)
  }

  pub fn networks(&self) -> &NetworkRegistry {
    &self.networks
  }

  pub fn model_names(&self) -> Vec<&str> {
    self.networks.names().collect()
  }

  pub fn set_loss_names<I, S>(&mut self, names: I)
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.loss_names = names.into_iter().map(Into::into).collect();
  }

  pub fn loss_names(&self) -> &[String] {
    &self.loss_names
  }

  pub fn set_visual_names<I, S>(&mut self, names: I)
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.visual_names = names.into_iter().map(Into::into).collect();
  }

  pub fn visual_names(&self) -> &[String] {
    &self.visual_names
  }

  /// Records the current value of loss `name`. Detached while gradients are disabled.
  pub fn set_loss(&mut self, name: &str, loss: &Tensor) {
    let loss = self.track(loss);
    self.losses.insert(name.to_owned(), loss);
  }

  /// Records the current value of visual `name`. Detached while gradients are disabled.
  pub fn set_visual(&mut self, name: &str, visual: &Tensor) {
    let visual = self.track(visual);
    self.visuals.insert(name.to_owned(), visual);
  }

  pub fn set_image_paths(&mut self, paths: Vec<PathBuf>) {
    self.image_paths = paths;
  }

  pub fn get_image_paths(&self) -> &[PathBuf] {
    &self.image_paths
  }

  pub fn add_optimizer(&mut self, optimizer: Box<dyn DynOptimizer>) {
    self.optimizers.push(optimizer);
  }

  pub fn optimizers(&self) -> &[Box<dyn DynOptimizer>] {
    &self.optimizers
  }

  pub fn schedulers(&self) -> &[LrScheduler] {
    &self.schedulers
  }

  /// Metric handed to the `plateau` learning-rate policy.
  pub fn set_metric(&mut self, metric: f64) {
    self.metric = Some(metric);
  }

  pub fn metric(&self) -> Option<f64> {
    self.metric
  }

  pub fn attach_ema(&mut self, ema: Box<dyn EmaShadow>) {
    self.ema = Some(ema);
  }

  pub fn has_ema(&self) -> bool {
    self.ema.is_some()
  }

  /// Folds the live weights into the attached EMA, if any.
  pub fn update_ema(&mut self) -> Result<()> {
    match self.ema.as_mut() {
      Some(ema) => ema.update(),
      None => Ok(()),
    }
  }

  // ---- gradients ----

  pub fn is_grad_enabled(&self) -> bool {
    self.grad_enabled.get()
  }

  pub fn no_grad(&self) -> NoGradGuard {
    NoGradGuard {
      flag: self.grad_enabled.clone(),
      prev: self.grad_enabled.replace(false),
    }
  }

  fn track(&self, t: &Tensor) -> Tensor {
    if self.is_grad_enabled() {
      t.clone()
    } else {
      t.detach()
    }
  }

  /// Marks every parameter of the named networks as trainable or frozen.
  pub fn set_requires_grad<I, S>(&mut self, names: I, requires_grad: bool) -> Result<()>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    for name in names {
      self
        .networks
        .get_mut(name.as_ref())?
        .set_requires_grad(requires_grad);
    }
    Ok(())
  }

  /// Backpropagates `loss` and steps optimizer `index`. Gradients of frozen networks are
  /// discarded first, so their parameters stay untouched.
  pub fn backward_step(&mut self, index: usize, loss: &Tensor) -> Result<()> {
    if !self.is_grad_enabled() {
      return Err(ModelError::config(
        "backward_step called while gradient tracking is disabled",
      ));
    }

    let mut grads = loss.backward()?;

    for entry in self.networks.iter().filter(|e| !e.requires_grad()) {
      for (_, var) in entry.named_vars() {
        grads.remove(var.as_tensor());
      }
    }

    let count = self.optimizers.len();
    let optimizer = self.optimizers.get_mut(index).ok_or_else(|| {
      ModelError::config(format!(
        "optimizer #{index} does not exist, {count} registered"
      ))
    })?;
    optimizer.step(&grads)?;

    Ok(())
  }

  // ---- lifecycle ----

  /// Builds one scheduler per optimizer in training mode, loads checkpoints when testing
  /// or continuing, then prints the network summary.
  pub fn setup(&mut self) -> Result<()> {
    if self.conf.is_train {
      self.schedulers = self
        .optimizers
        .iter()
        .map(|o| LrScheduler::new(&self.conf, o.learning_rate()))
        .collect::<Result<_>>()?;
    }

    if !self.conf.is_train || self.conf.continue_train {
      let suffix = self.conf.load_suffix();
      self.load_networks(&suffix)?;
    }

    self.print_networks(self.conf.verbose);
    Ok(())
  }

  pub fn eval(&mut self) {
    for entry in self.networks.iter_mut() {
      entry.set_training(false);
    }
  }

  pub fn train(&mut self) {
    for entry in self.networks.iter_mut() {
      entry.set_training(true);
    }
  }

  /// Steps every scheduler once and returns the first optimizer's new learning rate.
  pub fn update_learning_rate(&mut self) -> Result<f64> {
    let old_lr = self
      .optimizers
      .first()
      .ok_or_else(|| ModelError::config("no optimizer registered"))?
      .learning_rate();

    if self.schedulers.len() != self.optimizers.len() {
      return Err(ModelError::config(format!(
        "{} schedulers for {} optimizers, call setup after registering every optimizer",
        self.schedulers.len(),
        self.optimizers.len()
      )));
    }

    let metric = match self.conf.lr_policy {
      LrPolicy::Plateau => Some(self.metric.ok_or(ModelError::MetricUnset)?),
      _ => None,
    };

    for (scheduler, optimizer) in self.schedulers.iter_mut().zip(self.optimizers.iter_mut()) {
      let lr = scheduler.step(optimizer.learning_rate(), metric)?;
      optimizer.set_learning_rate(lr);
    }

    let lr = self.optimizers[0].learning_rate();
    tracing::info!("learning rate {old_lr:.7} -> {lr:.7}");

    Ok(lr)
  }

  pub fn get_current_visuals(&self) -> Result<Vec<(String, Tensor)>> {
    self
      .visual_names
      .iter()
      .map(|name| {
        let visual = self
          .visuals
          .get(name)
          .ok_or_else(|| ModelError::config(format!("visual [{name}] has never been set")))?;
        Ok((name.clone(), visual.clone()))
      })
      .collect()
  }

  pub fn get_current_losses(&self) -> Result<Vec<(String, f64)>> {
    self
      .loss_names
      .iter()
      .map(|name| {
        let loss = self
          .losses
          .get(name)
          .ok_or_else(|| ModelError::config(format!("loss [{name}] has never been set")))?;
        let value = loss.to_dtype(DType::F64)?.reshape(())?.to_scalar::<f64>()?;
        Ok((name.clone(), value))
      })
      .collect()
  }

  /// Writes `<epoch>_net_<name>.safetensors` for every network.
  ///
  /// Saving `latest` with an EMA attached swaps the EMA weights into the live networks
  /// first, and leaves them there.
  pub fn save_networks(&mut self, epoch: &str) -> Result<()> {
    let dir = self.ensure_save_dir()?.to_owned();

    if epoch == "latest" {
      if let Some(ema) = self.ema.as_mut() {
        ema.apply_shadow()?;
        tracing::info!("The latest using EMA.");
      }
    }

    let remap = self.conf.key_remap();
    for entry in self.networks.iter() {
      let path = checkpoint_path(&dir, epoch, entry.name());
      save_network(entry, &path, &remap)?;
      tracing::debug!("saved the model to {}", path.display());
    }

    Ok(())
  }

  pub fn load_networks(&mut self, epoch: &str) -> Result<()> {
    let remap = self.conf.key_remap();
    let options = LoadOptions {
      remap: &remap,
      legacy_instance_norm: self.conf.legacy_instance_norm,
      device: &self.device,
    };

    for entry in self.networks.iter() {
      let path = checkpoint_path(&self.save_dir, epoch, entry.name());
      tracing::info!("loading the model from {}", path.display());
      load_network(entry, &path, &options)?;
    }

    Ok(())
  }

  pub fn print_networks(&self, verbose: bool) {
    tracing::info!("---------- Networks initialized -------------");
    for entry in self.networks.iter() {
      if verbose {
        tracing::info!("\n{}", entry.architecture());
      }
      tracing::info!(
        "[Network {}] Total number of parameters : {:.3} M",
        entry.name(),
        entry.num_parameters() as f64 / 1e6
      );
    }
    tracing::info!("-----------------------------------------------");
  }
}

/// Lifecycle driver: owns the shared [`ModelState`] and the concrete [`TrainableModel`].
pub struct BaseModel<M> {
  state: ModelState,
  model: M,
}

impl<M: TrainableModel> BaseModel<M> {
  /// `build` registers networks, loss and visual names and optimizers on the state and
  /// returns the concrete model.
  pub fn new<F>(conf: ModelConfig, build: F) -> Result<Self>
  where
    F: FnOnce(&mut ModelState) -> Result<M>,
  {
    let mut state = ModelState::new(conf)?;
    let model = build(&mut state)?;
    Ok(Self { state, model })
  }

  pub fn state(&self) -> &ModelState {
    &self.state
  }

  pub fn state_mut(&mut self) -> &mut ModelState {
    &mut self.state
  }

  pub fn model(&self) -> &M {
    &self.model
  }

  pub fn model_mut(&mut self) -> &mut M {
    &mut self.model
  }

  pub fn set_input(&mut self, input: M::Input) -> Result<()> {
    self.model.set_input(&mut self.state, input)
  }

  pub fn forward(&mut self) -> Result<()> {
    self.model.forward(&mut self.state)
  }

  pub fn optimize_parameters(&mut self) -> Result<()> {
    self.model.optimize_parameters(&mut self.state)
  }

  pub fn compute_visuals(&mut self) -> Result<()> {
    self.model.compute_visuals(&mut self.state)
  }

  /// `forward` and `compute_visuals` with gradient tracking disabled.
  pub fn test(&mut self) -> Result<()> {
    let _guard = self.state.no_grad();
    self.model.forward(&mut self.state)?;
    self.model.compute_visuals(&mut self.state)
  }

  pub fn setup(&mut self) -> Result<()> {
    self.state.setup()
  }

  pub fn eval(&mut self) {
    self.state.eval()
  }

  pub fn train(&mut self) {
    self.state.train()
  }

  pub fn update_learning_rate(&mut self) -> Result<f64> {
    self.state.update_learning_rate()
  }

  pub fn get_current_visuals(&self) -> Result<Vec<(String, Tensor)>> {
    self.state.get_current_visuals()
  }

  pub fn get_current_losses(&self) -> Result<Vec<(String, f64)>> {
    self.state.get_current_losses()
  }

  pub fn save_networks(&mut self, epoch: &str) -> Result<()> {
    self.state.save_networks(epoch)
  }

  pub fn load_networks(&mut self, epoch: &str) -> Result<()> {
    self.state.load_networks(epoch)
  }

  pub fn print_networks(&self, verbose: bool) {
    self.state.print_networks(verbose)
  }

  pub fn set_requires_grad<I, S>(&mut self, names: I, requires_grad: bool) -> Result<()>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    self.state.set_requires_grad(names, requires_grad)
  }
}
