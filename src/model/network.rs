use std::{collections::HashMap, fmt};

use candle_core::{DType, Device, ModuleT, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use super::{FeedForward, Identity, Norm, ResnetBlock, Residual, UnetBlock};
use crate::error::{ModelError, Result};

/// Buffer names that are stored in checkpoints but are not learned parameters.
pub const BUFFER_NAMES: [&str; 3] = ["running_mean", "running_var", "num_batches_tracked"];

pub fn is_buffer(key: &str) -> bool {
  let leaf = key.rsplit('.').next().unwrap_or(key);
  BUFFER_NAMES.contains(&leaf)
}

/// A sub-network that can be registered on a model: a train/eval aware module that can
/// describe its own architecture.
pub trait Network: ModuleT + fmt::Display {
  /// Dotted paths of the instance-norm layers inside this network.
  fn instance_norm_paths(&self) -> Vec<String> {
    Vec::new()
  }
}

impl Network for Identity {}

impl Network for FeedForward {}

impl Network for ResnetBlock {
  fn instance_norm_paths(&self) -> Vec<String> {
    ResnetBlock::instance_norm_paths(self)
  }
}

impl Network for UnetBlock {
  fn instance_norm_paths(&self) -> Vec<String> {
    UnetBlock::instance_norm_paths(self)
  }
}

impl<M: Network> Network for Residual<M> {
  fn instance_norm_paths(&self) -> Vec<String> {
    self.inner.instance_norm_paths()
  }
}

impl<M: Network> Network for Norm<M> {
  fn instance_norm_paths(&self) -> Vec<String> {
    self.inner.instance_norm_paths()
  }
}

pub struct NetworkEntry {
  name: String,
  varmap: VarMap,
  net: Box<dyn Network>,
  training: bool,
  requires_grad: bool,
}

impl NetworkEntry {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn forward(&self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
    self.net.forward_t(x, self.training)
  }

  pub fn is_training(&self) -> bool {
    self.training
  }

  pub fn set_training(&mut self, training: bool) {
    self.training = training;
  }

  pub fn requires_grad(&self) -> bool {
    self.requires_grad
  }

  pub fn set_requires_grad(&mut self, requires_grad: bool) {
    self.requires_grad = requires_grad;
  }

  pub fn varmap(&self) -> &VarMap {
    &self.varmap
  }

  /// Learned parameters only, sorted by path.
  pub fn parameters(&self) -> Vec<Var> {
    self
      .named_vars()
      .into_iter()
      .filter(|(k, _)| !is_buffer(k))
      .map(|(_, v)| v)
      .collect()
  }

  /// Every variable, buffers included, sorted by path.
  pub fn named_vars(&self) -> Vec<(String, Var)> {
    let data = self
      .varmap
      .data()
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
  }

  /// Snapshot of every parameter and buffer keyed by dotted path.
  pub fn state_dict(&self) -> Result<HashMap<String, Tensor>, candle_core::Error> {
    let mut state = HashMap::new();
    for (k, v) in self.named_vars() {
      state.insert(k, v.as_tensor().detach().copy()?);
    }
    Ok(state)
  }

  pub fn num_parameters(&self) -> usize {
    self.parameters().iter().map(|v| v.elem_count()).sum()
  }

  pub fn architecture(&self) -> String {
    self.net.to_string()
  }

  pub fn instance_norm_paths(&self) -> Vec<String> {
    self.net.instance_norm_paths()
  }
}

/// Named sub-networks in registration order.
#[derive(Default)]
pub struct NetworkRegistry {
  entries: Vec<NetworkEntry>,
}

impl NetworkRegistry {
  pub fn register<N, F>(&mut self, name: &str, device: &Device, build: F) -> Result<()>
  where
    N: Network + 'static,
    F: FnOnce(VarBuilder) -> Result<N, candle_core::Error>,
  {
    if self.entries.iter().any(|e| e.name == name) {
      return Err(ModelError::config(format!(
        "network [{name}] is registered twice"
      )));
    }

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let net = build(vb)?;

    self.entries.push(NetworkEntry {
      name: name.to_owned(),
      varmap,
      net: Box::new(net),
      training: true,
      requires_grad: true,
    });

    Ok(())
  }

  pub fn get(&self, name: &str) -> Result<&NetworkEntry> {
    self
      .entries
      .iter()
      .find(|e| e.name == name)
      .ok_or_else(|| ModelError::config(format!("network [{name}] is not registered")))
  }

  pub fn get_mut(&mut self, name: &str) -> Result<&mut NetworkEntry> {
    self
      .entries
      .iter_mut()
      .find(|e| e.name == name)
      .ok_or_else(|| ModelError::config(format!("network [{name}] is not registered")))
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.entries.iter().map(|e| e.name.as_str())
  }

  pub fn iter(&self) -> impl Iterator<Item = &NetworkEntry> {
    self.entries.iter()
  }

  pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NetworkEntry> {
    self.entries.iter_mut()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}
