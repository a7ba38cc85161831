//! Checkpoint files: one safetensors file per network, keyed by dotted parameter path.

use std::{
  collections::{BTreeSet, HashMap, HashSet},
  path::{Path, PathBuf},
};

use candle_core::{Device, Tensor};

use crate::{
  error::{ModelError, Result},
  model::NetworkEntry,
};

pub const CHECKPOINT_EXT: &str = "safetensors";

/// `<epoch>_net_<name>.safetensors`
pub fn checkpoint_file_name(epoch: &str, name: &str) -> String {
  format!("{epoch}_net_{name}.{CHECKPOINT_EXT}")
}

/// How on-disk keys relate to the live network's parameter paths.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum KeyRemap {
  /// Keys are written and read as they are.
  #[default]
  Verbatim,
  /// Keys carry a wrapper namespace such as `module.`: prepended on save, required and
  /// stripped on load.
  Prefixed(String),
}

impl KeyRemap {
  pub fn to_disk(&self, key: &str) -> String {
    match self {
      KeyRemap::Verbatim => key.to_owned(),
      KeyRemap::Prefixed(prefix) => format!("{prefix}{key}"),
    }
  }

  pub fn from_disk(&self, key: &str) -> Result<String> {
    match self {
      KeyRemap::Verbatim => Ok(key.to_owned()),
      KeyRemap::Prefixed(prefix) => key
        .strip_prefix(prefix.as_str())
        .map(str::to_owned)
        .ok_or_else(|| ModelError::MissingKeyPrefix {
          key: key.to_owned(),
          prefix: prefix.clone(),
        }),
    }
  }
}

pub fn save_network(entry: &NetworkEntry, path: &Path, remap: &KeyRemap) -> Result<()> {
  let state: HashMap<String, Tensor> = entry
    .state_dict()?
    .into_iter()
    .map(|(k, v)| (remap.to_disk(&k), v))
    .collect();

  candle_core::safetensors::save(&state, path).map_err(|source| ModelError::CheckpointWrite {
    path: path.to_owned(),
    source,
  })
}

pub fn read_state(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
  let bytes = std::fs::read(path).map_err(|e| ModelError::fs(path, e))?;
  Ok(candle_core::safetensors::load_buffer(&bytes, device)?)
}

pub fn remap_state(
  state: HashMap<String, Tensor>,
  remap: &KeyRemap,
) -> Result<HashMap<String, Tensor>> {
  state
    .into_iter()
    .map(|(k, v)| -> Result<(String, Tensor)> { Ok((remap.from_disk(&k)?, v)) })
    .collect()
}

/// Drops buffers written by older instance-norm layers that tracked running statistics.
///
/// For every key owned by one of `instance_norm_paths`: `num_batches_tracked` is always
/// removed, `running_mean`/`running_var` are removed when the live network has no such key.
pub fn patch_instance_norm_state(
  state: &mut HashMap<String, Tensor>,
  live_keys: &HashSet<String>,
  instance_norm_paths: &[String],
) {
  state.retain(|key, _| {
    let Some((owner, leaf)) = key.rsplit_once('.') else {
      return true;
    };

    if !instance_norm_paths.iter().any(|p| p == owner) {
      return true;
    }

    match leaf {
      "num_batches_tracked" => false,
      "running_mean" | "running_var" => live_keys.contains(key),
      _ => true,
    }
  });
}

/// Copies `state` into the network. The key sets must match exactly.
pub fn apply_state(
  entry: &NetworkEntry,
  path: &Path,
  state: HashMap<String, Tensor>,
) -> Result<()> {
  let vars = entry.named_vars();

  let live: BTreeSet<&str> = vars.iter().map(|(k, _)| k.as_str()).collect();
  let disk: BTreeSet<&str> = state.keys().map(String::as_str).collect();

  if live != disk {
    return Err(ModelError::CheckpointMismatch {
      network: entry.name().to_owned(),
      path: path.to_owned(),
      missing: live.difference(&disk).map(|k| k.to_string()).collect(),
      unexpected: disk.difference(&live).map(|k| k.to_string()).collect(),
    });
  }

  // every tensor is converted and shape-checked before the first write
  let mut staged = Vec::with_capacity(vars.len());
  for (key, var) in &vars {
    let tensor = &state[key];
    if tensor.dims() != var.dims() {
      return Err(ModelError::CheckpointShape {
        network: entry.name().to_owned(),
        path: path.to_owned(),
        key: key.clone(),
        expected: var.dims().to_vec(),
        found: tensor.dims().to_vec(),
      });
    }
    staged.push((var, tensor.to_dtype(var.dtype())?.to_device(var.device())?));
  }

  for (var, tensor) in staged {
    var.set(&tensor)?;
  }

  Ok(())
}

pub struct LoadOptions<'a> {
  pub remap: &'a KeyRemap,
  pub legacy_instance_norm: bool,
  pub device: &'a Device,
}

pub fn load_network(entry: &NetworkEntry, path: &Path, options: &LoadOptions) -> Result<()> {
  let state = read_state(path, options.device)?;
  let mut state = remap_state(state, options.remap)?;

  if options.legacy_instance_norm {
    let live_keys: HashSet<String> = entry.named_vars().into_iter().map(|(k, _)| k).collect();
    patch_instance_norm_state(&mut state, &live_keys, &entry.instance_norm_paths());
  }

  apply_state(entry, path, state)
}

pub fn checkpoint_path(dir: &Path, epoch: &str, name: &str) -> PathBuf {
  dir.join(checkpoint_file_name(epoch, name))
}
