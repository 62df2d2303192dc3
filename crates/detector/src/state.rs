//! Named parameter dictionaries and checkpoint files.

use crate::error::{DetectorError, DetectorResult};
use crate::stages::Component;
use burn::module::Param;
use burn::nn::conv::Conv2d;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Host copy of one parameter tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl ParamTensor {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> DetectorResult<Self> {
        let numel: usize = shape.iter().product();
        if numel != values.len() {
            return Err(DetectorError::shape("parameter element count", &[values.len()], &[numel]));
        }
        Ok(Self { shape, values })
    }

    pub fn from_tensor<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> DetectorResult<Self> {
        let data = tensor.into_data();
        let shape = data.shape.clone();
        let values = data
            .to_vec::<f32>()
            .map_err(|e| DetectorError::Tensor(format!("{e:?}")))?;
        Ok(Self { shape, values })
    }

    pub fn to_tensor<B: Backend, const D: usize>(
        &self,
        device: &B::Device,
    ) -> DetectorResult<Tensor<B, D>> {
        if self.shape.len() != D {
            return Err(DetectorError::shape("parameter rank", &self.shape, &[D]));
        }
        let data = TensorData::new(self.values.clone(), self.shape.clone());
        Ok(Tensor::<B, D>::from_data(data, device))
    }
}

/// Ordered map from dotted parameter name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateDict {
    entries: BTreeMap<String, ParamTensor>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ParamTensor) -> Option<ParamTensor> {
        self.entries.insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<&ParamTensor> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<ParamTensor> {
        self.entries.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamTensor)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn any_key_contains(&self, needle: &str) -> bool {
        self.entries.keys().any(|k| k.contains(needle))
    }

    /// Entries under `prefix`, with the prefix removed (`"backbone."` keeps only backbone keys).
    pub fn strip_prefix(&self, prefix: &str) -> StateDict {
        self.entries
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(prefix)
                    .map(|rest| (rest.to_string(), v.clone()))
            })
            .collect()
    }

    /// Every entry with `prefix` prepended.
    pub fn with_prefix(&self, prefix: &str) -> StateDict {
        self.entries
            .iter()
            .map(|(k, v)| (format!("{prefix}{k}"), v.clone()))
            .collect()
    }

    pub fn extend(&mut self, other: StateDict) {
        self.entries.extend(other.entries);
    }
}

impl FromIterator<(String, ParamTensor)> for StateDict {
    fn from_iter<I: IntoIterator<Item = (String, ParamTensor)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for StateDict {
    type Item = (String, ParamTensor);
    type IntoIter = std::collections::btree_map::IntoIter<String, ParamTensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// On-disk checkpoint: parameters plus optional free-form metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub state_dict: StateDict,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
}

impl Checkpoint {
    pub fn new(state_dict: StateDict) -> Self {
        Self {
            state_dict,
            meta: None,
        }
    }

    pub fn from_path(path: &Path) -> DetectorResult<Self> {
        let raw = fs::read(path).map_err(|source| DetectorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| DetectorError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> DetectorResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| DetectorError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_vec(self).map_err(|source| DetectorError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(|source| DetectorError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Missing parameters abort the load before anything is written.
    #[default]
    Strict,
    /// Missing parameters keep their current values.
    Lenient,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    /// Compatibility rename stages that fired before loading.
    pub fired_rules: Vec<String>,
}

/// Keys of `expected` absent from `provided`, and keys of `provided` absent from `expected`.
pub fn diff_keys(expected: &StateDict, provided: &StateDict) -> (Vec<String>, Vec<String>) {
    let missing = expected
        .keys()
        .filter(|k| !provided.contains_key(k))
        .map(str::to_string)
        .collect();
    let unexpected = provided
        .keys()
        .filter(|k| !expected.contains_key(k))
        .map(str::to_string)
        .collect();
    (missing, unexpected)
}

/// Every entry of `provided` that `expected` also names must match its shape, and every
/// entry must hold as many values as its shape declares. Run before any assignment so a
/// failed load leaves the target untouched.
pub fn check_shapes(expected: &StateDict, provided: &StateDict) -> DetectorResult<()> {
    for (key, value) in provided.iter() {
        let numel: usize = value.shape.iter().product();
        if numel != value.values.len() {
            return Err(DetectorError::shape(key, &[value.values.len()], &[numel]));
        }
        if let Some(current) = expected.get(key) {
            if current.shape != value.shape {
                return Err(DetectorError::shape(key, &value.shape, &current.shape));
            }
        }
    }
    Ok(())
}

/// Append a component's parameters under `prefix`.
pub fn component_state<C: Component + ?Sized>(
    component: &C,
    prefix: &str,
    out: &mut StateDict,
) -> DetectorResult<()> {
    out.extend(component.state_dict()?.with_prefix(prefix));
    Ok(())
}

/// Load the entries of `params` under `prefix` into `component`; absent names are pushed
/// onto `missing` with the prefix restored.
pub fn load_component<C: Component + ?Sized>(
    component: &mut C,
    prefix: &str,
    params: &StateDict,
    missing: &mut Vec<String>,
) -> DetectorResult<()> {
    let absent = component
        .load_state_dict(&params.strip_prefix(prefix))
        .map_err(|err| match err {
            DetectorError::ShapeMismatch {
                context,
                left,
                right,
            } => DetectorError::ShapeMismatch {
                context: format!("{prefix}{context}"),
                left,
                right,
            },
            other => other,
        })?;
    missing.extend(absent.into_iter().map(|k| format!("{prefix}{k}")));
    Ok(())
}

/// Append a conv layer's `weight`/`bias` under `prefix`.
pub fn conv2d_state<B: Backend>(
    conv: &Conv2d<B>,
    prefix: &str,
    out: &mut StateDict,
) -> DetectorResult<()> {
    let weight = ParamTensor::from_tensor(conv.weight.val())?;
    out.insert(format!("{prefix}weight"), weight);
    if let Some(bias) = &conv.bias {
        let bias = ParamTensor::from_tensor(bias.val())?;
        out.insert(format!("{prefix}bias"), bias);
    }
    Ok(())
}

/// Overwrite a conv layer from `params`; absent names are pushed onto `missing`.
pub fn load_conv2d<B: Backend>(
    conv: &mut Conv2d<B>,
    prefix: &str,
    params: &StateDict,
    missing: &mut Vec<String>,
) -> DetectorResult<usize> {
    let mut loaded = 0;
    let weight_key = format!("{prefix}weight");
    match params.get(&weight_key) {
        Some(value) => {
            let current = conv.weight.val();
            let tensor = value.to_tensor::<B, 4>(&current.device())?;
            if tensor.dims() != current.dims() {
                return Err(DetectorError::shape(weight_key, &tensor.dims(), &current.dims()));
            }
            conv.weight = Param::from_tensor(tensor);
            loaded += 1;
        }
        None => missing.push(weight_key),
    }
    if let Some(bias) = conv.bias.as_mut() {
        let bias_key = format!("{prefix}bias");
        match params.get(&bias_key) {
            Some(value) => {
                let current = bias.val();
                let tensor = value.to_tensor::<B, 1>(&current.device())?;
                if tensor.dims() != current.dims() {
                    return Err(DetectorError::shape(bias_key, &tensor.dims(), &current.dims()));
                }
                *bias = Param::from_tensor(tensor);
                loaded += 1;
            }
            None => missing.push(bias_key),
        }
    }
    Ok(loaded)
}
