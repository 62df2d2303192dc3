//! Named scalar losses returned by the loss mode.

use crate::error::{DetectorError, DetectorResult};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use std::collections::BTreeMap;

/// Prefix applied to proposal-stage losses that would otherwise collide with ROI losses.
pub const PROPOSAL_LOSS_PREFIX: &str = "ir_rpn_";

#[derive(Debug, Clone)]
pub struct LossMap<B: Backend> {
    entries: BTreeMap<String, Tensor<B, 1>>,
}

impl<B: Backend> Default for LossMap<B> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<B: Backend> LossMap<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Tensor<B, 1>) -> Option<Tensor<B, 1>> {
        self.entries.insert(name.into(), value)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor<B, 1>> {
        self.entries.get(name)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add every entry of `other`; entries of `other` win on name collisions.
    pub fn merge(&mut self, other: LossMap<B>) {
        self.entries.extend(other.entries);
    }

    /// New map with every key passed through `rename`.
    pub fn map_keys(self, rename: impl Fn(&str) -> String) -> Self {
        Self {
            entries: self
                .entries
                .into_iter()
                .map(|(k, v)| (rename(&k), v))
                .collect(),
        }
    }

    /// Sum of every entry whose name contains "loss"; `None` when there is none.
    pub fn total(&self) -> Option<Tensor<B, 1>> {
        self.entries
            .iter()
            .filter(|(k, _)| k.contains("loss"))
            .map(|(_, v)| v.clone().sum())
            .reduce(|acc, v| acc + v)
    }

    /// Host-side values for logging.
    pub fn scalars(&self) -> DetectorResult<BTreeMap<String, f32>> {
        self.entries
            .iter()
            .map(|(k, v)| {
                let values = v
                    .clone()
                    .into_data()
                    .to_vec::<f32>()
                    .map_err(|e| DetectorError::Tensor(format!("loss `{k}`: {e:?}")))?;
                Ok((k.clone(), values.into_iter().sum::<f32>()))
            })
            .collect()
    }

    pub fn into_inner(self) -> BTreeMap<String, Tensor<B, 1>> {
        self.entries
    }
}

impl<B: Backend> IntoIterator for LossMap<B> {
    type Item = (String, Tensor<B, 1>);
    type IntoIter = std::collections::btree_map::IntoIter<String, Tensor<B, 1>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Name under which a proposal-stage loss is reported.
pub fn proposal_loss_name(key: &str) -> String {
    if key.contains("loss") && !key.contains("rpn") {
        format!("{PROPOSAL_LOSS_PREFIX}{key}")
    } else {
        key.to_string()
    }
}

pub fn prefix_proposal_losses<B: Backend>(losses: LossMap<B>) -> LossMap<B> {
    losses.map_keys(proposal_loss_name)
}
