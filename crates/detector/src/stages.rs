//! Interfaces of the pluggable detector stages.
//!
//! Every stage is a [`Component`] (named parameters plus a train/eval switch) with a small
//! fixed set of forward methods. Stages that may be absent are held as `Option<Box<dyn ...>>`
//! by the orchestrator.

use crate::error::DetectorResult;
use crate::losses::LossMap;
use crate::pyramid::{FeaturePyramid, Stream};
use crate::sample::{DataSample, InstanceSet};
use crate::state::StateDict;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModuleMode {
    #[default]
    Train,
    Eval,
}

pub trait Component {
    /// Current parameters keyed by their local (unprefixed) name.
    fn state_dict(&self) -> DetectorResult<StateDict>;

    /// Overwrite parameters present in `params`; returns the local names that were absent.
    fn load_state_dict(&mut self, params: &StateDict) -> DetectorResult<Vec<String>>;

    fn set_mode(&mut self, _mode: ModuleMode) {}
}

pub trait Backbone<B: Backend>: Component {
    fn forward(&self, image: Tensor<B, 4>) -> DetectorResult<Vec<Tensor<B, 4>>>;
}

pub trait Neck<B: Backend>: Component {
    fn forward(&self, levels: Vec<Tensor<B, 4>>) -> DetectorResult<Vec<Tensor<B, 4>>>;
}

/// Learned merge of two equally shaped maps `[N, C, H, W]` into one `[N, C, H, W]`.
pub trait FusionOp<B: Backend>: Component {
    fn fuse(&self, rgb: Tensor<B, 4>, ir: Tensor<B, 4>) -> DetectorResult<Tensor<B, 4>>;
}

/// Options the proposal stage uses when turning its outputs into proposals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProposalConfig {
    #[serde(default = "default_nms_pre")]
    pub nms_pre: usize,
    #[serde(default = "default_max_per_img")]
    pub max_per_img: usize,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    #[serde(default)]
    pub min_bbox_size: f32,
}

fn default_nms_pre() -> usize {
    1000
}

fn default_max_per_img() -> usize {
    1000
}

fn default_iou_threshold() -> f32 {
    0.7
}

impl Default for ProposalConfig {
    fn default() -> Self {
        Self {
            nms_pre: default_nms_pre(),
            max_per_img: default_max_per_img(),
            iou_threshold: default_iou_threshold(),
            min_bbox_size: 0.0,
        }
    }
}

/// Class-agnostic region proposal stage.
pub trait ProposalStage<B: Backend>: Component {
    /// Training pass: losses plus one proposal set per sample.
    fn loss_and_predict(
        &self,
        feats: &FeaturePyramid<B>,
        samples: &[DataSample],
        proposal_cfg: &ProposalConfig,
    ) -> DetectorResult<(LossMap<B>, Vec<InstanceSet>)>;

    fn predict(
        &self,
        feats: &FeaturePyramid<B>,
        samples: &[DataSample],
        rescale: bool,
    ) -> DetectorResult<Vec<InstanceSet>>;
}

/// Raw per-ROI outputs before post-processing.
#[derive(Debug, Clone)]
pub struct RoiOutputs<B: Backend> {
    /// `[num_rois, num_classes + 1]`
    pub cls_score: Tensor<B, 2>,
    /// `[num_rois, 4 * num_classes]`
    pub bbox_pred: Tensor<B, 2>,
}

pub trait RoiStage<B: Backend>: Component {
    fn loss(
        &self,
        feats: &FeaturePyramid<B>,
        proposals: &[InstanceSet],
        samples: &[DataSample],
    ) -> DetectorResult<LossMap<B>>;

    fn predict(
        &self,
        feats: &FeaturePyramid<B>,
        proposals: &[InstanceSet],
        samples: &[DataSample],
        rescale: bool,
    ) -> DetectorResult<Vec<InstanceSet>>;

    fn forward(
        &self,
        feats: &FeaturePyramid<B>,
        proposals: &[InstanceSet],
        samples: &[DataSample],
    ) -> DetectorResult<RoiOutputs<B>>;

    fn has_bbox_head(&self) -> bool {
        true
    }
}

/// Compares a student feature map with the teacher's map at the same location.
pub trait DistillLoss<B: Backend>: Component {
    fn compute(
        &self,
        student: Tensor<B, 4>,
        teacher: Tensor<B, 4>,
        samples: &[DataSample],
    ) -> DetectorResult<Tensor<B, 1>>;
}

/// Backbone then (optional) neck over one stream's channels, checked against `num_levels`.
pub fn extract_stream<B: Backend>(
    backbone: &dyn Backbone<B>,
    neck: Option<&dyn Neck<B>>,
    input: Tensor<B, 4>,
    stream: Stream,
    num_levels: usize,
) -> DetectorResult<FeaturePyramid<B>> {
    let mut levels = backbone.forward(input)?;
    if let Some(neck) = neck {
        levels = neck.forward(levels)?;
    }
    let pyramid = FeaturePyramid::new(stream, levels);
    pyramid.expect_levels(num_levels)?;
    Ok(pyramid)
}
