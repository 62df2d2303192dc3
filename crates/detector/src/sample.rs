//! Per-image data samples carried through every detector mode.

use serde::{Deserialize, Serialize};

/// A set of boxes with aligned labels and (optionally empty) scores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceSet {
    /// Boxes `[x0, y0, x1, y1]` in input-image pixels.
    pub bboxes: Vec<[f32; 4]>,
    pub labels: Vec<usize>,
    /// Empty for ground truth; aligned with `bboxes` for proposals and predictions.
    #[serde(default)]
    pub scores: Vec<f32>,
}

impl InstanceSet {
    pub fn new(bboxes: Vec<[f32; 4]>, labels: Vec<usize>) -> Self {
        Self {
            bboxes,
            labels,
            scores: Vec::new(),
        }
    }

    pub fn with_scores(mut self, scores: Vec<f32>) -> Self {
        self.scores = scores;
        self
    }

    pub fn len(&self) -> usize {
        self.bboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bboxes.is_empty()
    }

    /// Copy with every label set to 0 (class-agnostic foreground).
    pub fn with_zeroed_labels(&self) -> Self {
        Self {
            bboxes: self.bboxes.clone(),
            labels: vec![0; self.labels.len()],
            scores: self.scores.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageMeta {
    /// (height, width) of the network input after resizing/padding.
    pub img_shape: (usize, usize),
    /// (height, width) of the source image.
    pub ori_shape: (usize, usize),
    /// (w_scale, h_scale) applied when resizing the source image.
    pub scale_factor: (f32, f32),
}

impl ImageMeta {
    /// Meta for an image fed at its native resolution.
    pub fn unscaled(height: usize, width: usize) -> Self {
        Self {
            img_shape: (height, width),
            ori_shape: (height, width),
            scale_factor: (1.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSample {
    pub meta: ImageMeta,
    pub gt_instances: InstanceSet,
    /// Precomputed proposals; when present the proposal stage is bypassed.
    #[serde(default)]
    pub proposals: Option<InstanceSet>,
    #[serde(default)]
    pub pred_instances: Option<InstanceSet>,
}

impl DataSample {
    pub fn new(meta: ImageMeta, gt_instances: InstanceSet) -> Self {
        Self {
            meta,
            gt_instances,
            proposals: None,
            pred_instances: None,
        }
    }

    pub fn with_proposals(mut self, proposals: InstanceSet) -> Self {
        self.proposals = Some(proposals);
        self
    }
}

/// Deep copy of `samples` with class-agnostic ground truth for the proposal stage.
pub fn class_agnostic(samples: &[DataSample]) -> Vec<DataSample> {
    samples
        .iter()
        .map(|sample| DataSample {
            gt_instances: sample.gt_instances.with_zeroed_labels(),
            ..sample.clone()
        })
        .collect()
}
