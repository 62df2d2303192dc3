//! Dual-stream (RGB + thermal) two-stage detector orchestration.
//!
//! The input image carries RGB channels followed by thermal channels. Each stream runs its
//! own backbone and neck; proposals come from the thermal pyramid alone, while the ROI stage
//! sees the per-level fusion of both pyramids. An optional frozen teacher supplies feature
//! targets for distillation losses.

pub mod builder;
pub mod builtin;
pub mod compat;
pub mod config;
pub mod detector;
pub mod distill;
pub mod error;
pub mod fusion;
pub mod losses;
pub mod pyramid;
pub mod registry;
pub mod sample;
pub mod stages;
pub mod state;
pub mod teacher;

pub type DefaultBackend = burn::backend::NdArray<f32>;

pub use config::{ComponentConfig, DetectorConfig};
pub use detector::{DetectorOutput, DetectorParts, DualStreamDetector, ForwardMode};
pub use error::{DetectorError, DetectorResult};
pub use registry::{BuildContext, ModelRegistry};

pub mod prelude {
    pub use crate::compat::CompatRules;
    pub use crate::config::{ComponentConfig, DetectorConfig};
    pub use crate::detector::{DetectorOutput, DetectorParts, DualStreamDetector, ForwardMode};
    pub use crate::distill::{DistillLossBank, DistillTarget};
    pub use crate::error::{DetectorError, DetectorResult};
    pub use crate::losses::LossMap;
    pub use crate::pyramid::{FeaturePyramid, InputLayout, Stream};
    pub use crate::registry::{BuildContext, ModelRegistry};
    pub use crate::sample::{DataSample, ImageMeta, InstanceSet};
    pub use crate::stages::{
        Backbone, Component, DistillLoss, FusionOp, ModuleMode, Neck, ProposalConfig, ProposalStage,
        RoiOutputs, RoiStage,
    };
    pub use crate::state::{Checkpoint, LoadMode, LoadReport, ParamTensor, StateDict};
    pub use crate::teacher::{TeacherEnsemble, TeacherParts, TeacherPhase};
    pub use crate::DefaultBackend;
}
