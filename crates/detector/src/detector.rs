//! Dual-stream two-stage detector: RGB and thermal backbones, thermal-first proposals,
//! fused ROI stage and optional feature distillation from a frozen teacher.

use crate::compat::CompatRules;
use crate::distill::{DistillFeatures, DistillLossBank};
use crate::error::{DetectorError, DetectorResult};
use crate::fusion::fuse_pyramid;
use crate::losses::{prefix_proposal_losses, LossMap};
use crate::pyramid::{FeaturePyramid, InputLayout, Stream};
use crate::sample::{class_agnostic, DataSample, InstanceSet};
use crate::stages::{
    extract_stream, Backbone, FusionOp, ModuleMode, Neck, ProposalConfig, ProposalStage,
    RoiOutputs, RoiStage,
};
use crate::state::{
    check_shapes, component_state, diff_keys, load_component, LoadMode, LoadReport, StateDict,
};
use crate::teacher::{TeacherEnsemble, TeacherPhase};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use tracing::{debug, info, warn};

/// Key prefix of teacher parameters inside the detector's own state dict.
pub const TEACHER_KEY_PREFIX: &str = "teacher_";
pub const DISTILL_KEY_PREFIX: &str = "distill_losses.";

/// Everything the orchestrator owns, assembled by the caller or by `from_config`.
pub struct DetectorParts<B: Backend> {
    pub layout: InputLayout,
    pub backbone: Box<dyn Backbone<B>>,
    pub backbone_ir: Box<dyn Backbone<B>>,
    pub neck: Option<Box<dyn Neck<B>>>,
    pub neck_ir: Option<Box<dyn Neck<B>>>,
    pub fusion: Box<dyn FusionOp<B>>,
    pub rpn_head: Option<Box<dyn ProposalStage<B>>>,
    pub roi_head: Option<Box<dyn RoiStage<B>>>,
    pub proposal_cfg: ProposalConfig,
    pub teacher: Option<TeacherEnsemble<B>>,
    pub distill_losses: DistillLossBank<B>,
}

impl<B: Backend> DetectorParts<B> {
    pub fn new(
        layout: InputLayout,
        backbone: Box<dyn Backbone<B>>,
        backbone_ir: Box<dyn Backbone<B>>,
        fusion: Box<dyn FusionOp<B>>,
    ) -> Self {
        Self {
            layout,
            backbone,
            backbone_ir,
            neck: None,
            neck_ir: None,
            fusion,
            rpn_head: None,
            roi_head: None,
            proposal_cfg: ProposalConfig::default(),
            teacher: None,
            distill_losses: DistillLossBank::new(layout.num_levels),
        }
    }

    pub fn necks(mut self, neck: Box<dyn Neck<B>>, neck_ir: Box<dyn Neck<B>>) -> Self {
        self.neck = Some(neck);
        self.neck_ir = Some(neck_ir);
        self
    }

    pub fn rpn_head(mut self, head: Box<dyn ProposalStage<B>>) -> Self {
        self.rpn_head = Some(head);
        self
    }

    pub fn roi_head(mut self, head: Box<dyn RoiStage<B>>) -> Self {
        self.roi_head = Some(head);
        self
    }

    pub fn proposal_cfg(mut self, cfg: ProposalConfig) -> Self {
        self.proposal_cfg = cfg;
        self
    }

    pub fn distillation(mut self, teacher: TeacherEnsemble<B>, losses: DistillLossBank<B>) -> Self {
        self.teacher = Some(teacher);
        self.distill_losses = losses;
        self
    }
}

/// Host-framework style dispatch target for [`DualStreamDetector::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    Loss,
    Predict { rescale: bool },
    Tensor,
}

#[derive(Debug)]
pub enum DetectorOutput<B: Backend> {
    Losses(LossMap<B>),
    Predictions(Vec<DataSample>),
    Raw(RoiOutputs<B>),
}

pub struct DualStreamDetector<B: Backend> {
    layout: InputLayout,
    backbone: Box<dyn Backbone<B>>,
    backbone_ir: Box<dyn Backbone<B>>,
    neck: Option<Box<dyn Neck<B>>>,
    neck_ir: Option<Box<dyn Neck<B>>>,
    fusion_conv: Box<dyn FusionOp<B>>,
    rpn_head: Option<Box<dyn ProposalStage<B>>>,
    roi_head: Option<Box<dyn RoiStage<B>>>,
    proposal_cfg: ProposalConfig,
    teacher: Option<TeacherEnsemble<B>>,
    distill_losses: DistillLossBank<B>,
    mode: ModuleMode,
}

impl<B: Backend> DualStreamDetector<B> {
    pub fn from_parts(parts: DetectorParts<B>) -> DetectorResult<Self> {
        let layout = parts.layout;
        layout.validate()?;
        if parts.neck.is_some() != parts.neck_ir.is_some() {
            return Err(DetectorError::Config(
                "neck and neck_ir must be set together".into(),
            ));
        }
        if parts.distill_losses.num_levels() != layout.num_levels {
            return Err(DetectorError::Config(format!(
                "distill losses were resolved against {} levels, the detector has {}",
                parts.distill_losses.num_levels(),
                layout.num_levels
            )));
        }
        match &parts.teacher {
            Some(teacher) if teacher.layout() != layout => {
                return Err(DetectorError::Config(format!(
                    "teacher layout {:?} differs from detector layout {layout:?}",
                    teacher.layout()
                )));
            }
            None if !parts.distill_losses.is_empty() => {
                return Err(DetectorError::Config(
                    "distill losses are configured but there is no teacher".into(),
                ));
            }
            _ => {}
        }
        Ok(Self {
            layout,
            backbone: parts.backbone,
            backbone_ir: parts.backbone_ir,
            neck: parts.neck,
            neck_ir: parts.neck_ir,
            fusion_conv: parts.fusion,
            rpn_head: parts.rpn_head,
            roi_head: parts.roi_head,
            proposal_cfg: parts.proposal_cfg,
            teacher: parts.teacher,
            distill_losses: parts.distill_losses,
            mode: ModuleMode::Train,
        })
    }

    pub fn layout(&self) -> InputLayout {
        self.layout
    }

    pub fn proposal_cfg(&self) -> &ProposalConfig {
        &self.proposal_cfg
    }

    pub fn with_rpn(&self) -> bool {
        self.rpn_head.is_some()
    }

    pub fn with_roi_head(&self) -> bool {
        self.roi_head.is_some()
    }

    pub fn with_neck(&self) -> bool {
        self.neck.is_some()
    }

    /// ROI stage present and able to emit boxes.
    pub fn with_bbox(&self) -> bool {
        self.roi_head.as_ref().is_some_and(|h| h.has_bbox_head())
    }

    pub fn is_distilling(&self) -> bool {
        self.teacher.is_some()
    }

    pub fn teacher_phase(&self) -> Option<TeacherPhase> {
        self.teacher.as_ref().map(TeacherEnsemble::phase)
    }

    pub fn teacher(&self) -> Option<&TeacherEnsemble<B>> {
        self.teacher.as_ref()
    }

    pub fn distill_losses(&self) -> &DistillLossBank<B> {
        &self.distill_losses
    }

    pub fn mode(&self) -> ModuleMode {
        self.mode
    }

    /// Switch the student modules; the teacher stays in eval.
    pub fn set_mode(&mut self, mode: ModuleMode) {
        self.backbone.set_mode(mode);
        self.backbone_ir.set_mode(mode);
        if let Some(neck) = self.neck.as_mut() {
            neck.set_mode(mode);
        }
        if let Some(neck) = self.neck_ir.as_mut() {
            neck.set_mode(mode);
        }
        self.fusion_conv.set_mode(mode);
        if let Some(head) = self.rpn_head.as_mut() {
            head.set_mode(mode);
        }
        if let Some(head) = self.roi_head.as_mut() {
            head.set_mode(mode);
        }
        self.distill_losses.set_mode(mode);
        self.mode = mode;
    }

    /// RGB pyramid from channels `[0, rgb)`, thermal pyramid from `[rgb, C)`.
    pub fn extract_feat(
        &self,
        image: &Tensor<B, 4>,
    ) -> DetectorResult<(FeaturePyramid<B>, FeaturePyramid<B>)> {
        let (rgb, ir) = self.layout.split(image)?;
        let n = self.layout.num_levels;
        let rgb = extract_stream(
            self.backbone.as_ref(),
            self.neck.as_deref(),
            rgb,
            Stream::Rgb,
            n,
        )?;
        let ir = extract_stream(
            self.backbone_ir.as_ref(),
            self.neck_ir.as_deref(),
            ir,
            Stream::Ir,
            n,
        )?;
        Ok((rgb, ir))
    }

    /// Teacher pyramids, cut from the autodiff graph.
    pub fn extract_teacher_feat(
        &self,
        image: &Tensor<B, 4>,
    ) -> DetectorResult<(FeaturePyramid<B>, FeaturePyramid<B>)> {
        self.teacher
            .as_ref()
            .ok_or_else(|| DetectorError::Precondition("detector has no teacher".into()))?
            .extract_feat(image)
    }

    pub fn fuse(
        &self,
        rgb: &FeaturePyramid<B>,
        ir: &FeaturePyramid<B>,
    ) -> DetectorResult<FeaturePyramid<B>> {
        fuse_pyramid(self.fusion_conv.as_ref(), rgb, ir, self.layout.num_levels)
    }

    pub fn loss(
        &mut self,
        image: &Tensor<B, 4>,
        samples: &[DataSample],
    ) -> DetectorResult<LossMap<B>> {
        check_batch(image, samples)?;
        let (rgb, ir) = self.extract_feat(image)?;

        let teacher_feats = match self.teacher.as_mut() {
            Some(teacher) => {
                if teacher.ensure_eval() {
                    debug!("teacher latched into eval mode");
                }
                Some(teacher.extract_feat(image)?)
            }
            None => None,
        };

        let mut losses = LossMap::new();
        let proposals = match self.rpn_head.as_deref() {
            Some(rpn) => {
                let rpn_samples = class_agnostic(samples);
                let (rpn_losses, proposals) =
                    rpn.loss_and_predict(&ir, &rpn_samples, &self.proposal_cfg)?;
                let rpn_losses = prefix_proposal_losses(rpn_losses);
                debug!(keys = ?rpn_losses.keys().collect::<Vec<_>>(), "proposal stage losses");
                losses.merge(rpn_losses);
                proposals
            }
            None => precomputed_proposals(samples)?,
        };

        let fused = self.fuse(&rgb, &ir)?;
        let roi = self.roi_stage("loss")?;
        losses.merge(roi.loss(&fused, &proposals, samples)?);

        if let (Some(teacher), Some((t_rgb, t_ir))) =
            (self.teacher.as_ref(), teacher_feats.as_ref())
        {
            let t_fused = if self.distill_losses.needs_fused() {
                Some(teacher.fused_pyramid(t_rgb, t_ir)?)
            } else {
                None
            };
            let student = DistillFeatures {
                rgb: &rgb,
                ir: &ir,
                fused: Some(&fused),
            };
            let target = DistillFeatures {
                rgb: t_rgb,
                ir: t_ir,
                fused: t_fused.as_ref(),
            };
            losses.merge(self.distill_losses.compute(&student, &target, samples)?);
        }
        Ok(losses)
    }

    /// Attach per-image predictions to `samples` and hand them back.
    pub fn predict(
        &self,
        image: &Tensor<B, 4>,
        mut samples: Vec<DataSample>,
        rescale: bool,
    ) -> DetectorResult<Vec<DataSample>> {
        if !self.with_bbox() {
            return Err(DetectorError::Precondition(
                "predict needs an ROI stage with a bbox head".into(),
            ));
        }
        check_batch(image, &samples)?;
        let (rgb, ir) = self.extract_feat(image)?;
        let proposals = if samples.iter().any(|s| s.proposals.is_some()) {
            precomputed_proposals(&samples)?
        } else {
            self.rpn_head
                .as_deref()
                .ok_or_else(|| {
                    DetectorError::Precondition(
                        "no precomputed proposals and no proposal stage".into(),
                    )
                })?
                .predict(&ir, &samples, false)?
        };
        let fused = self.fuse(&rgb, &ir)?;
        let roi = self.roi_stage("predict")?;
        let results = roi.predict(&fused, &proposals, &samples, rescale)?;
        if results.len() != samples.len() {
            return Err(DetectorError::Precondition(format!(
                "ROI stage returned {} results for {} samples",
                results.len(),
                samples.len()
            )));
        }
        for (sample, result) in samples.iter_mut().zip(results) {
            sample.pred_instances = Some(result);
        }
        Ok(samples)
    }

    /// Raw ROI-stage outputs without post-processing.
    pub fn forward(
        &self,
        image: &Tensor<B, 4>,
        samples: &[DataSample],
    ) -> DetectorResult<RoiOutputs<B>> {
        check_batch(image, samples)?;
        let (rgb, ir) = self.extract_feat(image)?;
        let proposals = match self.rpn_head.as_deref() {
            Some(rpn) => rpn.predict(&ir, samples, false)?,
            None => precomputed_proposals(samples)?,
        };
        let fused = self.fuse(&rgb, &ir)?;
        let roi = self.roi_stage("forward")?;
        roi.forward(&fused, &proposals, samples)
    }

    pub fn run(
        &mut self,
        image: &Tensor<B, 4>,
        samples: Vec<DataSample>,
        mode: ForwardMode,
    ) -> DetectorResult<DetectorOutput<B>> {
        match mode {
            ForwardMode::Loss => self.loss(image, &samples).map(DetectorOutput::Losses),
            ForwardMode::Predict { rescale } => self
                .predict(image, samples, rescale)
                .map(DetectorOutput::Predictions),
            ForwardMode::Tensor => self.forward(image, &samples).map(DetectorOutput::Raw),
        }
    }

    fn roi_stage(&self, op: &str) -> DetectorResult<&dyn RoiStage<B>> {
        self.roi_head
            .as_deref()
            .ok_or_else(|| DetectorError::Precondition(format!("{op} needs an ROI stage")))
    }

    /// Student parameters plus distillation-loss parameters; teacher entries excluded.
    pub fn trainable_state_dict(&self) -> DetectorResult<StateDict> {
        let mut out = StateDict::new();
        component_state(self.backbone.as_ref(), "backbone.", &mut out)?;
        component_state(self.backbone_ir.as_ref(), "backbone_ir.", &mut out)?;
        if let Some(neck) = self.neck.as_deref() {
            component_state(neck, "neck.", &mut out)?;
        }
        if let Some(neck) = self.neck_ir.as_deref() {
            component_state(neck, "neck_ir.", &mut out)?;
        }
        component_state(self.fusion_conv.as_ref(), "fusion_conv.", &mut out)?;
        if let Some(head) = self.rpn_head.as_deref() {
            component_state(head, "rpn_head.", &mut out)?;
        }
        if let Some(head) = self.roi_head.as_deref() {
            component_state(head, "roi_head.", &mut out)?;
        }
        let distill = self.distill_losses.state_dict()?;
        out.extend(distill.with_prefix(DISTILL_KEY_PREFIX));
        Ok(out)
    }

    pub fn state_dict(&self) -> DetectorResult<StateDict> {
        let mut out = self.trainable_state_dict()?;
        if let Some(teacher) = self.teacher.as_ref() {
            out.extend(teacher.state_dict()?.with_prefix(TEACHER_KEY_PREFIX));
        }
        Ok(out)
    }

    /// Load a checkpoint, seeding both streams from single-stream checkpoints.
    ///
    /// Teacher entries are optional here; when present they overwrite the teacher weights.
    /// Every shape is checked before the first write, so an `Err` leaves the detector as it was.
    pub fn load_state_dict(
        &mut self,
        state: StateDict,
        mode: LoadMode,
    ) -> DetectorResult<LoadReport> {
        let (state, fired_rules) = CompatRules::classic_to_dual().apply(state);
        let expected = self.trainable_state_dict()?;
        let (missing, mut unexpected) = diff_keys(&expected, &state);
        unexpected.retain(|k| !k.starts_with(TEACHER_KEY_PREFIX));
        if mode == LoadMode::Strict && !missing.is_empty() {
            return Err(DetectorError::CheckpointKeyMismatch {
                missing,
                unexpected,
            });
        }
        if !unexpected.is_empty() {
            warn!(count = unexpected.len(), keys = ?unexpected, "unexpected keys in checkpoint");
        }
        check_shapes(&self.state_dict()?, &state)?;

        let mut absent = Vec::new();
        load_component(self.backbone.as_mut(), "backbone.", &state, &mut absent)?;
        load_component(
            self.backbone_ir.as_mut(),
            "backbone_ir.",
            &state,
            &mut absent,
        )?;
        if let Some(neck) = self.neck.as_deref_mut() {
            load_component(neck, "neck.", &state, &mut absent)?;
        }
        if let Some(neck) = self.neck_ir.as_deref_mut() {
            load_component(neck, "neck_ir.", &state, &mut absent)?;
        }
        load_component(
            self.fusion_conv.as_mut(),
            "fusion_conv.",
            &state,
            &mut absent,
        )?;
        if let Some(head) = self.rpn_head.as_deref_mut() {
            load_component(head, "rpn_head.", &state, &mut absent)?;
        }
        if let Some(head) = self.roi_head.as_deref_mut() {
            load_component(head, "roi_head.", &state, &mut absent)?;
        }
        let distill = self
            .distill_losses
            .load_state_dict(&state.strip_prefix(DISTILL_KEY_PREFIX))?;
        for key in distill {
            absent.push(format!("{DISTILL_KEY_PREFIX}{key}"));
        }

        if let Some(teacher) = self.teacher.as_mut() {
            let teacher_state = state.strip_prefix(TEACHER_KEY_PREFIX);
            if !teacher_state.is_empty() {
                teacher.load_checkpoint(&teacher_state, LoadMode::Lenient)?;
            }
        }

        let report = LoadReport {
            loaded: expected.len() - missing.len(),
            missing: absent,
            unexpected,
            fired_rules,
        };
        info!(
            loaded = report.loaded,
            missing = report.missing.len(),
            unexpected = report.unexpected.len(),
            fired = ?report.fired_rules,
            "loaded detector state"
        );
        Ok(report)
    }
}

fn check_batch<B: Backend>(image: &Tensor<B, 4>, samples: &[DataSample]) -> DetectorResult<()> {
    let batch = image.dims()[0];
    if samples.len() != batch {
        return Err(DetectorError::Precondition(format!(
            "{} data samples for a batch of {batch} images",
            samples.len()
        )));
    }
    Ok(())
}

/// Per-sample proposals; every sample must carry them.
fn precomputed_proposals(samples: &[DataSample]) -> DetectorResult<Vec<InstanceSet>> {
    samples
        .iter()
        .enumerate()
        .map(|(i, sample)| {
            sample.proposals.clone().ok_or_else(|| {
                DetectorError::Precondition(format!(
                    "sample {i} has no precomputed proposals and there is no proposal stage"
                ))
            })
        })
        .collect()
}
