//! Frozen teacher network that supplies distillation targets.

use crate::config::DetectorConfig;
use crate::error::{DetectorError, DetectorResult};
use crate::pyramid::{FeaturePyramid, InputLayout, Stream};
use crate::registry::{BuildContext, ModelRegistry};
use crate::stages::{extract_stream, Backbone, FusionOp, ModuleMode, Neck};
use crate::state::{
    check_shapes, component_state, diff_keys, load_component, Checkpoint, LoadMode, LoadReport,
    StateDict,
};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use std::path::Path;
use tracing::{debug, info, warn};

/// Key prefixes of the teacher modules inside a teacher checkpoint.
pub const TEACHER_PREFIXES: [&str; 6] = [
    "backbone.",
    "backbone_ir.",
    "neck.",
    "neck_ir.",
    "fusion_conv.",
    "fusion_module.",
];

/// Eval-mode latch: the first distilling call switches the teacher to eval, later calls skip it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TeacherPhase {
    #[default]
    Uninitialized,
    Ready,
}

pub struct TeacherParts<B: Backend> {
    pub backbone: Box<dyn Backbone<B>>,
    pub backbone_ir: Box<dyn Backbone<B>>,
    pub neck: Option<Box<dyn Neck<B>>>,
    pub neck_ir: Option<Box<dyn Neck<B>>>,
    pub fusion_conv: Box<dyn FusionOp<B>>,
    pub fusion_module: Box<dyn FusionOp<B>>,
    /// Levels fused by `fusion_module`; every other level uses `fusion_conv`.
    pub fusion_module_levels: Vec<usize>,
}

pub struct TeacherEnsemble<B: Backend> {
    layout: InputLayout,
    parts: TeacherParts<B>,
    phase: TeacherPhase,
}

impl<B: Backend> TeacherEnsemble<B> {
    pub fn from_parts(layout: InputLayout, parts: TeacherParts<B>) -> DetectorResult<Self> {
        layout.validate()?;
        if parts.neck.is_some() != parts.neck_ir.is_some() {
            return Err(DetectorError::Config(
                "teacher needs both necks or neither".into(),
            ));
        }
        if let Some(level) = parts
            .fusion_module_levels
            .iter()
            .find(|&&l| l >= layout.num_levels)
        {
            return Err(DetectorError::Config(format!(
                "teacher fusion_module level {level} is out of range for {} levels",
                layout.num_levels
            )));
        }
        Ok(Self {
            layout,
            parts,
            phase: TeacherPhase::Uninitialized,
        })
    }

    /// Fresh, untrained modules from a teacher configuration.
    pub fn build(
        cfg: &DetectorConfig,
        registry: &ModelRegistry<B>,
        device: &B::Device,
    ) -> DetectorResult<Self> {
        let model = &cfg.model;
        let layout = model.layout;
        let ctx = BuildContext::<B>::new(device.clone(), layout);
        let fusion_module_cfg = model.fusion_module.as_ref().ok_or_else(|| {
            DetectorError::Config("teacher config needs a model.fusion_module table".into())
        })?;
        let (neck, neck_ir) = match &model.neck {
            Some(neck) => (
                Some(registry.build_neck(neck, &ctx)?),
                Some(registry.build_neck(neck, &ctx)?),
            ),
            None => (None, None),
        };
        let rgb_ctx = ctx.with_in_channels(layout.rgb_channels);
        let ir_ctx = ctx.with_in_channels(layout.ir_channels());
        let parts = TeacherParts {
            backbone: registry.build_backbone(&model.backbone, &rgb_ctx)?,
            backbone_ir: registry.build_backbone(&model.backbone, &ir_ctx)?,
            neck,
            neck_ir,
            fusion_conv: registry.build_fusion(&model.fusion, &ctx)?,
            fusion_module: registry.build_fusion(fusion_module_cfg, &ctx)?,
            fusion_module_levels: model.fusion_module_levels.clone(),
        };
        Self::from_parts(layout, parts)
    }

    /// Build from `teacher_cfg` and load every module from the one `checkpoint` file.
    pub fn load(
        teacher_cfg: &Path,
        checkpoint: &Path,
        registry: &ModelRegistry<B>,
        device: &B::Device,
        mode: LoadMode,
    ) -> DetectorResult<(Self, LoadReport)> {
        let cfg = DetectorConfig::from_path(teacher_cfg)?;
        let mut teacher = Self::build(&cfg, registry, device)?;
        let ckpt = Checkpoint::from_path(checkpoint)?;
        let report = teacher.load_checkpoint(&ckpt.state_dict, mode)?;
        info!(
            config = %teacher_cfg.display(),
            checkpoint = %checkpoint.display(),
            loaded = report.loaded,
            missing = report.missing.len(),
            "loaded teacher weights"
        );
        Ok((teacher, report))
    }

    pub fn layout(&self) -> InputLayout {
        self.layout
    }

    pub fn phase(&self) -> TeacherPhase {
        self.phase
    }

    pub fn has_neck(&self) -> bool {
        self.parts.neck.is_some()
    }

    pub fn fusion_module_levels(&self) -> &[usize] {
        &self.parts.fusion_module_levels
    }

    /// Switch every module to eval on the first call; returns whether this call did the switch.
    pub fn ensure_eval(&mut self) -> bool {
        if self.phase == TeacherPhase::Ready {
            return false;
        }
        let parts = &mut self.parts;
        parts.backbone.set_mode(ModuleMode::Eval);
        parts.backbone_ir.set_mode(ModuleMode::Eval);
        if let Some(neck) = parts.neck.as_mut() {
            neck.set_mode(ModuleMode::Eval);
        }
        if let Some(neck) = parts.neck_ir.as_mut() {
            neck.set_mode(ModuleMode::Eval);
        }
        parts.fusion_conv.set_mode(ModuleMode::Eval);
        parts.fusion_module.set_mode(ModuleMode::Eval);
        self.phase = TeacherPhase::Ready;
        debug!("teacher switched to eval mode");
        true
    }

    /// Teacher RGB and IR pyramids, detached from the autodiff graph.
    pub fn extract_feat(
        &self,
        image: &Tensor<B, 4>,
    ) -> DetectorResult<(FeaturePyramid<B>, FeaturePyramid<B>)> {
        let (rgb, ir) = self.layout.split(image)?;
        let n = self.layout.num_levels;
        let rgb = extract_stream(
            self.parts.backbone.as_ref(),
            self.parts.neck.as_deref(),
            rgb.detach(),
            Stream::Rgb,
            n,
        )?;
        let ir = extract_stream(
            self.parts.backbone_ir.as_ref(),
            self.parts.neck_ir.as_deref(),
            ir.detach(),
            Stream::Ir,
            n,
        )?;
        Ok((rgb.detached(), ir.detached()))
    }

    /// Per-level fusion with `fusion_module` on its levels and `fusion_conv` elsewhere.
    pub fn fused_pyramid(
        &self,
        rgb: &FeaturePyramid<B>,
        ir: &FeaturePyramid<B>,
    ) -> DetectorResult<FeaturePyramid<B>> {
        let n = self.layout.num_levels;
        rgb.expect_levels(n)?;
        ir.expect_levels(n)?;
        let levels = rgb
            .levels
            .iter()
            .zip(&ir.levels)
            .enumerate()
            .map(|(i, (x, x_ir))| {
                let op = if self.parts.fusion_module_levels.contains(&i) {
                    self.parts.fusion_module.as_ref()
                } else {
                    self.parts.fusion_conv.as_ref()
                };
                op.fuse(x.clone(), x_ir.clone())
            })
            .collect::<DetectorResult<Vec<_>>>()?;
        Ok(FeaturePyramid::new(Stream::Fused, levels).detached())
    }

    /// Parameters in teacher-checkpoint layout (`backbone.`, `backbone_ir.`, ...).
    pub fn state_dict(&self) -> DetectorResult<StateDict> {
        let parts = &self.parts;
        let mut out = StateDict::new();
        component_state(parts.backbone.as_ref(), "backbone.", &mut out)?;
        component_state(parts.backbone_ir.as_ref(), "backbone_ir.", &mut out)?;
        if let Some(neck) = parts.neck.as_deref() {
            component_state(neck, "neck.", &mut out)?;
        }
        if let Some(neck) = parts.neck_ir.as_deref() {
            component_state(neck, "neck_ir.", &mut out)?;
        }
        component_state(parts.fusion_conv.as_ref(), "fusion_conv.", &mut out)?;
        component_state(parts.fusion_module.as_ref(), "fusion_module.", &mut out)?;
        Ok(out)
    }

    /// Load each module from the keys under its prefix.
    ///
    /// Keys outside [`TEACHER_PREFIXES`] (heads, student-only modules) are ignored. In
    /// [`LoadMode::Strict`] a missing key fails the load before any module is touched; a
    /// wrong shape fails it in either mode.
    pub fn load_checkpoint(
        &mut self,
        state: &StateDict,
        mode: LoadMode,
    ) -> DetectorResult<LoadReport> {
        let expected = self.state_dict()?;
        let scoped: StateDict = state
            .iter()
            .filter(|(k, _)| TEACHER_PREFIXES.iter().any(|p| k.starts_with(p)))
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        let (missing, unexpected) = diff_keys(&expected, &scoped);
        if mode == LoadMode::Strict && !missing.is_empty() {
            return Err(DetectorError::CheckpointKeyMismatch {
                missing,
                unexpected,
            });
        }
        if !unexpected.is_empty() {
            warn!(keys = ?unexpected, "unexpected keys in teacher checkpoint");
        }
        check_shapes(&expected, &scoped)?;

        let parts = &mut self.parts;
        let mut absent = Vec::new();
        load_component(parts.backbone.as_mut(), "backbone.", &scoped, &mut absent)?;
        load_component(
            parts.backbone_ir.as_mut(),
            "backbone_ir.",
            &scoped,
            &mut absent,
        )?;
        if let Some(neck) = parts.neck.as_deref_mut() {
            load_component(neck, "neck.", &scoped, &mut absent)?;
        }
        if let Some(neck) = parts.neck_ir.as_deref_mut() {
            load_component(neck, "neck_ir.", &scoped, &mut absent)?;
        }
        load_component(
            parts.fusion_conv.as_mut(),
            "fusion_conv.",
            &scoped,
            &mut absent,
        )?;
        load_component(
            parts.fusion_module.as_mut(),
            "fusion_module.",
            &scoped,
            &mut absent,
        )?;

        Ok(LoadReport {
            loaded: expected.len() - missing.len(),
            missing: absent,
            unexpected,
            fired_rules: Vec::new(),
        })
    }
}
