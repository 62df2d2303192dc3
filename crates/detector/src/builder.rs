//! Assemble a [`DualStreamDetector`] from a [`DetectorConfig`] and a [`ModelRegistry`].

use crate::config::{DetectorConfig, DistillLocation};
use crate::detector::{DetectorParts, DualStreamDetector};
use crate::distill::DistillLossBank;
use crate::error::{DetectorError, DetectorResult};
use crate::registry::{BuildContext, ModelRegistry};
use crate::teacher::TeacherEnsemble;
use burn::tensor::backend::Backend;
use tracing::{info, warn};

/// Every `[[distill.methods]]` entry across all locations, in configuration order.
pub fn build_distill_bank<B: Backend>(
    locations: &[DistillLocation],
    registry: &ModelRegistry<B>,
    ctx: &BuildContext<B>,
) -> DetectorResult<DistillLossBank<B>> {
    let mut bank = DistillLossBank::new(ctx.layout.num_levels);
    for method in locations.iter().flat_map(|loc| &loc.methods) {
        let loss = registry.build_distill_loss(&method.component, ctx)?;
        bank.push(method.name.clone(), loss)?;
    }
    Ok(bank)
}

impl<B: Backend> DualStreamDetector<B> {
    /// Build every stage from `cfg`; loads the teacher when `teacher_cfg` is set.
    pub fn from_config(
        cfg: &DetectorConfig,
        registry: &ModelRegistry<B>,
        device: &B::Device,
    ) -> DetectorResult<Self> {
        cfg.validate()?;
        let model = &cfg.model;
        let layout = model.layout;
        let ctx = BuildContext::<B>::new(device.clone(), layout);

        let rgb_ctx = ctx.with_in_channels(layout.rgb_channels);
        let ir_ctx = ctx.with_in_channels(layout.ir_channels());
        let backbone = registry.build_backbone(&model.backbone, &rgb_ctx)?;
        let backbone_ir = registry.build_backbone(&model.backbone, &ir_ctx)?;
        let fusion = registry.build_fusion(&model.fusion, &ctx)?;
        let mut parts = DetectorParts::new(layout, backbone, backbone_ir, fusion)
            .proposal_cfg(cfg.proposal_config());

        if let Some(neck) = &model.neck {
            parts = parts.necks(
                registry.build_neck(neck, &ctx)?,
                registry.build_neck(neck, &ctx)?,
            );
        }
        if let Some(head) = cfg.rpn_head()? {
            parts = parts.rpn_head(registry.build_proposal_stage(&head, &ctx)?);
        }
        if let Some(head) = cfg.roi_head() {
            parts = parts.roi_head(registry.build_roi_stage(&head, &ctx)?);
        }

        match (&cfg.teacher_cfg, &cfg.teacher_pretrained) {
            (Some(teacher_cfg), Some(pretrained)) => {
                let (teacher, _) = TeacherEnsemble::load(
                    teacher_cfg,
                    pretrained,
                    registry,
                    device,
                    cfg.teacher_load,
                )?;
                let bank = build_distill_bank(&cfg.distill, registry, &ctx)?;
                info!(losses = ?bank.names().collect::<Vec<_>>(), "distillation enabled");
                parts = parts.distillation(teacher, bank);
            }
            (None, None) => {
                if !cfg.distill.is_empty() {
                    warn!("distill methods are configured without a teacher; they are ignored");
                }
            }
            _ => {
                return Err(DetectorError::Config(
                    "teacher_cfg and teacher_pretrained must be set together".into(),
                ));
            }
        }

        Self::from_parts(parts)
    }
}
