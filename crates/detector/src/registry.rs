//! Startup factory table: component kind strings to constructors, one table per stage family.

use crate::builtin::{LateralFpnNeck, PyramidConvBackbone};
use crate::config::ComponentConfig;
use crate::distill::{FeatureMseLoss, FgBgMseLoss};
use crate::error::{DetectorError, DetectorResult};
use crate::fusion::DwConvFusion;
use crate::pyramid::InputLayout;
use crate::stages::{Backbone, DistillLoss, FusionOp, Neck, ProposalStage, RoiStage};
use burn::tensor::backend::Backend;
use std::collections::BTreeMap;

/// What a constructor knows besides its own options.
#[derive(Debug, Clone)]
pub struct BuildContext<B: Backend> {
    pub device: B::Device,
    /// Channels the component consumes; per stream for backbones.
    pub in_channels: usize,
    pub layout: InputLayout,
}

impl<B: Backend> BuildContext<B> {
    pub fn new(device: B::Device, layout: InputLayout) -> Self {
        Self {
            device,
            in_channels: layout.in_channels,
            layout,
        }
    }

    pub fn with_in_channels(&self, in_channels: usize) -> Self {
        Self {
            in_channels,
            ..self.clone()
        }
    }
}

type Ctor<B, T> = Box<dyn Fn(&ComponentConfig, &BuildContext<B>) -> DetectorResult<Box<T>>>;

struct Factory<B: Backend, T: ?Sized> {
    family: &'static str,
    ctors: BTreeMap<String, Ctor<B, T>>,
}

impl<B: Backend, T: ?Sized> Factory<B, T> {
    fn new(family: &'static str) -> Self {
        Self {
            family,
            ctors: BTreeMap::new(),
        }
    }

    fn register(&mut self, kind: &str, ctor: Ctor<B, T>) {
        self.ctors.insert(kind.to_string(), ctor);
    }

    fn build(&self, cfg: &ComponentConfig, ctx: &BuildContext<B>) -> DetectorResult<Box<T>> {
        let ctor = self
            .ctors
            .get(&cfg.kind)
            .ok_or_else(|| DetectorError::UnknownComponent {
                kind: self.family,
                name: cfg.kind.clone(),
                registered: self.kinds(),
            })?;
        ctor(cfg, ctx)
    }

    fn kinds(&self) -> Vec<String> {
        self.ctors.keys().cloned().collect()
    }
}

pub struct ModelRegistry<B: Backend> {
    backbones: Factory<B, dyn Backbone<B>>,
    necks: Factory<B, dyn Neck<B>>,
    fusions: Factory<B, dyn FusionOp<B>>,
    proposal_stages: Factory<B, dyn ProposalStage<B>>,
    roi_stages: Factory<B, dyn RoiStage<B>>,
    distill_losses: Factory<B, dyn DistillLoss<B>>,
}

impl<B: Backend> Default for ModelRegistry<B> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<B: Backend> ModelRegistry<B> {
    pub fn empty() -> Self {
        Self {
            backbones: Factory::new("backbone"),
            necks: Factory::new("neck"),
            fusions: Factory::new("fusion"),
            proposal_stages: Factory::new("proposal stage"),
            roi_stages: Factory::new("roi stage"),
            distill_losses: Factory::new("distill loss"),
        }
    }

    /// Registry with the built-in backbone, neck, fusion and distillation kinds.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register_backbone("pyramid_conv", |cfg, ctx| {
            Ok(Box::new(PyramidConvBackbone::new(cfg.options_as()?, ctx.in_channels, &ctx.device)))
        });
        registry.register_neck("lateral_fpn", |cfg, ctx| {
            Ok(Box::new(LateralFpnNeck::new(cfg.options_as()?, &ctx.device)?))
        });
        registry.register_fusion("dw_conv", |cfg, ctx| {
            Ok(Box::new(DwConvFusion::new(cfg.options_as()?, &ctx.device)))
        });
        registry.register_distill_loss("feature_mse", |cfg, _| {
            Ok(Box::new(FeatureMseLoss::new(cfg.options_as()?)))
        });
        registry.register_distill_loss("fg_bg_mse", |cfg, _| {
            Ok(Box::new(FgBgMseLoss::new(cfg.options_as()?)))
        });
        registry
    }

    pub fn register_backbone<F>(&mut self, kind: &str, ctor: F)
    where
        F: Fn(&ComponentConfig, &BuildContext<B>) -> DetectorResult<Box<dyn Backbone<B>>> + 'static,
    {
        self.backbones.register(kind, Box::new(ctor));
    }

    pub fn register_neck<F>(&mut self, kind: &str, ctor: F)
    where
        F: Fn(&ComponentConfig, &BuildContext<B>) -> DetectorResult<Box<dyn Neck<B>>> + 'static,
    {
        self.necks.register(kind, Box::new(ctor));
    }

    pub fn register_fusion<F>(&mut self, kind: &str, ctor: F)
    where
        F: Fn(&ComponentConfig, &BuildContext<B>) -> DetectorResult<Box<dyn FusionOp<B>>> + 'static,
    {
        self.fusions.register(kind, Box::new(ctor));
    }

    pub fn register_proposal_stage<F>(&mut self, kind: &str, ctor: F)
    where
        F: Fn(&ComponentConfig, &BuildContext<B>) -> DetectorResult<Box<dyn ProposalStage<B>>>
            + 'static,
    {
        self.proposal_stages.register(kind, Box::new(ctor));
    }

    pub fn register_roi_stage<F>(&mut self, kind: &str, ctor: F)
    where
        F: Fn(&ComponentConfig, &BuildContext<B>) -> DetectorResult<Box<dyn RoiStage<B>>> + 'static,
    {
        self.roi_stages.register(kind, Box::new(ctor));
    }

    pub fn register_distill_loss<F>(&mut self, kind: &str, ctor: F)
    where
        F: Fn(&ComponentConfig, &BuildContext<B>) -> DetectorResult<Box<dyn DistillLoss<B>>>
            + 'static,
    {
        self.distill_losses.register(kind, Box::new(ctor));
    }

    pub fn build_backbone(
        &self,
        cfg: &ComponentConfig,
        ctx: &BuildContext<B>,
    ) -> DetectorResult<Box<dyn Backbone<B>>> {
        self.backbones.build(cfg, ctx)
    }

    pub fn build_neck(
        &self,
        cfg: &ComponentConfig,
        ctx: &BuildContext<B>,
    ) -> DetectorResult<Box<dyn Neck<B>>> {
        self.necks.build(cfg, ctx)
    }

    pub fn build_fusion(
        &self,
        cfg: &ComponentConfig,
        ctx: &BuildContext<B>,
    ) -> DetectorResult<Box<dyn FusionOp<B>>> {
        self.fusions.build(cfg, ctx)
    }

    pub fn build_proposal_stage(
        &self,
        cfg: &ComponentConfig,
        ctx: &BuildContext<B>,
    ) -> DetectorResult<Box<dyn ProposalStage<B>>> {
        self.proposal_stages.build(cfg, ctx)
    }

    pub fn build_roi_stage(
        &self,
        cfg: &ComponentConfig,
        ctx: &BuildContext<B>,
    ) -> DetectorResult<Box<dyn RoiStage<B>>> {
        self.roi_stages.build(cfg, ctx)
    }

    pub fn build_distill_loss(
        &self,
        cfg: &ComponentConfig,
        ctx: &BuildContext<B>,
    ) -> DetectorResult<Box<dyn DistillLoss<B>>> {
        self.distill_losses.build(cfg, ctx)
    }

    /// Registered kinds per stage family.
    pub fn kinds(&self) -> BTreeMap<&'static str, Vec<String>> {
        BTreeMap::from([
            (self.backbones.family, self.backbones.kinds()),
            (self.necks.family, self.necks.kinds()),
            (self.fusions.family, self.fusions.kinds()),
            (self.proposal_stages.family, self.proposal_stages.kinds()),
            (self.roi_stages.family, self.roi_stages.kinds()),
            (self.distill_losses.family, self.distill_losses.kinds()),
        ])
    }
}
