//! Burn modules for the dual-stream (RGB + thermal) detector.
//!
//! This crate defines the convolutional building blocks used by the detector:
//! - `PyramidBackbone`: strided-conv feature extractor producing a multi-level pyramid.
//! - `LateralNeck`: FPN-style refiner mapping every level to a common channel count.
//! - `DepthwiseFusion`: depthwise-then-pointwise conv merging two concatenated streams.
//!
//! These are pure Burn Modules with no awareness of the detector stage traits. The
//! `detector` crate wraps them into `Backbone`/`Neck`/`FusionOp` implementations.

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::tensor::activation::{relu, silu};
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use burn::tensor::Tensor;

#[derive(Debug, Clone)]
pub struct PyramidBackboneConfig {
    pub in_channels: usize,
    pub base_channels: usize,
    pub num_stages: usize,
}

impl Default for PyramidBackboneConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            base_channels: 16,
            num_stages: 4,
        }
    }
}

impl PyramidBackboneConfig {
    /// Channel count produced by each stage, shallowest first.
    pub fn stage_channels(&self) -> Vec<usize> {
        (0..self.num_stages.max(1))
            .map(|i| self.base_channels.max(1) << i)
            .collect()
    }
}

#[derive(Debug, Module)]
pub struct PyramidBackbone<B: burn::tensor::backend::Backend> {
    pub stem: Conv2d<B>,
    pub stages: Vec<Conv2d<B>>,
}

impl<B: burn::tensor::backend::Backend> PyramidBackbone<B> {
    pub fn new(cfg: PyramidBackboneConfig, device: &B::Device) -> Self {
        let base = cfg.base_channels.max(1);
        let stem = Conv2dConfig::new([cfg.in_channels.max(1), base], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let mut stages = Vec::new();
        let mut prev = base;
        for (i, out) in cfg.stage_channels().into_iter().enumerate() {
            let stride = if i == 0 { 1 } else { 2 };
            stages.push(
                Conv2dConfig::new([prev, out], [3, 3])
                    .with_stride([stride, stride])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device),
            );
            prev = out;
        }
        Self { stem, stages }
    }

    /// Returns one feature map per stage, shallowest (highest resolution) first.
    pub fn forward(&self, input: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut x = relu(self.stem.forward(input));
        let mut outs = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            x = relu(stage.forward(x));
            outs.push(x.clone());
        }
        outs
    }
}

#[derive(Debug, Clone)]
pub struct LateralNeckConfig {
    pub in_channels: Vec<usize>,
    pub out_channels: usize,
    pub num_outs: usize,
}

impl Default for LateralNeckConfig {
    fn default() -> Self {
        Self {
            in_channels: PyramidBackboneConfig::default().stage_channels(),
            out_channels: 256,
            num_outs: 5,
        }
    }
}

#[derive(Debug, Module)]
pub struct LateralNeck<B: burn::tensor::backend::Backend> {
    pub laterals: Vec<Conv2d<B>>,
    pub extra: Vec<Conv2d<B>>,
}

impl<B: burn::tensor::backend::Backend> LateralNeck<B> {
    pub fn new(cfg: LateralNeckConfig, device: &B::Device) -> Self {
        let out = cfg.out_channels.max(1);
        let laterals = cfg
            .in_channels
            .iter()
            .map(|&c| Conv2dConfig::new([c.max(1), out], [1, 1]).init(device))
            .collect::<Vec<_>>();
        let extra = (laterals.len()..cfg.num_outs)
            .map(|_| {
                Conv2dConfig::new([out, out], [3, 3])
                    .with_stride([2, 2])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device)
            })
            .collect();
        Self { laterals, extra }
    }

    /// Top-down merge of lateral projections, then extra stride-2 levels on the coarsest output.
    pub fn forward(&self, inputs: Vec<Tensor<B, 4>>) -> Vec<Tensor<B, 4>> {
        let mut outs: Vec<Tensor<B, 4>> = self
            .laterals
            .iter()
            .zip(inputs)
            .map(|(conv, x)| conv.forward(x))
            .collect();
        for i in (0..outs.len().saturating_sub(1)).rev() {
            let [_, _, h, w] = outs[i].dims();
            let up = interpolate(
                outs[i + 1].clone(),
                [h, w],
                InterpolateOptions::new(InterpolateMode::Nearest),
            );
            outs[i] = outs[i].clone() + up;
        }
        for conv in &self.extra {
            if let Some(last) = outs.last().cloned() {
                outs.push(conv.forward(relu(last)));
            }
        }
        outs
    }
}

#[derive(Debug, Clone)]
pub struct DepthwiseFusionConfig {
    /// Channels of each input stream; the fused output has the same count.
    pub channels: usize,
    pub kernel_size: usize,
}

impl Default for DepthwiseFusionConfig {
    fn default() -> Self {
        Self {
            channels: 256,
            kernel_size: 3,
        }
    }
}

#[derive(Debug, Module)]
pub struct DepthwiseFusion<B: burn::tensor::backend::Backend> {
    pub depthwise: Conv2d<B>,
    pub pointwise: Conv2d<B>,
}

impl<B: burn::tensor::backend::Backend> DepthwiseFusion<B> {
    pub fn new(cfg: DepthwiseFusionConfig, device: &B::Device) -> Self {
        let joint = cfg.channels.max(1) * 2;
        let k = cfg.kernel_size.max(1);
        let depthwise = Conv2dConfig::new([joint, joint], [k, k])
            .with_groups(joint)
            .with_padding(PaddingConfig2d::Explicit(k / 2, k / 2))
            .init(device);
        let pointwise = Conv2dConfig::new([joint, cfg.channels.max(1)], [1, 1]).init(device);
        Self {
            depthwise,
            pointwise,
        }
    }

    /// Input is the channel-wise concatenation `[N, 2C, H, W]`; output is `[N, C, H, W]`.
    pub fn forward(&self, joint: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = silu(self.depthwise.forward(joint));
        silu(self.pointwise.forward(x))
    }
}

pub mod prelude {
    pub use super::{
        DepthwiseFusion, DepthwiseFusionConfig, LateralNeck, LateralNeckConfig, PyramidBackbone,
        PyramidBackboneConfig,
    };
}
