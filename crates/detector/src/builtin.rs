//! Stage adapters over the `models` crate.

use crate::error::{DetectorError, DetectorResult};
use crate::stages::{Backbone, Component, Neck};
use crate::state::{conv2d_state, load_conv2d, StateDict};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use models::{LateralNeck, LateralNeckConfig, PyramidBackbone, PyramidBackboneConfig};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PyramidConvOptions {
    #[serde(default = "default_base_channels")]
    pub base_channels: usize,
    #[serde(default = "default_num_stages")]
    pub num_stages: usize,
}

fn default_base_channels() -> usize {
    16
}

fn default_num_stages() -> usize {
    4
}

pub struct PyramidConvBackbone<B: Backend> {
    inner: PyramidBackbone<B>,
    in_channels: usize,
}

impl<B: Backend> PyramidConvBackbone<B> {
    pub fn new(options: PyramidConvOptions, in_channels: usize, device: &B::Device) -> Self {
        let inner = PyramidBackbone::new(
            PyramidBackboneConfig {
                in_channels,
                base_channels: options.base_channels,
                num_stages: options.num_stages,
            },
            device,
        );
        Self { inner, in_channels }
    }
}

impl<B: Backend> Component for PyramidConvBackbone<B> {
    fn state_dict(&self) -> DetectorResult<StateDict> {
        let mut out = StateDict::new();
        conv2d_state(&self.inner.stem, "stem.", &mut out)?;
        for (i, stage) in self.inner.stages.iter().enumerate() {
            conv2d_state(stage, &format!("stages.{i}."), &mut out)?;
        }
        Ok(out)
    }

    fn load_state_dict(&mut self, params: &StateDict) -> DetectorResult<Vec<String>> {
        let mut missing = Vec::new();
        load_conv2d(&mut self.inner.stem, "stem.", params, &mut missing)?;
        for (i, stage) in self.inner.stages.iter_mut().enumerate() {
            load_conv2d(stage, &format!("stages.{i}."), params, &mut missing)?;
        }
        Ok(missing)
    }
}

impl<B: Backend> Backbone<B> for PyramidConvBackbone<B> {
    fn forward(&self, image: Tensor<B, 4>) -> DetectorResult<Vec<Tensor<B, 4>>> {
        let channels = image.dims()[1];
        if channels != self.in_channels {
            return Err(DetectorError::shape(
                "backbone input channels",
                &[channels],
                &[self.in_channels],
            ));
        }
        Ok(self.inner.forward(image))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LateralFpnOptions {
    pub in_channels: Vec<usize>,
    #[serde(default = "default_out_channels")]
    pub out_channels: usize,
    #[serde(default = "default_num_outs")]
    pub num_outs: usize,
}

fn default_out_channels() -> usize {
    256
}

fn default_num_outs() -> usize {
    5
}

pub struct LateralFpnNeck<B: Backend> {
    inner: LateralNeck<B>,
    num_inputs: usize,
}

impl<B: Backend> LateralFpnNeck<B> {
    pub fn new(options: LateralFpnOptions, device: &B::Device) -> DetectorResult<Self> {
        if options.in_channels.is_empty() {
            return Err(DetectorError::Config(
                "lateral_fpn neck needs at least one input level".into(),
            ));
        }
        if options.num_outs < options.in_channels.len() {
            return Err(DetectorError::Config(format!(
                "lateral_fpn num_outs ({}) is below its input level count ({})",
                options.num_outs,
                options.in_channels.len()
            )));
        }
        let num_inputs = options.in_channels.len();
        let inner = LateralNeck::new(
            LateralNeckConfig {
                in_channels: options.in_channels,
                out_channels: options.out_channels,
                num_outs: options.num_outs,
            },
            device,
        );
        Ok(Self { inner, num_inputs })
    }
}

impl<B: Backend> Component for LateralFpnNeck<B> {
    fn state_dict(&self) -> DetectorResult<StateDict> {
        let mut out = StateDict::new();
        for (i, conv) in self.inner.laterals.iter().enumerate() {
            conv2d_state(conv, &format!("laterals.{i}."), &mut out)?;
        }
        for (i, conv) in self.inner.extra.iter().enumerate() {
            conv2d_state(conv, &format!("extra.{i}."), &mut out)?;
        }
        Ok(out)
    }

    fn load_state_dict(&mut self, params: &StateDict) -> DetectorResult<Vec<String>> {
        let mut missing = Vec::new();
        for (i, conv) in self.inner.laterals.iter_mut().enumerate() {
            load_conv2d(conv, &format!("laterals.{i}."), params, &mut missing)?;
        }
        for (i, conv) in self.inner.extra.iter_mut().enumerate() {
            load_conv2d(conv, &format!("extra.{i}."), params, &mut missing)?;
        }
        Ok(missing)
    }
}

impl<B: Backend> Neck<B> for LateralFpnNeck<B> {
    fn forward(&self, levels: Vec<Tensor<B, 4>>) -> DetectorResult<Vec<Tensor<B, 4>>> {
        if levels.len() != self.num_inputs {
            return Err(DetectorError::shape(
                "neck input level count",
                &[levels.len()],
                &[self.num_inputs],
            ));
        }
        Ok(self.inner.forward(levels))
    }
}
