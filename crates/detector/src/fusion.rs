//! Per-level fusion of the RGB and thermal pyramids.

use crate::error::{DetectorError, DetectorResult};
use crate::pyramid::{FeaturePyramid, Stream};
use crate::stages::{Component, FusionOp};
use crate::state::{conv2d_state, load_conv2d, StateDict};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use models::{DepthwiseFusion, DepthwiseFusionConfig};
use serde::Deserialize;

/// Channel-wise concatenation `[N, C, H, W] ++ [N, C, H, W] -> [N, 2C, H, W]`.
///
/// Shapes must agree exactly; nothing is broadcast.
pub fn concat_streams<B: Backend>(
    rgb: Tensor<B, 4>,
    ir: Tensor<B, 4>,
) -> DetectorResult<Tensor<B, 4>> {
    let (a, b) = (rgb.dims(), ir.dims());
    if a != b {
        return Err(DetectorError::shape("fusion inputs", &a, &b));
    }
    Ok(Tensor::cat(vec![rgb, ir], 1))
}

/// Fuse level `i` of `rgb` with level `i` of `ir` for every one of `num_levels` levels.
pub fn fuse_pyramid<B: Backend>(
    op: &dyn FusionOp<B>,
    rgb: &FeaturePyramid<B>,
    ir: &FeaturePyramid<B>,
    num_levels: usize,
) -> DetectorResult<FeaturePyramid<B>> {
    rgb.expect_levels(num_levels)?;
    ir.expect_levels(num_levels)?;
    let levels = rgb
        .levels
        .iter()
        .zip(&ir.levels)
        .map(|(x, x_ir)| op.fuse(x.clone(), x_ir.clone()))
        .collect::<DetectorResult<Vec<_>>>()?;
    Ok(FeaturePyramid::new(Stream::Fused, levels))
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DwConvFusionOptions {
    #[serde(default = "default_channels")]
    pub channels: usize,
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,
}

fn default_channels() -> usize {
    256
}

fn default_kernel_size() -> usize {
    3
}

impl Default for DwConvFusionOptions {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            kernel_size: default_kernel_size(),
        }
    }
}

/// Depthwise-then-pointwise conv fusion (2C -> C).
pub struct DwConvFusion<B: Backend> {
    inner: DepthwiseFusion<B>,
    channels: usize,
}

impl<B: Backend> DwConvFusion<B> {
    pub fn new(options: DwConvFusionOptions, device: &B::Device) -> Self {
        let inner = DepthwiseFusion::new(
            DepthwiseFusionConfig {
                channels: options.channels,
                kernel_size: options.kernel_size,
            },
            device,
        );
        Self {
            inner,
            channels: options.channels,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }
}

impl<B: Backend> Component for DwConvFusion<B> {
    fn state_dict(&self) -> DetectorResult<StateDict> {
        let mut out = StateDict::new();
        conv2d_state(&self.inner.depthwise, "depthwise.", &mut out)?;
        conv2d_state(&self.inner.pointwise, "pointwise.", &mut out)?;
        Ok(out)
    }

    fn load_state_dict(&mut self, params: &StateDict) -> DetectorResult<Vec<String>> {
        let mut missing = Vec::new();
        let inner = &mut self.inner;
        load_conv2d(&mut inner.depthwise, "depthwise.", params, &mut missing)?;
        load_conv2d(&mut inner.pointwise, "pointwise.", params, &mut missing)?;
        Ok(missing)
    }
}

impl<B: Backend> FusionOp<B> for DwConvFusion<B> {
    fn fuse(&self, rgb: Tensor<B, 4>, ir: Tensor<B, 4>) -> DetectorResult<Tensor<B, 4>> {
        let channels = rgb.dims()[1];
        let joint = concat_streams(rgb, ir)?;
        if channels != self.channels {
            return Err(DetectorError::shape(
                "fusion input channels",
                &[channels],
                &[self.channels],
            ));
        }
        Ok(self.inner.forward(joint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    fn fusion(channels: usize) -> DwConvFusion<B> {
        DwConvFusion::new(
            DwConvFusionOptions {
                channels,
                kernel_size: 3,
            },
            &Default::default(),
        )
    }

    #[test]
    fn spatial_mismatch_is_rejected() {
        let device = Default::default();
        let a = Tensor::<B, 4>::zeros([1, 8, 32, 32], &device);
        let b = Tensor::<B, 4>::zeros([1, 8, 16, 16], &device);
        let err = fusion(8).fuse(a, b).unwrap_err();
        match err {
            DetectorError::ShapeMismatch { left, right, .. } => {
                assert_eq!(left, vec![1, 8, 32, 32]);
                assert_eq!(right, vec![1, 8, 16, 16]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn wrong_channel_count_is_rejected() {
        let device = Default::default();
        let a = Tensor::<B, 4>::zeros([1, 4, 8, 8], &device);
        let b = Tensor::<B, 4>::zeros([1, 4, 8, 8], &device);
        assert!(fusion(8).fuse(a, b).is_err());
    }

    #[test]
    fn state_dict_names_both_convs() {
        let state = fusion(2).state_dict().unwrap();
        let keys: Vec<&str> = state.keys().collect();
        assert_eq!(
            keys,
            vec![
                "depthwise.bias",
                "depthwise.weight",
                "pointwise.bias",
                "pointwise.weight"
            ]
        );
        let shape = |key: &str| state.get(key).unwrap().shape.clone();
        assert_eq!(shape("depthwise.weight"), vec![4, 1, 3, 3]);
        assert_eq!(shape("pointwise.weight"), vec![2, 4, 1, 1]);
    }
}
