//! Input layout and multi-level feature pyramids.

use crate::error::{DetectorError, DetectorResult};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stream {
    Rgb,
    Ir,
    Fused,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Rgb => "rgb",
            Stream::Ir => "ir",
            Stream::Fused => "fused",
        }
    }
}

/// Ordered per-level feature maps, finest level first.
#[derive(Debug, Clone)]
pub struct FeaturePyramid<B: Backend> {
    pub stream: Stream,
    pub levels: Vec<Tensor<B, 4>>,
}

impl<B: Backend> FeaturePyramid<B> {
    pub fn new(stream: Stream, levels: Vec<Tensor<B, 4>>) -> Self {
        Self { stream, levels }
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn level(&self, index: usize) -> DetectorResult<Tensor<B, 4>> {
        self.levels.get(index).cloned().ok_or_else(|| {
            DetectorError::Precondition(format!(
                "{} pyramid has {} levels, level {index} requested",
                self.stream.as_str(),
                self.levels.len()
            ))
        })
    }

    /// Same maps cut out of the autodiff graph.
    pub fn detached(self) -> Self {
        Self {
            stream: self.stream,
            levels: self.levels.into_iter().map(|t| t.detach()).collect(),
        }
    }

    pub fn expect_levels(&self, num_levels: usize) -> DetectorResult<()> {
        if self.levels.len() != num_levels {
            return Err(DetectorError::shape(
                format!("{} pyramid level count", self.stream.as_str()),
                &[self.levels.len()],
                &[num_levels],
            ));
        }
        Ok(())
    }
}

/// Channel split and pyramid depth shared by the student and teacher networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputLayout {
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    #[serde(default = "default_rgb_channels")]
    pub rgb_channels: usize,
    #[serde(default = "default_num_levels")]
    pub num_levels: usize,
}

fn default_in_channels() -> usize {
    4
}

fn default_rgb_channels() -> usize {
    3
}

fn default_num_levels() -> usize {
    5
}

impl Default for InputLayout {
    fn default() -> Self {
        Self {
            in_channels: default_in_channels(),
            rgb_channels: default_rgb_channels(),
            num_levels: default_num_levels(),
        }
    }
}

impl InputLayout {
    pub fn ir_channels(&self) -> usize {
        self.in_channels.saturating_sub(self.rgb_channels)
    }

    pub fn validate(&self) -> DetectorResult<()> {
        if self.rgb_channels == 0 {
            return Err(DetectorError::Config("rgb_channels must be at least 1".into()));
        }
        if self.in_channels <= self.rgb_channels {
            return Err(DetectorError::Config(format!(
                "in_channels ({}) must exceed rgb_channels ({}) to leave thermal channels",
                self.in_channels, self.rgb_channels
            )));
        }
        if self.num_levels == 0 {
            return Err(DetectorError::Config("num_levels must be at least 1".into()));
        }
        Ok(())
    }

    /// Split `[N, C, H, W]` into the RGB channels `[0, rgb)` and thermal channels `[rgb, C)`.
    pub fn split<B: Backend>(
        &self,
        image: &Tensor<B, 4>,
    ) -> DetectorResult<(Tensor<B, 4>, Tensor<B, 4>)> {
        let [n, c, h, w] = image.dims();
        if c != self.in_channels {
            return Err(DetectorError::shape("input image channels", &[c], &[self.in_channels]));
        }
        let rgb_end = self.rgb_channels;
        let rgb = image.clone().slice([0..n, 0..rgb_end, 0..h, 0..w]);
        let ir = image.clone().slice([0..n, rgb_end..c, 0..h, 0..w]);
        Ok((rgb, ir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn split_keeps_rgb_then_thermal() {
        let device = Default::default();
        let image = Tensor::<B, 4>::zeros([2, 4, 8, 6], &device);
        let (rgb, ir) = InputLayout::default().split(&image).unwrap();
        assert_eq!(rgb.dims(), [2, 3, 8, 6]);
        assert_eq!(ir.dims(), [2, 1, 8, 6]);
    }

    #[test]
    fn split_rejects_wrong_channel_count() {
        let device = Default::default();
        let image = Tensor::<B, 4>::zeros([1, 3, 4, 4], &device);
        let err = InputLayout::default().split(&image).unwrap_err();
        assert!(matches!(err, DetectorError::ShapeMismatch { .. }));
    }

    #[test]
    fn layout_requires_thermal_channels() {
        let layout = InputLayout {
            in_channels: 3,
            rgb_channels: 3,
            num_levels: 5,
        };
        assert!(layout.validate().is_err());
        assert!(InputLayout::default().validate().is_ok());
    }
}
