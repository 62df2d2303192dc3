//! Feature distillation losses and the bank that routes pyramids into them.

use crate::error::{DetectorError, DetectorResult};
use crate::losses::LossMap;
use crate::pyramid::{FeaturePyramid, Stream};
use crate::sample::DataSample;
use crate::stages::{Component, DistillLoss, ModuleMode};
use crate::state::{component_state, load_component, StateDict};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use serde::Deserialize;

/// Pyramid and level a distillation loss compares, decoded from the loss name.
///
/// `loss_fgd_ir_3` reads the thermal pyramid at level 3, `loss_mse_fused_0` the fused
/// pyramid at level 0, and anything without a stream token the RGB pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistillTarget {
    pub stream: Stream,
    pub level: usize,
}

impl DistillTarget {
    pub fn parse(name: &str, num_levels: usize) -> DetectorResult<Self> {
        let invalid = |why: &str| {
            DetectorError::Config(format!("distill loss name `{name}` {why}"))
        };
        let (head, digits) = name
            .rsplit_once('_')
            .ok_or_else(|| invalid("must end in `_<level>`"))?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("must end in `_<level>`"));
        }
        let level: usize = digits
            .parse()
            .map_err(|_| invalid("has an unparsable level"))?;
        if level >= num_levels {
            return Err(invalid(&format!(
                "targets level {level} but the pyramid has {num_levels} levels"
            )));
        }
        let tokens: Vec<&str> = head.split('_').collect();
        let stream = if tokens.contains(&"fused") {
            Stream::Fused
        } else if tokens.contains(&"ir") {
            Stream::Ir
        } else {
            Stream::Rgb
        };
        Ok(Self { stream, level })
    }
}

/// Borrowed pyramids one side of the distillation pass can offer.
pub struct DistillFeatures<'a, B: Backend> {
    pub rgb: &'a FeaturePyramid<B>,
    pub ir: &'a FeaturePyramid<B>,
    pub fused: Option<&'a FeaturePyramid<B>>,
}

impl<'a, B: Backend> DistillFeatures<'a, B> {
    pub fn select(&self, stream: Stream) -> DetectorResult<&'a FeaturePyramid<B>> {
        match stream {
            Stream::Rgb => Ok(self.rgb),
            Stream::Ir => Ok(self.ir),
            Stream::Fused => self.fused.ok_or_else(|| {
                DetectorError::Precondition("fused pyramid requested but not computed".into())
            }),
        }
    }
}

pub struct DistillEntry<B: Backend> {
    pub name: String,
    pub target: DistillTarget,
    pub loss: Box<dyn DistillLoss<B>>,
}

/// Loss name to computator, in configuration order. Built once, reused for every batch.
pub struct DistillLossBank<B: Backend> {
    entries: Vec<DistillEntry<B>>,
    num_levels: usize,
}

impl<B: Backend> DistillLossBank<B> {
    pub fn new(num_levels: usize) -> Self {
        Self {
            entries: Vec::new(),
            num_levels,
        }
    }

    pub fn push(
        &mut self,
        name: impl Into<String>,
        loss: Box<dyn DistillLoss<B>>,
    ) -> DetectorResult<()> {
        let name = name.into();
        if self.entries.iter().any(|e| e.name == name) {
            return Err(DetectorError::Config(format!("duplicate distill loss `{name}`")));
        }
        let target = DistillTarget::parse(&name, self.num_levels)?;
        self.entries.push(DistillEntry { name, target, loss });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn num_levels(&self) -> usize {
        self.num_levels
    }

    pub fn entries(&self) -> impl Iterator<Item = &DistillEntry<B>> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn needs_fused(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.target.stream == Stream::Fused)
    }

    pub fn compute(
        &self,
        student: &DistillFeatures<'_, B>,
        teacher: &DistillFeatures<'_, B>,
        samples: &[DataSample],
    ) -> DetectorResult<LossMap<B>> {
        let mut losses = LossMap::new();
        for entry in &self.entries {
            let DistillTarget { stream, level } = entry.target;
            let s = student.select(stream)?.level(level)?;
            let t = teacher.select(stream)?.level(level)?;
            if s.dims() != t.dims() {
                return Err(DetectorError::shape(
                    format!("distill loss `{}`", entry.name),
                    &s.dims(),
                    &t.dims(),
                ));
            }
            losses.insert(entry.name.clone(), entry.loss.compute(s, t, samples)?);
        }
        Ok(losses)
    }

    /// Parameters of every computator under `<name>.`.
    pub fn state_dict(&self) -> DetectorResult<StateDict> {
        let mut out = StateDict::new();
        for entry in &self.entries {
            component_state(entry.loss.as_ref(), &format!("{}.", entry.name), &mut out)?;
        }
        Ok(out)
    }

    pub fn load_state_dict(&mut self, params: &StateDict) -> DetectorResult<Vec<String>> {
        let mut missing = Vec::new();
        for entry in &mut self.entries {
            let prefix = format!("{}.", entry.name);
            load_component(entry.loss.as_mut(), &prefix, params, &mut missing)?;
        }
        Ok(missing)
    }

    pub fn set_mode(&mut self, mode: ModuleMode) {
        for entry in &mut self.entries {
            entry.loss.set_mode(mode);
        }
    }
}

fn default_weight() -> f32 {
    1.0
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureMseOptions {
    #[serde(default = "default_weight")]
    pub weight: f32,
}

impl Default for FeatureMseOptions {
    fn default() -> Self {
        Self {
            weight: default_weight(),
        }
    }
}

/// `weight * mean((student - teacher)^2)`
#[derive(Debug, Clone)]
pub struct FeatureMseLoss {
    weight: f32,
}

impl FeatureMseLoss {
    pub fn new(options: FeatureMseOptions) -> Self {
        Self {
            weight: options.weight,
        }
    }
}

impl Component for FeatureMseLoss {
    fn state_dict(&self) -> DetectorResult<StateDict> {
        Ok(StateDict::new())
    }

    fn load_state_dict(&mut self, _params: &StateDict) -> DetectorResult<Vec<String>> {
        Ok(Vec::new())
    }
}

impl<B: Backend> DistillLoss<B> for FeatureMseLoss {
    fn compute(
        &self,
        student: Tensor<B, 4>,
        teacher: Tensor<B, 4>,
        _samples: &[DataSample],
    ) -> DetectorResult<Tensor<B, 1>> {
        let diff = student - teacher;
        Ok((diff.clone() * diff).mean().mul_scalar(self.weight))
    }
}

fn default_alpha_fg() -> f32 {
    0.001
}

fn default_beta_bg() -> f32 {
    0.0005
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FgBgMseOptions {
    #[serde(default = "default_alpha_fg")]
    pub alpha_fg: f32,
    #[serde(default = "default_beta_bg")]
    pub beta_bg: f32,
}

impl Default for FgBgMseOptions {
    fn default() -> Self {
        Self {
            alpha_fg: default_alpha_fg(),
            beta_bg: default_beta_bg(),
        }
    }
}

/// Squared error split by a ground-truth box mask, each part normalized by its own area.
#[derive(Debug, Clone)]
pub struct FgBgMseLoss {
    alpha_fg: f32,
    beta_bg: f32,
}

impl FgBgMseLoss {
    pub fn new(options: FgBgMseOptions) -> Self {
        Self {
            alpha_fg: options.alpha_fg,
            beta_bg: options.beta_bg,
        }
    }
}

/// `[N, C, H, W]` mask, 1 inside any ground-truth box projected onto the feature grid.
pub fn foreground_mask(samples: &[DataSample], dims: [usize; 4]) -> DetectorResult<Vec<f32>> {
    let [n, c, h, w] = dims;
    if samples.len() != n {
        return Err(DetectorError::Precondition(format!(
            "foreground mask needs one sample per image: {} samples for batch {n}",
            samples.len()
        )));
    }
    let mut plane = vec![0.0f32; n * h * w];
    for (i, sample) in samples.iter().enumerate() {
        let (img_h, img_w) = sample.meta.img_shape;
        let sy = h as f32 / img_h.max(1) as f32;
        let sx = w as f32 / img_w.max(1) as f32;
        for [x0, y0, x1, y1] in &sample.gt_instances.bboxes {
            let xs = ((x0 * sx).floor().max(0.0) as usize).min(w);
            let xe = ((x1 * sx).ceil().max(0.0) as usize).min(w);
            let ys = ((y0 * sy).floor().max(0.0) as usize).min(h);
            let ye = ((y1 * sy).ceil().max(0.0) as usize).min(h);
            for y in ys..ye {
                let row = i * h * w + y * w;
                plane[row + xs..row + xe.max(xs)].fill(1.0);
            }
        }
    }
    let mut mask = Vec::with_capacity(n * c * h * w);
    for i in 0..n {
        let image = &plane[i * h * w..(i + 1) * h * w];
        for _ in 0..c {
            mask.extend_from_slice(image);
        }
    }
    Ok(mask)
}

impl Component for FgBgMseLoss {
    fn state_dict(&self) -> DetectorResult<StateDict> {
        Ok(StateDict::new())
    }

    fn load_state_dict(&mut self, _params: &StateDict) -> DetectorResult<Vec<String>> {
        Ok(Vec::new())
    }
}

impl<B: Backend> DistillLoss<B> for FgBgMseLoss {
    fn compute(
        &self,
        student: Tensor<B, 4>,
        teacher: Tensor<B, 4>,
        samples: &[DataSample],
    ) -> DetectorResult<Tensor<B, 1>> {
        let dims = student.dims();
        let values = foreground_mask(samples, dims)?;
        let fg_count = values.iter().filter(|&&v| v > 0.0).count() as f32;
        let bg_count = values.len() as f32 - fg_count;
        let device = student.device();
        let fg = Tensor::<B, 4>::from_data(TensorData::new(values, dims.to_vec()), &device);
        let bg = fg.ones_like() - fg.clone();

        let diff = student - teacher;
        let sq = diff.clone() * diff;
        let fg_loss = (sq.clone() * fg).sum().div_scalar(fg_count.max(1.0));
        let bg_loss = (sq * bg).sum().div_scalar(bg_count.max(1.0));
        Ok(fg_loss.mul_scalar(self.alpha_fg) + bg_loss.mul_scalar(self.beta_bg))
    }
}
