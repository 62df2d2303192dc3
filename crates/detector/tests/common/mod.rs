#![allow(dead_code)]

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use burn_ndarray::NdArray;
use detector::distill::{FeatureMseLoss, FeatureMseOptions};
use detector::fusion::{DwConvFusion, DwConvFusionOptions};
use detector::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

pub type B = NdArray<f32>;

pub const CHANNELS: usize = 4;
pub const SIZE: usize = 32;
pub const ROI_LOSS_KEYS: [&str; 3] = ["acc", "loss_bbox", "loss_cls"];

pub fn device() -> <B as Backend>::Device {
    Default::default()
}

#[derive(Debug, Clone)]
pub struct RoiLossCall {
    pub stream: Stream,
    pub levels: usize,
    pub labels: Vec<Vec<usize>>,
    pub proposals: Vec<InstanceSet>,
}

/// Everything the stub stages saw, in call order.
#[derive(Debug, Clone, Default)]
pub struct Calls {
    pub backbone: Vec<(String, usize)>,
    pub neck: Vec<String>,
    pub modes: Vec<(String, ModuleMode)>,
    pub rpn_loss: Vec<(Stream, Vec<Vec<usize>>)>,
    pub rpn_predict: Vec<(Stream, bool)>,
    pub rpn_num_classes: Vec<i64>,
    pub roi_loss: Vec<RoiLossCall>,
    pub roi_predict: Vec<(Stream, bool)>,
    pub roi_forward: usize,
    /// (fusion name, spatial height of the fused level)
    pub fusion: Vec<(String, usize)>,
}

pub type Log = Arc<Mutex<Calls>>;

pub fn new_log() -> Log {
    Arc::new(Mutex::new(Calls::default()))
}

pub fn calls(log: &Log) -> Calls {
    log.lock().unwrap().clone()
}

fn record(log: &Log) -> MutexGuard<'_, Calls> {
    log.lock().unwrap()
}

fn single_param(value: f32) -> ParamTensor {
    ParamTensor::new(vec![1], vec![value]).unwrap()
}

fn load_single(slot: &mut ParamTensor, key: &str, params: &StateDict) -> Vec<String> {
    match params.get(key) {
        Some(value) => {
            *slot = value.clone();
            Vec::new()
        }
        None => vec![key.to_string()],
    }
}

/// Emits `num_levels` constant maps, halving resolution per level.
pub struct StubBackbone {
    pub name: String,
    pub log: Log,
    pub channels: usize,
    pub num_levels: usize,
    pub fill: f32,
    pub weight: ParamTensor,
}

impl StubBackbone {
    pub fn new(name: &str, log: &Log, fill: f32) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
            channels: CHANNELS,
            num_levels: 5,
            fill,
            weight: single_param(fill),
        }
    }
}

impl Component for StubBackbone {
    fn state_dict(&self) -> DetectorResult<StateDict> {
        let mut out = StateDict::new();
        out.insert("weight", self.weight.clone());
        Ok(out)
    }

    fn load_state_dict(&mut self, params: &StateDict) -> DetectorResult<Vec<String>> {
        Ok(load_single(&mut self.weight, "weight", params))
    }

    fn set_mode(&mut self, mode: ModuleMode) {
        record(&self.log).modes.push((self.name.clone(), mode));
    }
}

impl Backbone<B> for StubBackbone {
    fn forward(&self, image: Tensor<B, 4>) -> DetectorResult<Vec<Tensor<B, 4>>> {
        let [n, c, h, w] = image.dims();
        record(&self.log).backbone.push((self.name.clone(), c));
        let device = image.device();
        Ok((0..self.num_levels)
            .map(|i| {
                let dims = [n, self.channels, (h >> i).max(1), (w >> i).max(1)];
                Tensor::full(dims, self.fill, &device)
            })
            .collect())
    }
}

pub struct StubNeck {
    pub name: String,
    pub log: Log,
}

impl StubNeck {
    pub fn new(name: &str, log: &Log) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
        }
    }
}

impl Component for StubNeck {
    fn state_dict(&self) -> DetectorResult<StateDict> {
        Ok(StateDict::new())
    }

    fn load_state_dict(&mut self, _params: &StateDict) -> DetectorResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn set_mode(&mut self, mode: ModuleMode) {
        record(&self.log).modes.push((self.name.clone(), mode));
    }
}

impl Neck<B> for StubNeck {
    fn forward(&self, levels: Vec<Tensor<B, 4>>) -> DetectorResult<Vec<Tensor<B, 4>>> {
        record(&self.log).neck.push(self.name.clone());
        Ok(levels)
    }
}

pub fn proposal_set(count: usize) -> InstanceSet {
    InstanceSet::new(vec![[0.0, 0.0, 8.0, 8.0]; count], vec![0; count])
        .with_scores(vec![0.5; count])
}

fn scalar_tensor(value: f32) -> Tensor<B, 1> {
    Tensor::from_floats([value], &device())
}

/// Class-agnostic proposal stub with a single `conv.weight` parameter.
pub struct StubRpn {
    pub log: Log,
    pub loss_keys: Vec<String>,
    pub proposals_per_image: usize,
    pub weight: ParamTensor,
}

impl StubRpn {
    pub fn new(log: &Log) -> Self {
        Self {
            log: log.clone(),
            loss_keys: vec![
                "loss_cls".into(),
                "loss_bbox".into(),
                "loss_rpn_bbox".into(),
            ],
            proposals_per_image: 3,
            weight: single_param(0.0),
        }
    }
}

impl Component for StubRpn {
    fn state_dict(&self) -> DetectorResult<StateDict> {
        let mut out = StateDict::new();
        out.insert("conv.weight", self.weight.clone());
        Ok(out)
    }

    fn load_state_dict(&mut self, params: &StateDict) -> DetectorResult<Vec<String>> {
        Ok(load_single(&mut self.weight, "conv.weight", params))
    }

    fn set_mode(&mut self, mode: ModuleMode) {
        record(&self.log).modes.push(("rpn_head".into(), mode));
    }
}

impl ProposalStage<B> for StubRpn {
    fn loss_and_predict(
        &self,
        feats: &FeaturePyramid<B>,
        samples: &[DataSample],
        _proposal_cfg: &ProposalConfig,
    ) -> DetectorResult<(LossMap<B>, Vec<InstanceSet>)> {
        let labels = samples
            .iter()
            .map(|s| s.gt_instances.labels.clone())
            .collect();
        record(&self.log).rpn_loss.push((feats.stream, labels));
        let mut losses = LossMap::new();
        for key in &self.loss_keys {
            losses.insert(key.clone(), scalar_tensor(1.0));
        }
        let proposals = vec![proposal_set(self.proposals_per_image); samples.len()];
        Ok((losses, proposals))
    }

    fn predict(
        &self,
        feats: &FeaturePyramid<B>,
        samples: &[DataSample],
        rescale: bool,
    ) -> DetectorResult<Vec<InstanceSet>> {
        record(&self.log).rpn_predict.push((feats.stream, rescale));
        Ok(vec![proposal_set(self.proposals_per_image); samples.len()])
    }
}

pub struct StubRoi {
    pub log: Log,
    pub dets_per_image: usize,
    pub bbox_head: bool,
    /// Return this many results from `predict` instead of one per sample.
    pub result_count: Option<usize>,
}

impl StubRoi {
    pub fn new(log: &Log) -> Self {
        Self {
            log: log.clone(),
            dets_per_image: 2,
            bbox_head: true,
            result_count: None,
        }
    }
}

impl Component for StubRoi {
    fn state_dict(&self) -> DetectorResult<StateDict> {
        Ok(StateDict::new())
    }

    fn load_state_dict(&mut self, _params: &StateDict) -> DetectorResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn set_mode(&mut self, mode: ModuleMode) {
        record(&self.log).modes.push(("roi_head".into(), mode));
    }
}

impl RoiStage<B> for StubRoi {
    fn loss(
        &self,
        feats: &FeaturePyramid<B>,
        proposals: &[InstanceSet],
        samples: &[DataSample],
    ) -> DetectorResult<LossMap<B>> {
        let labels = samples
            .iter()
            .map(|s| s.gt_instances.labels.clone())
            .collect();
        record(&self.log).roi_loss.push(RoiLossCall {
            stream: feats.stream,
            levels: feats.len(),
            labels,
            proposals: proposals.to_vec(),
        });
        let mut losses = LossMap::new();
        losses.insert("loss_cls", scalar_tensor(0.5));
        losses.insert("loss_bbox", scalar_tensor(0.25));
        losses.insert("acc", scalar_tensor(97.0));
        Ok(losses)
    }

    fn predict(
        &self,
        feats: &FeaturePyramid<B>,
        _proposals: &[InstanceSet],
        samples: &[DataSample],
        rescale: bool,
    ) -> DetectorResult<Vec<InstanceSet>> {
        record(&self.log).roi_predict.push((feats.stream, rescale));
        let n = self.dets_per_image;
        let count = self.result_count.unwrap_or(samples.len());
        let dets = InstanceSet::new(vec![[1.0, 1.0, 9.0, 9.0]; n], vec![1; n])
            .with_scores(vec![0.9; n]);
        Ok(vec![dets; count])
    }

    fn forward(
        &self,
        _feats: &FeaturePyramid<B>,
        proposals: &[InstanceSet],
        _samples: &[DataSample],
    ) -> DetectorResult<RoiOutputs<B>> {
        record(&self.log).roi_forward += 1;
        let rois: usize = proposals.iter().map(InstanceSet::len).sum();
        Ok(RoiOutputs {
            cls_score: Tensor::zeros([rois, 3], &device()),
            bbox_pred: Tensor::zeros([rois, 8], &device()),
        })
    }

    fn has_bbox_head(&self) -> bool {
        self.bbox_head
    }
}

pub fn dw_fusion(channels: usize) -> Box<dyn FusionOp<B>> {
    Box::new(DwConvFusion::new(
        DwConvFusionOptions {
            channels,
            kernel_size: 3,
        },
        &device(),
    ))
}

/// Fusion that records its calls and emits `fill` everywhere.
pub struct StubFusion {
    pub name: String,
    pub log: Log,
    pub fill: f32,
}

impl StubFusion {
    pub fn new(name: &str, log: &Log, fill: f32) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
            fill,
        }
    }
}

impl Component for StubFusion {
    fn state_dict(&self) -> DetectorResult<StateDict> {
        Ok(StateDict::new())
    }

    fn load_state_dict(&mut self, _params: &StateDict) -> DetectorResult<Vec<String>> {
        Ok(Vec::new())
    }
}

impl FusionOp<B> for StubFusion {
    fn fuse(&self, rgb: Tensor<B, 4>, _ir: Tensor<B, 4>) -> DetectorResult<Tensor<B, 4>> {
        let dims = rgb.dims();
        record(&self.log).fusion.push((self.name.clone(), dims[2]));
        Ok(Tensor::full(dims, self.fill, &rgb.device()))
    }
}

/// Student with stub backbones (fill 1.0), identity necks, stub heads and a real fusion conv.
pub fn student_parts(log: &Log) -> DetectorParts<B> {
    DetectorParts::new(
        InputLayout::default(),
        Box::new(StubBackbone::new("backbone", log, 1.0)),
        Box::new(StubBackbone::new("backbone_ir", log, 1.0)),
        dw_fusion(CHANNELS),
    )
    .necks(
        Box::new(StubNeck::new("neck", log)),
        Box::new(StubNeck::new("neck_ir", log)),
    )
    .rpn_head(Box::new(StubRpn::new(log)))
    .roi_head(Box::new(StubRoi::new(log)))
}

/// Teacher whose backbones emit 3.0 everywhere.
pub fn stub_teacher(log: &Log) -> TeacherEnsemble<B> {
    TeacherEnsemble::from_parts(
        InputLayout::default(),
        TeacherParts {
            backbone: Box::new(StubBackbone::new("teacher_backbone", log, 3.0)),
            backbone_ir: Box::new(StubBackbone::new("teacher_backbone_ir", log, 3.0)),
            neck: Some(Box::new(StubNeck::new("teacher_neck", log))),
            neck_ir: Some(Box::new(StubNeck::new("teacher_neck_ir", log))),
            fusion_conv: dw_fusion(CHANNELS),
            fusion_module: dw_fusion(CHANNELS),
            fusion_module_levels: vec![3, 4],
        },
    )
    .unwrap()
}

pub fn mse_bank(names: &[&str]) -> DistillLossBank<B> {
    let mut bank = DistillLossBank::new(5);
    for name in names {
        let loss = FeatureMseLoss::new(FeatureMseOptions::default());
        bank.push(*name, Box::new(loss)).unwrap();
    }
    bank
}

pub fn image(batch: usize) -> Tensor<B, 4> {
    Tensor::ones([batch, CHANNELS, SIZE, SIZE], &device())
}

pub fn samples(batch: usize) -> Vec<DataSample> {
    (0..batch)
        .map(|_| {
            let boxes = vec![[2.0, 2.0, 10.0, 10.0], [4.0, 4.0, 20.0, 20.0]];
            let gt = InstanceSet::new(boxes, vec![3, 5]);
            DataSample::new(ImageMeta::unscaled(SIZE, SIZE), gt)
        })
        .collect()
}

pub fn value(tensor: &Tensor<B, 1>) -> f32 {
    tensor.clone().into_data().to_vec::<f32>().unwrap()[0]
}

/// Built-in kinds plus `stub_rpn` (records its `num_classes`) and `stub_roi`.
pub fn stub_registry(log: &Log) -> ModelRegistry<B> {
    let mut registry = ModelRegistry::<B>::with_defaults();
    let rpn_log = log.clone();
    registry.register_proposal_stage("stub_rpn", move |cfg, _| {
        let num_classes = cfg
            .option("num_classes")
            .and_then(|v| v.as_integer())
            .unwrap_or(-1);
        record(&rpn_log).rpn_num_classes.push(num_classes);
        Ok(Box::new(StubRpn::new(&rpn_log)))
    });
    let roi_log = log.clone();
    registry.register_roi_stage(
        "stub_roi",
        move |_, _| Ok(Box::new(StubRoi::new(&roi_log))),
    );
    registry
}

pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

/// Small real network: 2-stage conv backbone, FPN neck with 5 outputs, dw_conv fusion.
pub const SMALL_MODEL: &str = r#"
[model]
backbone = { type = "pyramid_conv", base_channels = 2, num_stages = 2 }
neck = { type = "lateral_fpn", in_channels = [2, 4], out_channels = 4, num_outs = 5 }
fusion = { type = "dw_conv", channels = 4 }
rpn_head = { type = "stub_rpn" }
roi_head = { type = "stub_roi" }
"#;

pub const SMALL_TEACHER: &str = r#"
[model]
backbone = { type = "pyramid_conv", base_channels = 2, num_stages = 2 }
neck = { type = "lateral_fpn", in_channels = [2, 4], out_channels = 4, num_outs = 5 }
fusion = { type = "dw_conv", channels = 4 }
fusion_module = { type = "dw_conv", channels = 4, kernel_size = 1 }
"#;
