mod common;

use common::*;
use detector::prelude::*;
use detector::teacher::TEACHER_PREFIXES;
use std::path::{Path, PathBuf};

fn teacher_config() -> DetectorConfig {
    DetectorConfig::from_toml_str(SMALL_TEACHER).unwrap()
}

fn fresh_teacher(log: &Log) -> TeacherEnsemble<B> {
    TeacherEnsemble::build(&teacher_config(), &stub_registry(log), &device()).unwrap()
}

fn load_teacher(
    cfg: &Path,
    ckpt: &Path,
    log: &Log,
    mode: LoadMode,
) -> DetectorResult<(TeacherEnsemble<B>, LoadReport)> {
    TeacherEnsemble::load(cfg, ckpt, &stub_registry(log), &device(), mode)
}

/// Writes `teacher.toml` and a checkpoint of a freshly built teacher into `dir`.
fn write_teacher(dir: &Path, log: &Log) -> (PathBuf, PathBuf, StateDict) {
    let cfg = write_file(dir, "teacher.toml", SMALL_TEACHER);
    let state = fresh_teacher(log).state_dict().unwrap();
    let ckpt = dir.join("teacher.json");
    Checkpoint::new(state.clone()).save(&ckpt).unwrap();
    (cfg, ckpt, state)
}

#[test]
fn every_module_loads_from_one_checkpoint() {
    let log = new_log();
    let dir = tempfile::tempdir().unwrap();
    let (cfg, ckpt, state) = write_teacher(dir.path(), &log);

    let (teacher, report) = load_teacher(&cfg, &ckpt, &log, LoadMode::Strict).unwrap();
    assert!(report.missing.is_empty());
    assert_eq!(report.loaded, state.len());
    assert_eq!(teacher.state_dict().unwrap(), state);
    assert_eq!(teacher.phase(), TeacherPhase::Uninitialized);
    assert!(teacher.has_neck());
    for prefix in TEACHER_PREFIXES {
        assert!(state.keys().any(|k| k.starts_with(prefix)), "{prefix}");
    }
}

#[test]
fn head_keys_in_the_checkpoint_are_ignored() {
    let log = new_log();
    let mut state = fresh_teacher(&log).state_dict().unwrap();
    let head_weight = ParamTensor::new(vec![1], vec![0.0]).unwrap();
    state.insert("roi_head.bbox.weight", head_weight);
    let mut teacher = fresh_teacher(&log);
    let report = teacher.load_checkpoint(&state, LoadMode::Strict).unwrap();
    assert!(report.unexpected.is_empty());
}

#[test]
fn wrong_shape_leaves_the_teacher_untouched() {
    let log = new_log();
    let mut teacher = fresh_teacher(&log);
    let before = teacher.state_dict().unwrap();

    let mut state = fresh_teacher(&log).state_dict().unwrap();
    let bad = ParamTensor::new(vec![1, 1, 1, 1], vec![0.0]).unwrap();
    state.insert("fusion_module.pointwise.weight", bad);
    let err = teacher
        .load_checkpoint(&state, LoadMode::Lenient)
        .unwrap_err();
    match err {
        DetectorError::ShapeMismatch { context, .. } => {
            assert_eq!(context, "fusion_module.pointwise.weight");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(teacher.state_dict().unwrap(), before);
}

#[test]
fn missing_fusion_module_keys_fail_strict_loading() {
    let log = new_log();
    let dir = tempfile::tempdir().unwrap();
    let (cfg, _, state) = write_teacher(dir.path(), &log);
    let partial: StateDict = state
        .iter()
        .filter(|(k, _)| !k.starts_with("fusion_module."))
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    let ckpt = dir.path().join("partial.json");
    Checkpoint::new(partial).save(&ckpt).unwrap();

    let err = load_teacher(&cfg, &ckpt, &log, LoadMode::Strict)
        .err()
        .unwrap();
    match err {
        DetectorError::CheckpointKeyMismatch {
            missing,
            unexpected,
        } => {
            assert!(!missing.is_empty());
            assert!(missing.iter().all(|k| k.starts_with("fusion_module.")));
            assert!(unexpected.is_empty());
        }
        other => panic!("unexpected error {other:?}"),
    }

    let (_, report) = load_teacher(&cfg, &ckpt, &log, LoadMode::Lenient).unwrap();
    let missing = report.missing;
    assert!(!missing.is_empty());
    assert!(missing.iter().all(|k| k.starts_with("fusion_module.")));
}

#[test]
fn teacher_config_needs_a_fusion_module() {
    let log = new_log();
    let cfg = DetectorConfig::from_toml_str(SMALL_MODEL).unwrap();
    let err = TeacherEnsemble::build(&cfg, &stub_registry(&log), &device())
        .err()
        .unwrap();
    assert!(matches!(err, DetectorError::Config(_)));
}

#[test]
fn fused_levels_route_between_the_two_fusion_ops() {
    let log = new_log();
    let teacher = TeacherEnsemble::from_parts(
        InputLayout::default(),
        TeacherParts {
            backbone: Box::new(StubBackbone::new("teacher_backbone", &log, 3.0)),
            backbone_ir: Box::new(StubBackbone::new("teacher_backbone_ir", &log, 3.0)),
            neck: None,
            neck_ir: None,
            fusion_conv: Box::new(StubFusion::new("fusion_conv", &log, 1.0)),
            fusion_module: Box::new(StubFusion::new("fusion_module", &log, 2.0)),
            fusion_module_levels: vec![3, 4],
        },
    )
    .unwrap();

    let (rgb, ir) = teacher.extract_feat(&image(1)).unwrap();
    let fused = teacher.fused_pyramid(&rgb, &ir).unwrap();
    assert_eq!(fused.stream, Stream::Fused);

    let routed: Vec<(String, usize)> = calls(&log).fusion;
    let expected: Vec<(String, usize)> = [
        ("fusion_conv", 32),
        ("fusion_conv", 16),
        ("fusion_conv", 8),
        ("fusion_module", 4),
        ("fusion_module", 2),
    ]
    .into_iter()
    .map(|(name, h)| (name.to_string(), h))
    .collect();
    assert_eq!(routed, expected);

    let fills: Vec<f32> = fused
        .levels
        .iter()
        .map(|level| level.clone().into_data().to_vec::<f32>().unwrap()[0])
        .collect();
    assert_eq!(fills, vec![1.0, 1.0, 1.0, 2.0, 2.0]);
}

/// Top-level keys must precede `[model]`, or TOML assigns them to that table.
fn student_with_teacher() -> String {
    format!(
        r#"teacher_cfg = "teacher.toml"
teacher_pretrained = "teacher.json"
{SMALL_MODEL}
[[distill]]
student_module = "neck"
teacher_module = "neck"

[[distill.methods]]
name = "loss_mse_2"
type = "feature_mse"

[[distill.methods]]
name = "loss_mse_ir_3"
type = "feature_mse"
weight = 0.5
"#
    )
}

#[test]
fn configured_teacher_enables_distillation() {
    let log = new_log();
    let dir = tempfile::tempdir().unwrap();
    write_teacher(dir.path(), &log);
    let path = write_file(dir.path(), "student.toml", &student_with_teacher());

    let cfg = DetectorConfig::from_path(&path).unwrap();
    assert!(cfg.distill_enabled());
    let teacher_cfg = dir.path().join("teacher.toml");
    assert_eq!(cfg.teacher_cfg.as_deref(), Some(teacher_cfg.as_path()));

    let mut det = DualStreamDetector::from_config(&cfg, &stub_registry(&log), &device()).unwrap();
    assert!(det.is_distilling());
    let names: Vec<&str> = det.distill_losses().names().collect();
    assert_eq!(names, vec!["loss_mse_2", "loss_mse_ir_3"]);

    let losses = det.loss(&image(2), &samples(2)).unwrap();
    assert_eq!(det.teacher_phase(), Some(TeacherPhase::Ready));
    for name in ["loss_mse_2", "loss_mse_ir_3"] {
        let v = value(losses.get(name).unwrap());
        assert!(v.is_finite() && v >= 0.0, "{name} = {v}");
    }
    assert!(losses.contains_key("ir_rpn_loss_cls"));

    // teacher weights travel with the detector state under their own prefix
    let state = det.state_dict().unwrap();
    assert!(state.any_key_contains("teacher_fusion_module."));
    let trainable = det.trainable_state_dict().unwrap();
    assert!(trainable.keys().all(|k| !k.starts_with("teacher_")));
}

#[test]
fn half_configured_teacher_is_rejected() {
    let raw = format!("teacher_cfg = \"teacher.toml\"\n{SMALL_MODEL}");
    let err = DetectorConfig::from_toml_str(&raw).unwrap_err();
    assert!(matches!(err, DetectorError::Config(_)));
}
