mod common;

use common::*;
use detector::prelude::*;

#[test]
fn proposal_head_is_forced_class_agnostic() {
    let log = new_log();
    let raw = SMALL_MODEL.replace(
        r#"{ type = "stub_rpn" }"#,
        r#"{ type = "stub_rpn", num_classes = 3 }"#,
    );
    let cfg = DetectorConfig::from_toml_str(&raw).unwrap();
    let det = DualStreamDetector::from_config(&cfg, &stub_registry(&log), &device()).unwrap();
    assert!(det.with_rpn());
    assert_eq!(calls(&log).rpn_num_classes, vec![1]);
}

#[test]
fn stage_presence_follows_the_config() {
    let log = new_log();
    let cfg = DetectorConfig::from_toml_str(SMALL_MODEL).unwrap();
    let det = DualStreamDetector::from_config(&cfg, &stub_registry(&log), &device()).unwrap();
    assert!(det.with_rpn());
    assert!(det.with_roi_head());
    assert!(det.with_neck());
    assert!(det.with_bbox());
    assert!(!det.is_distilling());

    let bare = r#"
[model]
backbone = { type = "pyramid_conv", base_channels = 2, num_stages = 5 }
fusion = { type = "dw_conv", channels = 32 }
"#;
    let cfg = DetectorConfig::from_toml_str(bare).unwrap();
    let det = DualStreamDetector::from_config(&cfg, &stub_registry(&log), &device()).unwrap();
    assert!(!det.with_rpn());
    assert!(!det.with_roi_head());
    assert!(!det.with_neck());
    assert!(!det.with_bbox());
}

#[test]
fn real_stages_produce_a_five_level_fused_pyramid() {
    let log = new_log();
    let cfg = DetectorConfig::from_toml_str(SMALL_MODEL).unwrap();
    let det = DualStreamDetector::from_config(&cfg, &stub_registry(&log), &device()).unwrap();
    let (rgb, ir) = det.extract_feat(&image(2)).unwrap();
    let fused = det.fuse(&rgb, &ir).unwrap();
    let dims: Vec<[usize; 4]> = fused.levels.iter().map(|l| l.dims()).collect();
    assert_eq!(
        dims,
        vec![
            [2, 4, 16, 16],
            [2, 4, 8, 8],
            [2, 4, 4, 4],
            [2, 4, 2, 2],
            [2, 4, 1, 1]
        ]
    );
}

#[test]
fn unknown_component_types_are_reported() {
    let log = new_log();
    let raw = SMALL_MODEL.replace("pyramid_conv", "resnet9000");
    let cfg = DetectorConfig::from_toml_str(&raw).unwrap();
    let err = DualStreamDetector::from_config(&cfg, &stub_registry(&log), &device())
        .err()
        .unwrap();
    match err {
        DetectorError::UnknownComponent {
            kind,
            name,
            registered,
        } => {
            assert_eq!(kind, "backbone");
            assert_eq!(name, "resnet9000");
            assert!(registered.contains(&"pyramid_conv".to_string()));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn distill_methods_without_a_teacher_are_ignored() {
    let log = new_log();
    let raw = format!(
        r#"{SMALL_MODEL}
[[distill]]
[[distill.methods]]
name = "loss_mse_0"
type = "feature_mse"
"#
    );
    let cfg = DetectorConfig::from_toml_str(&raw).unwrap();
    assert_eq!(cfg.distill.len(), 1);
    assert!(!cfg.distill_enabled());
    let det = DualStreamDetector::from_config(&cfg, &stub_registry(&log), &device()).unwrap();
    assert!(!det.is_distilling());
    assert!(det.distill_losses().is_empty());
}

#[test]
fn proposal_settings_come_from_train_then_test_config() {
    let raw = format!(
        r#"{SMALL_MODEL}
[test_cfg.rpn]
nms_pre = 500
max_per_img = 300
iou_threshold = 0.6
min_bbox_size = 0.0
"#
    );
    let cfg = DetectorConfig::from_toml_str(&raw).unwrap();
    assert_eq!(cfg.proposal_config().max_per_img, 300);

    let log = new_log();
    let det = DualStreamDetector::from_config(&cfg, &stub_registry(&log), &device()).unwrap();
    assert_eq!(det.proposal_cfg().max_per_img, 300);
}

#[test]
fn invalid_layouts_fail_before_building() {
    let raw = SMALL_MODEL.replace("[model]\n", "[model]\nin_channels = 3\n");
    let err = DetectorConfig::from_toml_str(&raw).unwrap_err();
    assert!(matches!(err, DetectorError::Config(_)));

    let raw = SMALL_MODEL.replace("[model]\n", "[model]\nfusion_module_levels = [5]\n");
    let err = DetectorConfig::from_toml_str(&raw).unwrap_err();
    assert!(matches!(err, DetectorError::Config(_)));
}
