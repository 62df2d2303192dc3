//! Shared plumbing for the detector command-line tools.

use std::io::IsTerminal;
use std::path::Path;

use anyhow::{Context, Result};
use detector::compat::CompatRules;
use detector::config::DetectorConfig;
use detector::distill::DistillTarget;
use detector::state::Checkpoint;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Install the global subscriber; `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr);
        let _ = Registry::default().with(filter).with(layer).try_init();
    } else {
        let layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_ansi(std::io::stderr().is_terminal())
            .with_writer(std::io::stderr);
        let _ = Registry::default().with(filter).with(layer).try_init();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradeSummary {
    pub keys_before: usize,
    pub keys_after: usize,
    pub fired_rules: Vec<String>,
}

/// Rewrite a single-stream checkpoint into the dual-stream key layout.
///
/// Checkpoints that already carry thermal-stream keys are written back unchanged.
pub fn upgrade_checkpoint(input: &Path, output: &Path) -> Result<UpgradeSummary> {
    let ckpt = Checkpoint::from_path(input).with_context(|| format!("read {}", input.display()))?;
    let keys_before = ckpt.state_dict.len();
    let (state_dict, fired_rules) = CompatRules::classic_to_dual().apply(ckpt.state_dict);
    let upgraded = Checkpoint {
        state_dict,
        meta: ckpt.meta,
    };
    upgraded
        .save(output)
        .with_context(|| format!("write {}", output.display()))?;
    let summary = UpgradeSummary {
        keys_before,
        keys_after: upgraded.state_dict.len(),
        fired_rules,
    };
    info!(
        input = %input.display(),
        output = %output.display(),
        before = summary.keys_before,
        after = summary.keys_after,
        fired = ?summary.fired_rules,
        "checkpoint upgraded"
    );
    Ok(summary)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistillSummary {
    pub name: String,
    pub kind: String,
    pub stream: String,
    pub level: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigSummary {
    pub in_channels: usize,
    pub rgb_channels: usize,
    pub ir_channels: usize,
    pub num_levels: usize,
    pub backbone: String,
    pub neck: Option<String>,
    pub fusion: String,
    pub rpn_head: Option<String>,
    pub rpn_num_classes: Option<i64>,
    pub roi_head: Option<String>,
    pub proposal_max_per_img: usize,
    pub teacher: bool,
    pub distill: Vec<DistillSummary>,
}

/// Load, validate and summarize a detector config the way the detector will see it.
pub fn inspect_config(path: &Path) -> Result<ConfigSummary> {
    let cfg = DetectorConfig::from_path(path).with_context(|| format!("load {}", path.display()))?;
    let layout = cfg.model.layout;
    let rpn_head = cfg.rpn_head()?;
    let distill = cfg
        .distill
        .iter()
        .flat_map(|loc| &loc.methods)
        .map(|method| {
            let target = DistillTarget::parse(&method.name, layout.num_levels)?;
            Ok::<_, anyhow::Error>(DistillSummary {
                name: method.name.clone(),
                kind: method.component.kind.clone(),
                stream: target.stream.as_str().to_string(),
                level: target.level,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(ConfigSummary {
        in_channels: layout.in_channels,
        rgb_channels: layout.rgb_channels,
        ir_channels: layout.ir_channels(),
        num_levels: layout.num_levels,
        backbone: cfg.model.backbone.kind.clone(),
        neck: cfg.model.neck.as_ref().map(|c| c.kind.clone()),
        fusion: cfg.model.fusion.kind.clone(),
        rpn_num_classes: rpn_head
            .as_ref()
            .and_then(|c| c.option("num_classes"))
            .and_then(|v| v.as_integer()),
        rpn_head: rpn_head.map(|c| c.kind),
        roi_head: cfg.model.roi_head.as_ref().map(|c| c.kind.clone()),
        proposal_max_per_img: cfg.proposal_config().max_per_img,
        teacher: cfg.distill_enabled(),
        distill,
    })
}

/// Plain-text rendering for terminals.
pub fn render_summary(summary: &ConfigSummary) -> String {
    let mut out = format!(
        "input: {} channels ({} rgb + {} thermal), {} levels\n",
        summary.in_channels, summary.rgb_channels, summary.ir_channels, summary.num_levels
    );
    out.push_str(&format!("backbone: {}\n", summary.backbone));
    out.push_str(&format!("neck: {}\n", summary.neck.as_deref().unwrap_or("-")));
    out.push_str(&format!("fusion: {}\n", summary.fusion));
    out.push_str(&format!("rpn_head: {}\n", summary.rpn_head.as_deref().unwrap_or("-")));
    out.push_str(&format!("roi_head: {}\n", summary.roi_head.as_deref().unwrap_or("-")));
    out.push_str(&format!("proposals per image: {}\n", summary.proposal_max_per_img));
    out.push_str(&format!("teacher: {}\n", if summary.teacher { "yes" } else { "no" }));
    for d in &summary.distill {
        out.push_str(&format!("  {} [{}] {} level {}\n", d.name, d.kind, d.stream, d.level));
    }
    out
}
