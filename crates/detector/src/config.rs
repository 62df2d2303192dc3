//! TOML configuration for the detector and its teacher.

use crate::error::{DetectorError, DetectorResult};
use crate::pyramid::InputLayout;
use crate::stages::ProposalConfig;
use crate::state::LoadMode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// `{ type = "<registered kind>", ...options }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub options: toml::Table,
}

impl ComponentConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            options: toml::Table::new(),
        }
    }

    pub fn with_option(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    pub fn option(&self, key: &str) -> Option<&toml::Value> {
        self.options.get(key)
    }

    /// Deserialize the options table into a typed options struct.
    pub fn options_as<T: DeserializeOwned>(&self) -> DetectorResult<T> {
        let kind = &self.kind;
        toml::Value::Table(self.options.clone())
            .try_into()
            .map_err(|e| DetectorError::Config(format!("invalid options for `{kind}`: {e}")))
    }
}

fn default_fusion() -> ComponentConfig {
    ComponentConfig::new("dw_conv")
}

fn default_fusion_module_levels() -> Vec<usize> {
    vec![3, 4]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(flatten)]
    pub layout: InputLayout,
    pub backbone: ComponentConfig,
    #[serde(default)]
    pub neck: Option<ComponentConfig>,
    #[serde(default)]
    pub rpn_head: Option<ComponentConfig>,
    #[serde(default)]
    pub roi_head: Option<ComponentConfig>,
    #[serde(default = "default_fusion")]
    pub fusion: ComponentConfig,
    /// Second fusion operator; only teacher configurations use it.
    #[serde(default)]
    pub fusion_module: Option<ComponentConfig>,
    /// Levels the teacher fuses with `fusion_module` instead of `fusion`.
    #[serde(default = "default_fusion_module_levels")]
    pub fusion_module_levels: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default)]
    pub rpn: Option<toml::Table>,
    #[serde(default)]
    pub rpn_proposal: Option<ProposalConfig>,
    #[serde(default)]
    pub rcnn: Option<toml::Table>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestConfig {
    #[serde(default)]
    pub rpn: Option<ProposalConfig>,
    #[serde(default)]
    pub rcnn: Option<toml::Table>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistillMethodConfig {
    /// Loss name; encodes the stream and pyramid level it compares (e.g. `loss_fgd_ir_3`).
    pub name: String,
    #[serde(flatten)]
    pub component: ComponentConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistillLocation {
    #[serde(default)]
    pub student_module: Option<String>,
    #[serde(default)]
    pub teacher_module: Option<String>,
    #[serde(default)]
    pub methods: Vec<DistillMethodConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub train_cfg: Option<TrainConfig>,
    #[serde(default)]
    pub test_cfg: Option<TestConfig>,
    #[serde(default)]
    pub distill: Vec<DistillLocation>,
    #[serde(default)]
    pub teacher_cfg: Option<PathBuf>,
    #[serde(default)]
    pub teacher_pretrained: Option<PathBuf>,
    /// `"strict"` (default) or `"lenient"` loading of `teacher_pretrained`.
    #[serde(default)]
    pub teacher_load: LoadMode,
}

impl DetectorConfig {
    /// Load and validate; relative teacher paths resolve against the file's directory.
    pub fn from_path(path: &Path) -> DetectorResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| DetectorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg: DetectorConfig = toml::from_str(&raw).map_err(|source| DetectorError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(base) = path.parent() {
            cfg.teacher_cfg = cfg.teacher_cfg.map(|p| resolve(base, p));
            cfg.teacher_pretrained = cfg.teacher_pretrained.map(|p| resolve(base, p));
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(raw: &str) -> DetectorResult<Self> {
        let cfg: DetectorConfig = toml::from_str(raw)
            .map_err(|e| DetectorError::Config(format!("invalid detector config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> DetectorResult<()> {
        self.model.layout.validate()?;
        if let Some(level) = self
            .model
            .fusion_module_levels
            .iter()
            .find(|&&l| l >= self.model.layout.num_levels)
        {
            return Err(DetectorError::Config(format!(
                "fusion_module_levels entry {level} is out of range for {} levels",
                self.model.layout.num_levels
            )));
        }
        match (&self.teacher_cfg, &self.teacher_pretrained) {
            (Some(_), None) | (None, Some(_)) => Err(DetectorError::Config(
                "teacher_cfg and teacher_pretrained must be set together".into(),
            )),
            _ => Ok(()),
        }
    }

    pub fn distill_enabled(&self) -> bool {
        self.teacher_cfg.is_some() && self.teacher_pretrained.is_some()
    }

    /// `train_cfg.rpn_proposal`, else `test_cfg.rpn`, else defaults.
    pub fn proposal_config(&self) -> ProposalConfig {
        self.train_cfg
            .as_ref()
            .and_then(|t| t.rpn_proposal)
            .or_else(|| self.test_cfg.as_ref().and_then(|t| t.rpn))
            .unwrap_or_default()
    }

    /// Proposal head config with `num_classes = 1` and its train/test sub-configs injected.
    pub fn rpn_head(&self) -> DetectorResult<Option<ComponentConfig>> {
        let Some(head) = self.model.rpn_head.clone() else {
            return Ok(None);
        };
        let mut head = normalize_rpn_head(head);
        if let Some(rpn) = self.train_cfg.as_ref().and_then(|t| t.rpn.clone()) {
            head = head.with_option("train_cfg", toml::Value::Table(rpn));
        }
        if let Some(rpn) = self.test_cfg.as_ref().and_then(|t| t.rpn) {
            let value = toml::Value::try_from(rpn)
                .map_err(|e| DetectorError::Config(format!("test_cfg.rpn: {e}")))?;
            head = head.with_option("test_cfg", value);
        }
        Ok(Some(head))
    }

    /// ROI head config with the `rcnn` train/test sub-configs injected.
    pub fn roi_head(&self) -> Option<ComponentConfig> {
        let mut head = self.model.roi_head.clone()?;
        if let Some(rcnn) = self.train_cfg.as_ref().and_then(|t| t.rcnn.clone()) {
            head = head.with_option("train_cfg", toml::Value::Table(rcnn));
        }
        if let Some(rcnn) = self.test_cfg.as_ref().and_then(|t| t.rcnn.clone()) {
            head = head.with_option("test_cfg", toml::Value::Table(rcnn));
        }
        Some(head)
    }
}

/// The proposal stage is class-agnostic: force `num_classes = 1`.
pub fn normalize_rpn_head(head: ComponentConfig) -> ComponentConfig {
    match head.options.get("num_classes").map(|v| v.as_integer()) {
        None => {}
        Some(Some(1)) => return head,
        Some(other) => warn!(
            got = ?other,
            "proposal stage is class-agnostic; set rpn_head.num_classes = 1 in the config"
        ),
    }
    head.with_option("num_classes", 1)
}

fn resolve(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}
