//! Declarative key rewrites that let single-stream checkpoints seed the dual-stream detector.

use crate::state::StateDict;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleCondition {
    /// No key starts with this string; `rpn_head` also covers `rpn_head_fusion.*`.
    NoKeyStartsWith(String),
    /// No key contains this substring anywhere.
    NoKeyContains(String),
}

impl RuleCondition {
    fn holds(&self, state: &StateDict) -> bool {
        match self {
            RuleCondition::NoKeyStartsWith(prefix) => {
                !state.keys().any(|k| k.starts_with(prefix.as_str()))
            }
            RuleCondition::NoKeyContains(needle) => !state.any_key_contains(needle),
        }
    }
}

/// Rewrites keys whose first dotted segment equals `from` into each of `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixRule {
    pub from: String,
    pub to: Vec<String>,
    /// Keep the original key next to the rewritten copies.
    pub keep_source: bool,
}

impl PrefixRule {
    pub fn rename(from: &str, to: &str) -> Self {
        Self {
            from: from.into(),
            to: vec![to.into()],
            keep_source: false,
        }
    }

    pub fn duplicate(from: &str, to: &[&str]) -> Self {
        Self {
            from: from.into(),
            to: to.iter().map(|s| s.to_string()).collect(),
            keep_source: true,
        }
    }
}

/// Rules that fire together when `when` holds for the dict as it was at stage entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameStage {
    pub name: String,
    pub when: RuleCondition,
    pub rules: Vec<PrefixRule>,
}

impl RenameStage {
    /// Rewritten dict, or `None` when the condition fails or no key matched.
    fn apply(&self, state: &StateDict) -> Option<StateDict> {
        if !self.when.holds(state) {
            return None;
        }
        let mut touched = false;
        let mut out = StateDict::new();
        for (key, value) in state.iter() {
            let segment = top_segment(key);
            let rest = &key[segment.len()..];
            let mut keep = true;
            for rule in self.rules.iter().filter(|r| r.from == segment) {
                touched = true;
                keep &= rule.keep_source;
                for target in &rule.to {
                    out.insert(format!("{target}{rest}"), value.clone());
                }
            }
            if keep && !out.contains_key(key) {
                out.insert(key, value.clone());
            }
        }
        touched.then_some(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompatRules {
    pub stages: Vec<RenameStage>,
}

impl CompatRules {
    /// Single-stream ("classic") detector checkpoint into the dual-stream layout.
    pub fn classic_to_dual() -> Self {
        Self {
            stages: vec![
                RenameStage {
                    name: "bbox_head->rpn_head".into(),
                    when: RuleCondition::NoKeyStartsWith("rpn_head".into()),
                    rules: vec![PrefixRule::rename("bbox_head", "rpn_head")],
                },
                RenameStage {
                    name: "single_stream->dual_stream".into(),
                    when: RuleCondition::NoKeyContains("backbone_ir".into()),
                    rules: vec![
                        PrefixRule::duplicate("backbone", &["backbone_ir"]),
                        PrefixRule::duplicate("neck", &["neck_ir"]),
                        PrefixRule::duplicate("rpn_head", &["rpn_head_fusion"]),
                        PrefixRule::duplicate("roi_head", &["roi_head_rgb", "roi_head_ir"]),
                    ],
                },
            ],
        }
    }

    /// Run every stage in order; returns the new dict and the names of stages that fired.
    pub fn apply(&self, state: StateDict) -> (StateDict, Vec<String>) {
        let mut fired = Vec::new();
        let mut current = state;
        for stage in &self.stages {
            if let Some(next) = stage.apply(&current) {
                warn!(
                    stage = %stage.name,
                    before = current.len(),
                    after = next.len(),
                    "applied checkpoint compatibility rewrite"
                );
                fired.push(stage.name.clone());
                current = next;
            }
        }
        (current, fired)
    }
}

fn top_segment(key: &str) -> &str {
    key.split('.').next().unwrap_or(key)
}
