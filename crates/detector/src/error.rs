//! Error taxonomy for the detector core.

use std::path::PathBuf;
use thiserror::Error;

pub type DetectorResult<T> = Result<T, DetectorError>;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("shape mismatch in {context}: {left:?} vs {right:?}")]
    ShapeMismatch {
        context: String,
        left: Vec<usize>,
        right: Vec<usize>,
    },
    #[error("checkpoint key mismatch: missing {missing:?}, unexpected {unexpected:?}")]
    CheckpointKeyMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
    #[error("precondition violated: {0}")]
    Precondition(String),
    #[error("unknown {kind} type `{name}` (registered: {registered:?})")]
    UnknownComponent {
        kind: &'static str,
        name: String,
        registered: Vec<String>,
    },
    #[error("tensor data error: {0}")]
    Tensor(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json parse error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("toml parse error at {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl DetectorError {
    pub(crate) fn shape(context: impl Into<String>, left: &[usize], right: &[usize]) -> Self {
        DetectorError::ShapeMismatch {
            context: context.into(),
            left: left.to_vec(),
            right: right.to_vec(),
        }
    }
}
