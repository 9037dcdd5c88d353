//! Error types for net construction, wire text and control-core operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RccError>;

#[derive(Error, Debug)]
pub enum RccError {
    #[error("Format error at byte {position}: {message}")]
    Format { position: usize, message: String },

    #[error("Cannot resolve binding '{binding}': {message}")]
    Resolve { binding: String, message: String },

    #[error("Naming error: {0}")]
    Naming(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Value error: {0}")]
    Value(String),

    #[error("Control core error: {0}")]
    Engine(String),

    #[error("Net already unloaded: {0}")]
    Unloaded(String),

    #[error("Blocking call on the control core event dispatch thread")]
    DispatchThread,

    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RccError {
    pub(crate) fn format(position: usize, message: impl Into<String>) -> Self {
        RccError::Format {
            position,
            message: message.into(),
        }
    }

    pub(crate) fn resolve(binding: &str, message: impl Into<String>) -> Self {
        RccError::Resolve {
            binding: binding.to_string(),
            message: message.into(),
        }
    }
}
