use std::fmt::Display;

use crate::family::{PipelineFamily, ProcessType};

pub type Result<T> = std::result::Result<T, EngineError>;

/// Stable tag surfaced to a remote caller alongside the message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConfigurationError,
    ModelLoadError,
    UnknownSchedulerError,
    UnknownAdapterError,
    OperationCanceled,
    NoPipelineLoaded,
    GenerationError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigurationError => "ConfigurationError",
            Self::ModelLoadError => "ModelLoadError",
            Self::UnknownSchedulerError => "UnknownSchedulerError",
            Self::UnknownAdapterError => "UnknownAdapterError",
            Self::OperationCanceled => "OperationCanceled",
            Self::NoPipelineLoaded => "NoPipelineLoaded",
            Self::GenerationError => "GenerationError",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    Configuration(String),
    #[error("failed to load `{component}`: {source}")]
    ModelLoad {
        component: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("unknown scheduler `{0}`")]
    UnknownScheduler(String),
    #[error("adapter `{0}` is not attached to the pipeline")]
    UnknownAdapter(String),
    #[error("Operation Canceled")]
    OperationCanceled,
    #[error("no pipeline loaded")]
    NoPipelineLoaded,
    #[error("{family} does not support process type `{process_type}`")]
    UnsupportedProcessType {
        family: PipelineFamily,
        process_type: ProcessType,
    },
    #[error(transparent)]
    Generation(anyhow::Error),
    #[error(transparent)]
    Framework(#[from] candle_core::Error),
}

impl EngineError {
    pub fn configuration(msg: impl Display) -> Self {
        Self::Configuration(msg.to_string())
    }

    pub fn model_load(component: impl Display, source: impl Into<anyhow::Error>) -> Self {
        Self::ModelLoad {
            component: component.to_string(),
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::UnsupportedProcessType { .. } => {
                ErrorKind::ConfigurationError
            }
            Self::ModelLoad { .. } => ErrorKind::ModelLoadError,
            Self::UnknownScheduler(_) => ErrorKind::UnknownSchedulerError,
            Self::UnknownAdapter(_) => ErrorKind::UnknownAdapterError,
            Self::OperationCanceled => ErrorKind::OperationCanceled,
            Self::NoPipelineLoaded => ErrorKind::NoPipelineLoaded,
            Self::Generation(_) | Self::Framework(_) => ErrorKind::GenerationError,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::OperationCanceled)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(value: serde_json::Error) -> Self {
        Self::Configuration(value.to_string())
    }
}
