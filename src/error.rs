use std::time::Duration;

use thiserror::Error;

use crate::core::WorkerId;
use crate::orchestration::UnitId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("Unit not found: {0}")]
    UnitNotFound(UnitId),

    #[error("Unknown category: {0}")]
    UnknownCategory(String),

    #[error("Dependency from {from} to {to} would create a cycle")]
    DependencyCycle { from: WorkerId, to: WorkerId },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Analysis error ({model}): {message}")]
    Analysis { model: String, message: String },

    #[error("Model error ({model}): {message}")]
    Model { model: String, message: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Performance degradation: {0}")]
    Performance(String),

    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("Coordination lock held for unit {0}")]
    LockContention(UnitId),

    #[error("Worker {worker} failed: {message}")]
    Worker { worker: WorkerId, message: String },

    #[error("No eligible worker for task requiring {0:?}")]
    NoEligibleWorker(Vec<String>),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Name of the model implicated by this error, if any.
    pub fn model(&self) -> Option<&str> {
        match self {
            Error::Analysis { model, .. } | Error::Model { model, .. } => Some(model),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
