use std::io;

use minillm::error::{EngineError, StorageError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("{0}")]
    BadRequest(String),
    #[error("environment: {0}")]
    Environment(String),
    #[error("{0}")]
    Conflict(String),
    #[error("maximum number of loaded models reached ({0}); unload one first")]
    RegistryFull(usize),
    #[error("training in progress; pause it first")]
    TrainingActive,
    #[error("no training in progress")]
    NotTraining,
    #[error(
        "corpus too small ({len} characters, need at least {min}); \
         link and activate data for this config"
    )]
    CorpusTooSmall { len: usize, min: usize },
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("background task failed: {0}")]
    Task(String),
}

impl DaemonError {
    pub fn not_found(kind: &'static str, id: &str) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<StorageError> for DaemonError {
    fn from(e: StorageError) -> Self {
        Self::Engine(EngineError::Storage(e))
    }
}

impl From<tokio::task::JoinError> for DaemonError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
