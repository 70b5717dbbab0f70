use std::path::PathBuf;

use thiserror::Error;

/// Storage engine error types
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Parse error in {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Conflict on record {id}: unsaved local changes while the file changed externally")]
    Conflict { id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Watcher error: {0}")]
    Watcher(#[from] notify::Error),
}

impl StoreError {
    pub fn parse(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StoreError::Parse {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<String> for StoreError {
    fn from(err: String) -> Self {
        StoreError::Validation(err)
    }
}

impl From<&str> for StoreError {
    fn from(err: &str) -> Self {
        StoreError::Validation(err.to_string())
    }
}

impl serde::Serialize for StoreError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
