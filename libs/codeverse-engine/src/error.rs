use codeverse_common::store::StoreError;
use thiserror::Error;

/// Failures that reject an execution outright.
///
/// Compile errors, runtime errors and timeouts are not here: they are
/// ordinary outcomes and come back inside `ExecutionResult`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("container engine error: {0}")]
    Container(#[from] bollard::errors::Error),

    #[error("failed to stage scratch files: {0}")]
    Scratch(#[source] std::io::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job queue is closed")]
    QueueClosed,
}

impl EngineError {
    pub fn spawn(program: impl Into<String>, source: std::io::Error) -> Self {
        EngineError::Spawn {
            program: program.into(),
            source,
        }
    }
}
