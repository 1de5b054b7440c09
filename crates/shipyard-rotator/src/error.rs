use thiserror::Error;

pub type RotationResult<T> = Result<T, RotationError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RotationError {
    #[error("invalid rotator config: {0}")]
    InvalidConfig(String),

    #[error("failed to cordon node {node}: {error}")]
    Cordon { node: String, error: String },

    #[error("failed to drain node {node} after {attempts} attempts: {error}")]
    Drain {
        node: String,
        attempts: u32,
        error: String,
    },

    #[error("failed to replace nodes: {0}")]
    Replace(String),

    #[error("replacement node {0} did not become ready")]
    NotReady(String),
}
