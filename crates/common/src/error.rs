use thiserror::Error;

/// Workspace-common error for core's public seams (listener startup).
/// Operation-level failures carry their own enums next to the code that
/// produces them.
#[derive(Debug, Error)]
pub enum VeilnetError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for VeilNet operations
pub type Result<T> = std::result::Result<T, VeilnetError>;
