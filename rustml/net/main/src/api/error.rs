use std::path::PathBuf;

use rustml_kernels::KernelError;
use thiserror::Error;

/// Result type for network operations
pub type NetResult<T> = Result<T, NetError>;

/// Status taxonomy every error maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Malformed caller input.
    InvalidArgument,
    /// Operation attempted in the wrong lifecycle state.
    InvalidState,
    /// Zero rows where rows are required.
    EmptyData,
    /// Architecture construction or shape mismatch.
    BuildFailed,
    /// Invariant violation, e.g. non-finite values.
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::EmptyData => "EMPTY_DATA",
            ErrorCode::BuildFailed => "BUILD_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum NetError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Empty data: {0}")]
    EmptyData(String),

    #[error("Build failed: {0}")]
    BuildFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Non-finite value in {what} at index {index}")]
    NonFinite { what: String, index: usize },

    #[error("Missing file: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("Unsupported format version {found} (supported: {supported})")]
    VersionMismatch { found: u32, supported: u32 },

    #[error("Tensor '{name}': expected {expected} elements, found {found}")]
    TensorMismatch { name: String, expected: usize, found: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),
}

impl NetError {
    pub fn code(&self) -> ErrorCode {
        match self {
            NetError::InvalidArgument(_) | NetError::MissingFile(_) | NetError::Io(_) => ErrorCode::InvalidArgument,
            NetError::InvalidState(_) => ErrorCode::InvalidState,
            NetError::EmptyData(_) => ErrorCode::EmptyData,
            NetError::BuildFailed(_)
            | NetError::VersionMismatch { .. }
            | NetError::TensorMismatch { .. }
            | NetError::Json(_) => ErrorCode::BuildFailed,
            NetError::Internal(_) | NetError::NonFinite { .. } => ErrorCode::InternalError,
            NetError::Kernel(KernelError::InvalidArgument(_)) => ErrorCode::InvalidArgument,
            NetError::Kernel(KernelError::ShapeMismatch(_)) => ErrorCode::BuildFailed,
            NetError::Kernel(KernelError::Runtime(_)) => ErrorCode::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(NetError::EmptyData("x".into()).code(), ErrorCode::EmptyData);
        assert_eq!(
            NetError::TensorMismatch { name: "w".into(), expected: 4, found: 3 }.code(),
            ErrorCode::BuildFailed
        );
        assert_eq!(NetError::NonFinite { what: "loss".into(), index: 0 }.code().as_str(), "INTERNAL_ERROR");
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(NetError::from(io).code(), ErrorCode::InvalidArgument);
    }
}
