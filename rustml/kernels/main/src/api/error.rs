//! Error types for kernel entry points that validate their shapes.

use thiserror::Error;

/// Result type for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

/// Errors raised by kernels that check their inputs before running
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to configure kernel runtime: {0}")]
    Runtime(String),
}
