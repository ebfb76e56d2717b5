//! Error types for serving operations

use rustml_net::{ErrorCode, NetError};
use thiserror::Error;

/// Result type for serving operations
pub type ServeResult<T> = Result<T, ServeError>;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Network error: {0}")]
    Net(#[from] NetError),
}

impl ServeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ServeError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            ServeError::InvalidState(_) => ErrorCode::InvalidState,
            ServeError::Internal(_) => ErrorCode::InternalError,
            ServeError::Net(e) => e.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_codes_pass_through() {
        let err: ServeError = NetError::BuildFailed("shape".into()).into();
        assert_eq!(err.code(), ErrorCode::BuildFailed);
        assert_eq!(ServeError::InvalidState("busy".into()).code(), ErrorCode::InvalidState);
    }
}
