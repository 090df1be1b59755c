//! Store error types

use thiserror::Error;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("missing validator for key {0:?}")]
    ValidatorMissing(String),

    #[error("invalid key value pair for key {0:?}")]
    InvalidKeyValue(String),

    #[error("node not found")]
    NodeNotFound,

    #[error("node name already bound: {0:?}")]
    NameConflict(String),

    #[error("membership modification not permitted in this transaction")]
    MembershipDenied,

    #[error("operation rejected by commit hook")]
    Rejected,

    #[error("decode error: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::ValidatorMissing("tag".into());
        assert_eq!(err.to_string(), "missing validator for key \"tag\"");

        let err = StoreError::MembershipDenied;
        assert!(err.to_string().contains("not permitted"));
    }
}
