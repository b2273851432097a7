use std::io;

use thiserror::Error;

/// Result type for validator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for validator operations
///
/// Every error carries a kind so callers can write their recovery policy as
/// a total match: user-attributable failures end up in transaction receipts
/// while the block proceeds, infrastructure failures bubble up to the
/// processor's retry loop, and ordering violations are fatal.
#[derive(Debug, Error)]
pub enum Error {
    /// SQL could not be parsed or uses a disallowed construct
    #[error("parse error: {0}")]
    Parse(String),

    /// Caller lacks the privilege required by a statement
    #[error("not authorized: {0}")]
    Acl(String),

    /// A table-level constraint rejected the statement
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Input failed validation before reaching the database
    #[error("invalid input: {0}")]
    Validation(String),

    /// A requested entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Error when interacting with a chain RPC endpoint
    #[error("chain error: {0}")]
    Chain(String),

    /// Error when interacting with storage
    #[error("storage error: {0}")]
    Storage(String),

    /// A block arrived out of order with respect to the chain cursor
    #[error("out-of-order block: expected {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },

    /// Internal invariant violated
    #[error("logic error: {0}")]
    Logic(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other error with its source
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a new parse error
    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    /// Create a new ACL denial
    pub fn acl<S: Into<String>>(msg: S) -> Self {
        Error::Acl(msg.into())
    }

    /// Create a new constraint error
    pub fn constraint<S: Into<String>>(msg: S) -> Self {
        Error::Constraint(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a new not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a new chain error
    pub fn chain<S: Into<String>>(msg: S) -> Self {
        Error::Chain(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Error::Storage(msg.into())
    }

    /// Create a new logic error
    pub fn logic<S: Into<String>>(msg: S) -> Self {
        Error::Logic(msg.into())
    }

    /// Whether the failure is attributable to user-supplied input.
    ///
    /// User faults are recorded in the transaction receipt and the enclosing
    /// block continues; anything else aborts the block and is retried.
    pub fn is_user_fault(&self) -> bool {
        matches!(
            self,
            Error::Parse(_)
                | Error::Acl(_)
                | Error::Constraint(_)
                | Error::Validation(_)
                | Error::NotFound(_)
        )
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Logic(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Logic(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_faults_are_recoverable() {
        assert!(Error::parse("bad sql").is_user_fault());
        assert!(Error::acl("no insert privilege").is_user_fault());
        assert!(Error::constraint("row cap").is_user_fault());
        assert!(!Error::storage("disk full").is_user_fault());
        assert!(!Error::OutOfOrder { expected: 5, got: 7 }.is_user_fault());
    }
}
