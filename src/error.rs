//! WolfGraph Error Types

use thiserror::Error;

/// Result type alias for WolfGraph operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfGraph error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Store errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Transaction log for '{resource}' corrupted: {reason}")]
    StoreCorrupted { resource: String, reason: String },

    #[error("Store metadata error: {0}")]
    Metadata(#[from] rusqlite::Error),

    #[error("Transaction {tx_id} not found in '{resource}'")]
    TxNotFound { resource: String, tx_id: i64 },

    #[error("Transaction gap in '{resource}': expected {expected}, got {actual}")]
    TxGap {
        resource: String,
        expected: i64,
        actual: i64,
    },

    #[error("Transaction manager not ok: {0}")]
    TxManagerNotOk(String),

    #[error("Store is closed")]
    StoreClosed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Replication errors
    #[error("Store mismatch: expected {expected}, master has {actual}")]
    StoreMismatch { expected: String, actual: String },

    #[error("Branched data: {0}")]
    BranchedData(String),

    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    #[error("Lock not acquired: {0}")]
    LockTimeout(String),

    #[error("Unable to join or initialize cluster: {0}")]
    BootstrapTimeout(String),

    #[error("Store copy from master failed: {0}")]
    CopyFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote error ({code}): {message}")]
    Remote { code: u8, message: String },

    #[error("No master available")]
    NoMaster,

    // Coordination errors
    #[error("Coordination service unreachable: {0}")]
    Connectivity(String),

    #[error("Coordination session expired")]
    SessionExpired,

    #[error("Coordination node already exists: {0}")]
    NodeExists(String),

    #[error("Coordination node not found: {0}")]
    NoNode(String),

    // Network errors
    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error means the master or the coordination service
    /// could not be reached. Callers force a master refresh and retry.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Error::Connectivity(_)
                | Error::SessionExpired
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
        )
    }

    /// Check if this error reports diverged history
    pub fn is_branched(&self) -> bool {
        matches!(self, Error::BranchedData(_))
    }

    /// Check if this error should trigger an internal restart of the store
    pub fn is_kernel_panic(&self) -> bool {
        matches!(self, Error::TxManagerNotOk(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_classification() {
        assert!(Error::Connectivity("down".into()).is_connectivity());
        assert!(Error::ConnectionTimeout("host:1".into()).is_connectivity());
        assert!(Error::SessionExpired.is_connectivity());
        assert!(!Error::NoMaster.is_connectivity());
        assert!(!Error::BranchedData("x".into()).is_connectivity());
    }

    #[test]
    fn test_branched_classification() {
        assert!(Error::BranchedData("diverged".into()).is_branched());
        assert!(!Error::Deadlock("cycle".into()).is_branched());
    }
}
