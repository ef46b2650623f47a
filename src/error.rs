//! Error types for the bridge orchestrator

use thiserror::Error;

/// Main error type for the bridge orchestrator
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Chain connection error for {chain}: {message}")]
    ChainConnection { chain: String, message: String },

    #[error("Broadcast error on {chain}: {message}")]
    Broadcast { chain: String, message: String },

    #[error("Internal broadcast rejected: {0}")]
    InternalBroadcast(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Transition {transition} cannot run from state {state}")]
    InvalidTransition { transition: String, state: String },

    #[error("Transition registration failed: {0}")]
    Registration(String),

    #[error("State {0} is not declared by the engine")]
    UnknownState(String),

    #[error("Tracker {name} not found")]
    TrackerNotFound { name: String },

    #[error("Tracker {name} already exists")]
    TrackerExists { name: String },

    #[error("Job {job_id} not found")]
    JobNotFound { job_id: String },

    #[error("Lock script {address} not found")]
    LockScriptNotFound { address: String },

    #[error("Invalid multisig threshold {m} for {n} signers")]
    InvalidThreshold { m: usize, n: usize },

    #[error("Signature index {index} out of range for {n} signers")]
    SignatureIndexOutOfRange { index: usize, n: usize },

    #[error("Signature for slot {index} claims address {claimed}, expected {expected}")]
    SignerMismatch {
        index: usize,
        claimed: String,
        expected: String,
    },

    #[error("Slot {index} already holds a different signature")]
    SlotAlreadySigned { index: usize },

    #[error("Empty signature for slot {index}")]
    EmptySignature { index: usize },

    #[error("{address} is not a validator")]
    NotAValidator { address: String },

    #[error("Transaction is not signed by {address}")]
    Unauthorized { address: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Sled(_)
                | BridgeError::Serialization(_)
                | BridgeError::ChainConnection { .. }
                | BridgeError::Broadcast { .. }
                | BridgeError::InternalBroadcast(_)
                | BridgeError::Timeout { .. }
                | BridgeError::TrackerNotFound { .. }
                | BridgeError::LockScriptNotFound { .. }
        )
    }

    /// Malformed requests that must be rejected rather than retried
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BridgeError::InvalidThreshold { .. }
                | BridgeError::SignatureIndexOutOfRange { .. }
                | BridgeError::SignerMismatch { .. }
                | BridgeError::SlotAlreadySigned { .. }
                | BridgeError::EmptySignature { .. }
                | BridgeError::NotAValidator { .. }
                | BridgeError::TrackerExists { .. }
                | BridgeError::Unauthorized { .. }
                | BridgeError::Validation(_)
        )
    }

    /// The transition does not apply yet; retried on the next block
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, BridgeError::InvalidTransition { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BridgeError::TrackerNotFound { .. }
                | BridgeError::JobNotFound { .. }
                | BridgeError::LockScriptNotFound { .. }
        )
    }

    pub(crate) fn invalid_transition(transition: &str, state: impl std::fmt::Debug) -> Self {
        BridgeError::InvalidTransition {
            transition: transition.to_string(),
            state: format!("{:?}", state),
        }
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories_are_disjoint() {
        let invalid = BridgeError::invalid_transition("FINALIZE", "New");
        assert!(invalid.is_invalid_transition());
        assert!(!invalid.is_retryable());
        assert!(!invalid.is_validation());

        let mismatch = BridgeError::SignerMismatch {
            index: 1,
            claimed: "aa".to_string(),
            expected: "bb".to_string(),
        };
        assert!(mismatch.is_validation());
        assert!(!mismatch.is_retryable());

        let missing = BridgeError::JobNotFound {
            job_id: "t#1".to_string(),
        };
        assert!(missing.is_not_found());
        assert!(!missing.is_retryable());

        let timeout = BridgeError::Timeout {
            operation: "bitcoin getblockcount".to_string(),
        };
        assert!(timeout.is_retryable());
        assert!(!timeout.is_not_found());
    }
}
