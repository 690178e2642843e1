//! Error taxonomy.
//!
//! Every failure aborts the single operation before anything is committed.
//! Nothing here is retried internally.

use thiserror::Error;

use crate::keys::PublicKey;
use crate::types::StateSnapshot;

/// An operation was rejected on its inputs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid signature for sender {0}")]
    InvalidSignature(PublicKey),

    #[error("Nonce mismatch: account nonce is {expected}, transaction nonce is {got}")]
    NonceMismatch { expected: u32, got: u32 },

    #[error("Account already exists: {0}")]
    DuplicateAccount(PublicKey),

    #[error("Account not found: {0}")]
    AccountNotFound(PublicKey),

    #[error("Pending deposit queue is empty")]
    EmptyQueue,

    #[error("Proof chain mismatch: left target {left_target:?} != right source {right_source:?}")]
    ChainMismatch {
        left_target: StateSnapshot,
        right_source: StateSnapshot,
    },

    #[error("Insufficient balance: balance {balance}, amount {amount}")]
    InsufficientBalance { balance: u64, amount: u64 },

    #[error("Balance overflow crediting {0}")]
    BalanceOverflow(PublicKey),

    #[error("Nonce overflow for {0}")]
    NonceOverflow(PublicKey),

    #[error("Nothing to settle")]
    EmptySettlement,
}

/// The accumulator was set up or addressed inconsistently.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("Unsupported accumulator depth {0} (expected 1..=64)")]
    UnsupportedDepth(u8),

    #[error("Position depth {position} does not match accumulator depth {accumulator}")]
    DepthMismatch { position: u8, accumulator: u8 },

    #[error("Key collision at leaf index {index}")]
    KeyCollision { index: u64 },
}

/// Failures of the opaque proving capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProofError {
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Proof backend failure: {0}")]
    Backend(String),

    #[error("Proof verification failed: {0}")]
    VerificationFailed(String),

    #[error("Proving context has been shut down")]
    ContextClosed,
}

/// Any rollup failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RollupError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Proof(#[from] ProofError),
}

impl RollupError {
    /// Whether the caller can fix the input and resubmit.
    pub fn is_validation(&self) -> bool {
        matches!(self, RollupError::Validation(_))
    }
}

pub type Result<T, E = RollupError> = std::result::Result<T, E>;
