/// Protocol-level errors
///
/// `Invalid` and `MissingTransactions` abort a single tick or reject a single
/// message; everything else is fatal for the caller.

use crate::application::AppError;
use crate::crypto::{BLSError, ECDSAError};
use crate::storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Invalid: {0}")]
    Invalid(String),

    #[error("Stale: {0}")]
    Stale(String),

    #[error("Missing transactions")]
    MissingTransactions,

    #[error("Corrupt local state: {0}")]
    Corrupt(String),

    #[error("Group share does not match the validator set: {0}")]
    SignerMismatch(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Application error: {0}")]
    Application(String),
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

impl ConsensusError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn stale(msg: impl Into<String>) -> Self {
        Self::Stale(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Errors that abort a tick without stopping the engine
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Invalid(_) | Self::MissingTransactions)
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale(_))
    }
}

impl From<BLSError> for ConsensusError {
    fn from(e: BLSError) -> Self {
        Self::Invalid(format!("group signature: {e}"))
    }
}

impl From<ECDSAError> for ConsensusError {
    fn from(e: ECDSAError) -> Self {
        Self::Invalid(format!("validator signature: {e}"))
    }
}

impl From<AppError> for ConsensusError {
    fn from(e: AppError) -> Self {
        match e {
            AppError::Invalid(msg) => Self::Invalid(msg),
            AppError::MissingTransactions => Self::MissingTransactions,
            AppError::Internal(msg) => Self::Application(msg),
        }
    }
}

impl From<bincode::Error> for ConsensusError {
    fn from(e: bincode::Error) -> Self {
        Self::Invalid(format!("encoding: {e}"))
    }
}
