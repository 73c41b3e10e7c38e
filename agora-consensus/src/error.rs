//! Error types for the consensus core

use agora_core::Hash;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Core error: {0}")]
    Core(#[from] agora_core::CoreError),

    #[error("UTXO not found: {0:?}")]
    UtxoNotFound(Hash),

    #[error("Double spend of {0:?}")]
    DoubleSpend(Hash),

    #[error("Duplicate transaction")]
    DuplicateTransaction,

    #[error("Insufficient stake: need {needed}, have {available}")]
    InsufficientStake { needed: u64, available: u64 },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Fatal ledger fault: {0}")]
    Fatal(String),
}

impl From<agora_core::WireError> for ConsensusError {
    fn from(e: agora_core::WireError) -> Self {
        ConsensusError::Core(agora_core::CoreError::MalformedWire(e))
    }
}
