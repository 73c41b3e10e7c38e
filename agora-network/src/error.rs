//! Error types for the network layer

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Peer {0} is banned")]
    PeerBanned(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Consensus error: {0}")]
    Consensus(#[from] agora_consensus::ConsensusError),

    #[error("Core error: {0}")]
    Core(#[from] agora_core::CoreError),
}
