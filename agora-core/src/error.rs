//! Error types for core primitives

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Malformed wire data: {0}")]
    MalformedWire(#[from] crate::wire::WireError),

    #[error("Malformed address: {0}")]
    MalformedAddress(String),

    #[error("Signature verification failed")]
    SignatureInvalid,

    #[error("Cryptographic operation failed: {0}")]
    CryptoError(String),
}
