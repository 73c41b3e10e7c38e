//! Agora Core - Consensus primitives
//!
//! This crate provides the cryptographic and serialization building blocks
//! shared by every Agora node: content-addressed hashing, Ed25519 key
//! material, Schnorr signatures over Curve25519, base32 address strings and
//! the canonical wire codec.

pub mod address;
pub mod error;
pub mod hash;
pub mod key;
pub mod schnorr;
pub mod wire;

pub use error::CoreError;
pub use hash::{hash_bytes, hash_full, Hash, Hasher};
pub use key::{KeyPair, PublicKey, Seed, Signature};
pub use schnorr::{schnorr_sign, schnorr_verify, secret_to_scalar, SchnorrSignature};
pub use wire::{from_slice, to_vec, CanonicalDeserialize, CanonicalSerialize, WireError};

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Agora protocol version
pub const AGORA_VERSION: &str = "0.1.0";
