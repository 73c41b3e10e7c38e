//! Ed25519 key material
//!
//! Key pairs sign with deterministic nonces; seeds are zeroed on drop and
//! never appear in `Debug` output.

use crate::address::{self, VERSION_ACCOUNT_ID, VERSION_SEED};
use crate::wire::{take, CanonicalDeserialize, CanonicalSerialize, WireError};
use crate::{CoreError, Result};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroize;

/// A 32-byte Ed25519 seed. Renders as an 'S…' base32 string.
#[derive(Clone, PartialEq, Eq)]
pub struct Seed([u8; 32]);

impl Seed {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", address::encode(VERSION_SEED, &self.0))
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seed").field("bytes", &"[REDACTED]").finish()
    }
}

impl FromStr for Seed {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(address::decode(VERSION_SEED, s)?))
    }
}

impl Drop for Seed {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// A 32-byte Ed25519 public key. Renders as a 56-character 'G…' string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Verify a detached signature. Returns false on any failure, including
    /// key bytes that are not a valid curve point; never errors.
    pub fn verify(&self, signature: &Signature, message: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify(message, &sig).is_ok()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", address::encode(VERSION_ACCOUNT_ID, &self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

impl FromStr for PublicKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(address::decode(VERSION_ACCOUNT_ID, s)?))
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl CanonicalSerialize for PublicKey {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }
}

impl CanonicalDeserialize for PublicKey {
    fn decode(input: &mut &[u8]) -> std::result::Result<Self, WireError> {
        let bytes = take(input, 32)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }
}

/// A 64-byte detached Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self([0u8; 64])
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature(0x{}..)", hex::encode(&self.0[..8]))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))?;
        Ok(Self(bytes))
    }
}

impl CanonicalSerialize for Signature {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }
}

impl CanonicalDeserialize for Signature {
    fn decode(input: &mut &[u8]) -> std::result::Result<Self, WireError> {
        let bytes = take(input, 64)?;
        let mut out = [0u8; 64];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }
}

/// An Ed25519 key pair: the public address plus the signing key.
#[derive(Clone)]
pub struct KeyPair {
    /// Public verifying key.
    pub address: PublicKey,
    signing: SigningKey,
    seed: Seed,
}

impl KeyPair {
    /// Deterministically derive a key pair from a seed.
    pub fn from_seed(seed: &Seed) -> Self {
        let signing = SigningKey::from_bytes(seed.as_bytes());
        let address = PublicKey(signing.verifying_key().to_bytes());
        Self {
            address,
            signing,
            seed: seed.clone(),
        }
    }

    /// Generate a key pair from the system RNG.
    pub fn random() -> Self {
        let signing = SigningKey::generate(&mut rand::thread_rng());
        let seed = Seed(signing.to_bytes());
        let address = PublicKey(signing.verifying_key().to_bytes());
        Self {
            address,
            signing,
            seed,
        }
    }

    /// Sign a message (deterministic, no RNG needed).
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message).to_bytes())
    }

    pub fn seed(&self) -> &Seed {
        &self.seed
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("address", &self.address)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}
