//! Content-addressed hashing
//!
//! Every hash in Agora is the 64-byte SHA3-512 digest of a value's canonical
//! serialization. Nodes that disagree on a single byte of the encoding
//! produce different hashes and fork, so all hashing funnels through this
//! module.

use crate::wire::{take, CanonicalDeserialize, CanonicalSerialize, WireError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Sha3_512};
use std::fmt;
use std::str::FromStr;

/// Width of the hash sponge output in bytes.
pub const HASH_SIZE: usize = 64;

/// A 64-byte content-addressed hash. Equality is bytewise.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    /// The all-zero hash, used as the predecessor of the genesis block.
    pub const ZERO: Hash = Hash([0u8; HASH_SIZE]);

    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash(0x{}..)", hex::encode(&self.0[..8]))
    }
}

impl FromStr for Hash {
    type Err = crate::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s)
            .map_err(|e| crate::CoreError::CryptoError(format!("invalid hash hex: {}", e)))?;
        let bytes: [u8; HASH_SIZE] = bytes
            .try_into()
            .map_err(|_| crate::CoreError::CryptoError("hash must be 64 bytes".to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl CanonicalSerialize for Hash {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }
}

impl CanonicalDeserialize for Hash {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        let bytes = take(input, HASH_SIZE)?;
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }
}

/// Incremental hash sponge for multi-part values such as merkle nodes and
/// UTXO keys.
#[derive(Default)]
pub struct Hasher {
    inner: Sha3_512,
}

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn finish(self) -> Hash {
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(&self.inner.finalize());
        Hash(out)
    }
}

/// Hash a raw byte slice.
pub fn hash_bytes(bytes: &[u8]) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finish()
}

/// Hash a value by feeding its canonical serialization into the sponge.
pub fn hash_full<T: CanonicalSerialize>(value: &T) -> Hash {
    let mut buf = Vec::new();
    value.encode(&mut buf);
    hash_bytes(&buf)
}
