//! Schnorr signatures over Curve25519
//!
//! Enrollments are signed with the node's Curve25519 scalar derived from its
//! Ed25519 seed. Verification reconstructs the public point by decompressing
//! the Ed25519 public key, so one key pair serves both signature schemes.

use crate::wire::{take, CanonicalDeserialize, CanonicalSerialize, WireError};
use crate::{Hasher, PublicKey, Seed};
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::{clamp_integer, Scalar};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::fmt;

/// A Schnorr signature: compressed commitment point `R` and scalar `s`.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchnorrSignature {
    r: [u8; 32],
    s: [u8; 32],
}

impl SchnorrSignature {
    pub fn from_parts(r: [u8; 32], s: [u8; 32]) -> Self {
        Self { r, s }
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.r);
        out[32..].copy_from_slice(&self.s);
        out
    }
}

impl Default for SchnorrSignature {
    fn default() -> Self {
        Self {
            r: [0u8; 32],
            s: [0u8; 32],
        }
    }
}

impl fmt::Debug for SchnorrSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SchnorrSignature(0x{}..)", hex::encode(&self.r[..8]))
    }
}

impl CanonicalSerialize for SchnorrSignature {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.r);
        out.extend_from_slice(&self.s);
    }
}

impl CanonicalDeserialize for SchnorrSignature {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        let bytes = take(input, 64)?;
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);
        Ok(Self { r, s })
    }
}

/// Derive the Curve25519 scalar from an Ed25519 seed.
///
/// Follows the Ed25519 secret expansion (SHA-512 then clamp) so the scalar's
/// basepoint multiple equals the Ed25519 verifying point.
pub fn secret_to_scalar(seed: &Seed) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(seed.as_bytes());
    let digest = hasher.finalize();
    let mut lower = [0u8; 32];
    lower.copy_from_slice(&digest[..32]);
    Scalar::from_bytes_mod_order(clamp_integer(lower))
}

/// Challenge scalar `c = H(R || A || m)` reduced into the scalar field.
fn challenge(r: &[u8; 32], a: &[u8; 32], message: &[u8]) -> Scalar {
    let mut hasher = Hasher::new();
    hasher.update(r);
    hasher.update(a);
    hasher.update(message);
    Scalar::from_bytes_mod_order_wide(hasher.finish().as_bytes())
}

/// Sign a message with a Curve25519 scalar. The nonce is derived
/// deterministically from the scalar and message, so no RNG is needed.
pub fn schnorr_sign(secret: &Scalar, message: &[u8]) -> SchnorrSignature {
    let mut nonce_hasher = Hasher::new();
    nonce_hasher.update(secret.as_bytes());
    nonce_hasher.update(message);
    let r = Scalar::from_bytes_mod_order_wide(nonce_hasher.finish().as_bytes());

    let big_r = EdwardsPoint::mul_base(&r).compress().to_bytes();
    let big_a = EdwardsPoint::mul_base(secret).compress().to_bytes();
    let c = challenge(&big_r, &big_a, message);
    let s = r + c * secret;

    SchnorrSignature {
        r: big_r,
        s: s.to_bytes(),
    }
}

/// Verify a Schnorr signature against an Ed25519 public key by checking
/// `sB = R + cA`.
pub fn schnorr_verify(public_key: &PublicKey, sig: &SchnorrSignature, message: &[u8]) -> bool {
    let Some(a) = CompressedEdwardsY(*public_key.as_bytes()).decompress() else {
        return false;
    };
    if a.is_small_order() {
        return false;
    }
    let Some(s) = Option::<Scalar>::from(Scalar::from_canonical_bytes(sig.s)) else {
        return false;
    };
    let c = challenge(&sig.r, public_key.as_bytes(), message);
    let recovered = EdwardsPoint::vartime_double_scalar_mul_basepoint(&-c, &a, &s);
    recovered.compress().to_bytes() == sig.r
}
