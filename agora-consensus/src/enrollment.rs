//! Validator enrollment over frozen stake
//!
//! A validator commits a freeze output plus the head of a hash chain; one
//! pre-image is revealed per block of participation, tail-first, and every
//! reveal must re-hash onto the committed head.

use crate::utxo::Utxo;
use crate::{ChainParams, ConsensusError, Result};
use agora_core::wire::{
    read_u32, write_u32, CanonicalDeserialize, CanonicalSerialize, WireError,
};
use agora_core::{
    hash_bytes, schnorr_sign, schnorr_verify, Hash, Hasher, KeyPair, PublicKey, SchnorrSignature,
    Seed,
};
use crate::transaction::TxType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// A validator's stake commitment for one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    /// Key of the frozen output backing the enrollment
    pub utxo_key: Hash,

    /// Head of the pre-image chain, revealed backwards over the cycle
    pub random_seed: Hash,

    /// Number of blocks the enrollment stays active
    pub cycle_length: u32,

    /// Schnorr signature by the enroller's Curve25519 scalar
    pub enroll_sig: SchnorrSignature,
}

impl Enrollment {
    /// Bytes the enrollment signature authenticates.
    pub fn signature_payload(utxo_key: &Hash, random_seed: &Hash, cycle_length: u32) -> Vec<u8> {
        let mut out = Vec::new();
        utxo_key.encode(&mut out);
        random_seed.encode(&mut out);
        write_u32(&mut out, cycle_length);
        out
    }

    /// Verify the enrollment signature against the stake owner's key.
    pub fn verify(&self, owner: &PublicKey) -> bool {
        let payload = Self::signature_payload(&self.utxo_key, &self.random_seed, self.cycle_length);
        schnorr_verify(owner, &self.enroll_sig, &payload)
    }
}

impl CanonicalSerialize for Enrollment {
    fn encode(&self, out: &mut Vec<u8>) {
        self.utxo_key.encode(out);
        self.random_seed.encode(out);
        write_u32(out, self.cycle_length);
        self.enroll_sig.encode(out);
    }
}

impl CanonicalDeserialize for Enrollment {
    fn decode(input: &mut &[u8]) -> std::result::Result<Self, WireError> {
        Ok(Self {
            utxo_key: Hash::decode(input)?,
            random_seed: Hash::decode(input)?,
            cycle_length: read_u32(input)?,
            enroll_sig: SchnorrSignature::decode(input)?,
        })
    }
}

/// A revealed pre-image for one enrolled validator at one height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreImage {
    /// Enrollment the image belongs to
    pub utxo_key: Hash,

    /// The revealed chain element
    pub hash: Hash,

    /// Height the reveal is valid for
    pub height: u64,
}

impl CanonicalSerialize for PreImage {
    fn encode(&self, out: &mut Vec<u8>) {
        self.utxo_key.encode(out);
        self.hash.encode(out);
        self.height.encode(out);
    }
}

impl CanonicalDeserialize for PreImage {
    fn decode(input: &mut &[u8]) -> std::result::Result<Self, WireError> {
        Ok(Self {
            utxo_key: Hash::decode(input)?,
            hash: Hash::decode(input)?,
            height: u64::decode(input)?,
        })
    }
}

/// The full hash chain a validator commits to at enrollment.
///
/// `h_0` is derived from the node seed and the staked UTXO, each link is the
/// hash of the previous one, and the last link is the committed head.
#[derive(Debug, Clone)]
pub struct PreImageChain {
    images: Vec<Hash>,
}

impl PreImageChain {
    pub fn new(seed: &Seed, utxo_key: &Hash, cycle_length: u32) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(seed.as_bytes());
        hasher.update(utxo_key.as_bytes());
        hasher.update(&cycle_length.to_le_bytes());
        let mut images = Vec::with_capacity(cycle_length as usize);
        let mut current = hasher.finish();
        for _ in 0..cycle_length {
            images.push(current);
            current = hash_bytes(current.as_bytes());
        }
        Self { images }
    }

    /// The committed head, `h_{cycle-1}`.
    pub fn commitment(&self) -> Hash {
        *self.images.last().expect("chain is never empty")
    }

    /// The image revealed `offset` blocks after enrollment.
    pub fn reveal(&self, offset: u64) -> Option<Hash> {
        let len = self.images.len() as u64;
        if offset >= len {
            return None;
        }
        Some(self.images[(len - 1 - offset) as usize])
    }
}

/// Build a signed enrollment over a frozen output.
pub fn make_enrollment(key_pair: &KeyPair, utxo_key: &Hash, cycle_length: u32) -> Enrollment {
    let chain = PreImageChain::new(key_pair.seed(), utxo_key, cycle_length);
    let random_seed = chain.commitment();
    let payload = Enrollment::signature_payload(utxo_key, &random_seed, cycle_length);
    let scalar = agora_core::secret_to_scalar(key_pair.seed());
    Enrollment {
        utxo_key: *utxo_key,
        random_seed,
        cycle_length,
        enroll_sig: schnorr_sign(&scalar, &payload),
    }
}

/// Check an enrollment against the output it claims to stake.
pub fn verify_enrollment(
    enrollment: &Enrollment,
    utxo: &Utxo,
    params: &ChainParams,
) -> Result<()> {
    if enrollment.cycle_length == 0 {
        return Err(ConsensusError::ProtocolViolation(
            "enrollment cycle length is zero".to_string(),
        ));
    }
    if utxo.tx_type != TxType::Freeze {
        return Err(ConsensusError::ProtocolViolation(
            "enrollment does not reference a freeze output".to_string(),
        ));
    }
    if utxo.output.value < params.min_freeze_amount {
        return Err(ConsensusError::InsufficientStake {
            needed: params.min_freeze_amount,
            available: utxo.output.value,
        });
    }
    if !enrollment.verify(&utxo.output.address) {
        return Err(ConsensusError::Core(agora_core::CoreError::SignatureInvalid));
    }
    Ok(())
}

/// An active validator.
#[derive(Debug, Clone)]
pub struct ValidatorEntry {
    /// The externalized enrollment
    pub enrollment: Enrollment,

    /// Owner of the frozen output
    pub address: PublicKey,

    /// Height of the block that carried the enrollment
    pub enrolled_at: u64,

    /// Most recently accepted pre-image
    pub last_image: Hash,

    /// Height the last image was accepted for
    pub last_image_height: u64,
}

/// Tracks active validators, pending enrollments and this node's own
/// pre-image chains.
#[derive(Debug)]
pub struct EnrollmentManager {
    params: ChainParams,
    active: BTreeMap<Hash, ValidatorEntry>,
    candidates: BTreeMap<Hash, Enrollment>,
    chains: HashMap<Hash, PreImageChain>,
}

impl EnrollmentManager {
    pub fn new(params: ChainParams) -> Self {
        Self {
            params,
            active: BTreeMap::new(),
            candidates: BTreeMap::new(),
            chains: HashMap::new(),
        }
    }

    /// Build an enrollment for one of this node's own frozen outputs and
    /// retain the chain so pre-images can be revealed later.
    pub fn make_enrollment(
        &mut self,
        key_pair: &KeyPair,
        utxo_key: &Hash,
        cycle_length: u32,
    ) -> Enrollment {
        let chain = PreImageChain::new(key_pair.seed(), utxo_key, cycle_length);
        self.chains.insert(*utxo_key, chain);
        make_enrollment(key_pair, utxo_key, cycle_length)
    }

    /// Admit a not-yet-externalized enrollment into the candidate pool.
    pub fn add_candidate(&mut self, enrollment: Enrollment, utxo: &Utxo) -> Result<()> {
        verify_enrollment(&enrollment, utxo, &self.params)?;
        debug!(utxo_key = %enrollment.utxo_key, "enrollment candidate admitted");
        self.candidates.insert(enrollment.utxo_key, enrollment);
        Ok(())
    }

    /// Candidate enrollments in `utxo_key` order, ready for block building.
    pub fn candidates(&self) -> Vec<Enrollment> {
        self.candidates.values().cloned().collect()
    }

    pub fn get_candidate(&self, utxo_key: &Hash) -> Option<&Enrollment> {
        self.candidates.get(utxo_key)
    }

    /// Drop candidates whose staked output the resolver no longer knows.
    pub fn prune_candidates<F: Fn(&Hash) -> bool>(&mut self, resolve: F) {
        self.candidates.retain(|key, _| resolve(key));
    }

    /// Activate an externalized enrollment. Re-enrolling an existing key
    /// restarts its cycle.
    pub fn enroll(&mut self, enrollment: &Enrollment, address: PublicKey, height: u64) {
        self.candidates.remove(&enrollment.utxo_key);
        self.active.insert(
            enrollment.utxo_key,
            ValidatorEntry {
                enrollment: enrollment.clone(),
                address,
                enrolled_at: height,
                last_image: enrollment.random_seed,
                last_image_height: height,
            },
        );
    }

    /// Number of validators still active at the given height.
    pub fn validator_count(&self, height: u64) -> usize {
        self.active
            .values()
            .filter(|entry| entry.enrolled_at + u64::from(entry.enrollment.cycle_length) > height)
            .count()
    }

    /// Addresses of validators active at the given height, in key order.
    pub fn active_validators(&self, height: u64) -> Vec<PublicKey> {
        self.active
            .values()
            .filter(|entry| entry.enrolled_at + u64::from(entry.enrollment.cycle_length) > height)
            .map(|entry| entry.address)
            .collect()
    }

    /// Drop enrollments whose cycle has run out.
    pub fn expire(&mut self, height: u64) {
        let chains = &mut self.chains;
        self.active.retain(|key, entry| {
            let live = entry.enrolled_at + u64::from(entry.enrollment.cycle_length) > height;
            if !live {
                chains.remove(key);
            }
            live
        });
    }

    /// Accept a revealed pre-image.
    ///
    /// The image must re-hash onto the previously accepted image within the
    /// height distance; anything else is rejected.
    pub fn receive_preimage(&mut self, preimage: &PreImage) -> Result<()> {
        let entry = self.active.get_mut(&preimage.utxo_key).ok_or_else(|| {
            ConsensusError::ProtocolViolation("pre-image for unknown enrollment".to_string())
        })?;
        let Some(distance) = preimage.height.checked_sub(entry.last_image_height) else {
            return Err(ConsensusError::ProtocolViolation(
                "pre-image older than last accepted".to_string(),
            ));
        };
        if preimage.height >= entry.enrolled_at + u64::from(entry.enrollment.cycle_length) {
            return Err(ConsensusError::ProtocolViolation(
                "pre-image beyond enrollment cycle".to_string(),
            ));
        }
        if distance == 0 {
            if preimage.hash == entry.last_image {
                return Ok(());
            }
            return Err(ConsensusError::ProtocolViolation(
                "conflicting pre-image for height".to_string(),
            ));
        }
        let mut acc = preimage.hash;
        for _ in 0..distance {
            acc = hash_bytes(acc.as_bytes());
        }
        if acc != entry.last_image {
            return Err(ConsensusError::ProtocolViolation(
                "pre-image does not hash onto commitment".to_string(),
            ));
        }
        entry.last_image = preimage.hash;
        entry.last_image_height = preimage.height;
        Ok(())
    }

    /// The pre-image this node should reveal for one of its own
    /// enrollments at the given height.
    pub fn our_preimage(&self, utxo_key: &Hash, height: u64) -> Option<PreImage> {
        let entry = self.active.get(utxo_key)?;
        let chain = self.chains.get(utxo_key)?;
        let offset = height.checked_sub(entry.enrolled_at)?;
        Some(PreImage {
            utxo_key: *utxo_key,
            hash: chain.reveal(offset)?,
            height,
        })
    }

    pub fn is_active(&self, utxo_key: &Hash, height: u64) -> bool {
        self.active
            .get(utxo_key)
            .is_some_and(|e| e.enrolled_at + u64::from(e.enrollment.cycle_length) > height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Output;
    use agora_core::hash_bytes;

    fn freeze_utxo(value: u64, address: PublicKey) -> Utxo {
        Utxo {
            unlock_height: 0,
            tx_type: TxType::Freeze,
            output: Output { value, address },
        }
    }

    fn params() -> ChainParams {
        ChainParams {
            validator_cycle: 4,
            ..ChainParams::default()
        }
    }

    #[test]
    fn test_chain_commitment_is_head() {
        let kp = KeyPair::random();
        let key = hash_bytes(b"stake");
        let chain = PreImageChain::new(kp.seed(), &key, 5);

        // Revealing k steps in, hashing k times recovers the head.
        let mut acc = chain.reveal(3).unwrap();
        for _ in 0..3 {
            acc = hash_bytes(acc.as_bytes());
        }
        assert_eq!(acc, chain.commitment());
        assert_eq!(chain.reveal(0).unwrap(), chain.commitment());
        assert!(chain.reveal(5).is_none());
    }

    #[test]
    fn test_enrollment_signature_verifies_for_owner_only() {
        let kp = KeyPair::random();
        let key = hash_bytes(b"stake");
        let enrollment = make_enrollment(&kp, &key, 4);

        assert!(enrollment.verify(&kp.address));
        assert!(!enrollment.verify(&KeyPair::random().address));
    }

    #[test]
    fn test_enrollment_round_trip() {
        let kp = KeyPair::random();
        let enrollment = make_enrollment(&kp, &hash_bytes(b"stake"), 4);
        let bytes = agora_core::to_vec(&enrollment);
        let back: Enrollment = agora_core::from_slice(&bytes).unwrap();
        assert_eq!(back, enrollment);
    }

    #[test]
    fn test_verify_enrollment_requires_freeze_stake() {
        let kp = KeyPair::random();
        let key = hash_bytes(b"stake");
        let enrollment = make_enrollment(&kp, &key, 4);
        let p = params();

        let mut utxo = freeze_utxo(p.min_freeze_amount, kp.address);
        verify_enrollment(&enrollment, &utxo, &p).unwrap();

        utxo.tx_type = TxType::Payment;
        assert!(matches!(
            verify_enrollment(&enrollment, &utxo, &p),
            Err(ConsensusError::ProtocolViolation(_))
        ));

        utxo.tx_type = TxType::Freeze;
        utxo.output.value = p.min_freeze_amount - 1;
        assert!(matches!(
            verify_enrollment(&enrollment, &utxo, &p),
            Err(ConsensusError::InsufficientStake { .. })
        ));
    }

    #[test]
    fn test_validator_count_tracks_cycle() {
        let kp = KeyPair::random();
        let key = hash_bytes(b"stake");
        let p = params();
        let mut manager = EnrollmentManager::new(p.clone());
        let enrollment = manager.make_enrollment(&kp, &key, p.validator_cycle);
        manager.enroll(&enrollment, kp.address, 2);

        assert_eq!(manager.validator_count(2), 1);
        assert_eq!(manager.validator_count(5), 1);
        assert_eq!(manager.validator_count(6), 0);

        manager.expire(6);
        assert_eq!(manager.validator_count(2), 0);
    }

    #[test]
    fn test_reenrollment_restarts_cycle() {
        let kp = KeyPair::random();
        let key = hash_bytes(b"stake");
        let p = params();
        let mut manager = EnrollmentManager::new(p.clone());
        let enrollment = manager.make_enrollment(&kp, &key, p.validator_cycle);
        manager.enroll(&enrollment, kp.address, 0);
        assert_eq!(manager.validator_count(4), 0);

        let again = manager.make_enrollment(&kp, &key, p.validator_cycle);
        manager.enroll(&again, kp.address, 4);
        assert_eq!(manager.validator_count(4), 1);
        assert_eq!(manager.validator_count(7), 1);
    }

    #[test]
    fn test_candidates_sorted_by_utxo_key() {
        let p = params();
        let mut manager = EnrollmentManager::new(p.clone());
        for name in [&b"a"[..], b"b", b"c"] {
            let kp = KeyPair::random();
            let key = hash_bytes(name);
            let enrollment = manager.make_enrollment(&kp, &key, p.validator_cycle);
            manager
                .add_candidate(enrollment, &freeze_utxo(p.min_freeze_amount, kp.address))
                .unwrap();
        }
        let keys: Vec<Hash> = manager.candidates().iter().map(|e| e.utxo_key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_preimage_acceptance() {
        let kp = KeyPair::random();
        let key = hash_bytes(b"stake");
        let p = params();
        let mut manager = EnrollmentManager::new(p.clone());
        let enrollment = manager.make_enrollment(&kp, &key, p.validator_cycle);
        manager.enroll(&enrollment, kp.address, 0);

        // Reveal for height 2, skipping height 1.
        let reveal = manager.our_preimage(&key, 2).unwrap();
        manager.receive_preimage(&reveal).unwrap();

        // A bogus image is rejected.
        let bogus = PreImage {
            utxo_key: key,
            hash: hash_bytes(b"bogus"),
            height: 3,
        };
        assert!(matches!(
            manager.receive_preimage(&bogus),
            Err(ConsensusError::ProtocolViolation(_))
        ));

        // Replaying the accepted image is fine; conflicting is not.
        manager.receive_preimage(&reveal).unwrap();
        let conflicting = PreImage {
            hash: hash_bytes(b"other"),
            ..reveal
        };
        assert!(manager.receive_preimage(&conflicting).is_err());
    }

    #[test]
    fn test_preimage_beyond_cycle_rejected() {
        let kp = KeyPair::random();
        let key = hash_bytes(b"stake");
        let p = params();
        let mut manager = EnrollmentManager::new(p.clone());
        let enrollment = manager.make_enrollment(&kp, &key, p.validator_cycle);
        manager.enroll(&enrollment, kp.address, 0);

        assert!(manager.our_preimage(&key, 4).is_none());
        let too_far = PreImage {
            utxo_key: key,
            hash: hash_bytes(b"x"),
            height: 4,
        };
        assert!(matches!(
            manager.receive_preimage(&too_far),
            Err(ConsensusError::ProtocolViolation(_))
        ));
    }
}
