//! Consensus driver: quorum tracking and envelope exchange
//!
//! The federated-agreement engine proper is an external collaborator; this
//! driver implements the surface the node needs around it. It derives the
//! quorum set from configuration, translates block candidates to and from
//! signed envelopes, tallies agreement for the current slot and resolves an
//! externalized hash back to the concrete block. The driver performs no
//! I/O: callers broadcast the envelopes it returns.

use crate::block::Block;
use crate::{ConsensusError, Result};
use agora_core::wire::{CanonicalDeserialize, CanonicalSerialize, WireError};
use agora_core::{CoreError, Hash, KeyPair, PublicKey, Signature};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// The set of validators whose agreement this node accepts.
///
/// The historic default demands unanimity (`threshold = n`); the BFT-safe
/// `⌈2n/3⌉ + 1` is available through [`QuorumSet::bft_threshold`] until
/// governance settles the question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumSet {
    pub threshold: u32,
    pub validators: Vec<PublicKey>,
}

impl QuorumSet {
    /// Quorum over all known validators with the historic 100% threshold.
    pub fn new(validators: Vec<PublicKey>) -> Self {
        let threshold = validators.len() as u32;
        Self {
            threshold,
            validators,
        }
    }

    /// Quorum with an explicit threshold in `1..=n`.
    pub fn with_threshold(validators: Vec<PublicKey>, threshold: u32) -> Result<Self> {
        if threshold == 0 || threshold as usize > validators.len() {
            return Err(ConsensusError::ProtocolViolation(format!(
                "threshold {} out of range for {} validators",
                threshold,
                validators.len()
            )));
        }
        Ok(Self {
            threshold,
            validators,
        })
    }

    /// The BFT-safe threshold `⌈2n/3⌉ + 1`.
    pub fn bft_threshold(n: u32) -> u32 {
        (2 * n).div_ceil(3) + 1
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.validators.contains(key)
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

/// A signed statement that one validator backs one candidate for one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Slot, i.e. the height being agreed on
    pub height: u64,

    /// Header hash of the backed candidate block
    pub block_hash: Hash,

    /// The validator making the statement
    pub signer: PublicKey,

    /// Ed25519 signature over height and hash
    pub signature: Signature,
}

impl Envelope {
    fn payload(height: u64, block_hash: &Hash) -> Vec<u8> {
        let mut out = Vec::new();
        height.encode(&mut out);
        block_hash.encode(&mut out);
        out
    }

    pub fn new(height: u64, block_hash: Hash, key_pair: &KeyPair) -> Self {
        let signature = key_pair.sign(&Self::payload(height, &block_hash));
        Self {
            height,
            block_hash,
            signer: key_pair.address,
            signature,
        }
    }

    pub fn verify(&self) -> bool {
        self.signer
            .verify(&self.signature, &Self::payload(self.height, &self.block_hash))
    }
}

impl CanonicalSerialize for Envelope {
    fn encode(&self, out: &mut Vec<u8>) {
        self.height.encode(out);
        self.block_hash.encode(out);
        self.signer.encode(out);
        self.signature.encode(out);
    }
}

impl CanonicalDeserialize for Envelope {
    fn decode(input: &mut &[u8]) -> std::result::Result<Self, WireError> {
        Ok(Self {
            height: u64::decode(input)?,
            block_hash: Hash::decode(input)?,
            signer: PublicKey::decode(input)?,
            signature: Signature::decode(input)?,
        })
    }
}

/// Per-slot agreement state for one node.
pub struct ConsensusDriver {
    key_pair: KeyPair,
    quorum: QuorumSet,
    height: u64,
    votes: HashMap<PublicKey, Hash>,
    candidates: HashMap<Hash, Block>,
    externalized: Option<Hash>,
}

impl ConsensusDriver {
    pub fn new(key_pair: KeyPair, quorum: QuorumSet, next_height: u64) -> Self {
        Self {
            key_pair,
            quorum,
            height: next_height,
            votes: HashMap::new(),
            candidates: HashMap::new(),
            externalized: None,
        }
    }

    /// The slot currently being agreed on.
    pub fn slot_height(&self) -> u64 {
        self.height
    }

    pub fn quorum(&self) -> &QuorumSet {
        &self.quorum
    }

    /// Back a candidate block for the current slot. Returns the envelope to
    /// broadcast.
    pub fn nominate(&mut self, block: Block) -> Envelope {
        let hash = block.hash();
        debug!(height = self.height, %hash, "nominating candidate");
        self.candidates.insert(hash, block);
        self.votes.insert(self.key_pair.address, hash);
        Envelope::new(self.height, hash, &self.key_pair)
    }

    /// Ingest a peer envelope. Returns the externalized hash once the
    /// threshold agrees on one value for the current slot.
    pub fn receive(&mut self, envelope: &Envelope) -> Result<Option<Hash>> {
        if envelope.height != self.height {
            // Stale or future slots are ignored; gossip is eventually
            // consistent.
            debug!(
                got = envelope.height,
                current = self.height,
                "envelope for another slot"
            );
            return Ok(None);
        }
        if !self.quorum.contains(&envelope.signer) {
            warn!(signer = %envelope.signer, "envelope from outside the quorum");
            return Err(ConsensusError::ProtocolViolation(
                "envelope signer is not in the quorum".to_string(),
            ));
        }
        if !envelope.verify() {
            return Err(ConsensusError::Core(CoreError::SignatureInvalid));
        }
        self.votes.insert(envelope.signer, envelope.block_hash);
        Ok(self.tally())
    }

    fn tally(&mut self) -> Option<Hash> {
        if let Some(hash) = self.externalized {
            return Some(hash);
        }
        let mut counts: HashMap<Hash, u32> = HashMap::new();
        for hash in self.votes.values() {
            *counts.entry(*hash).or_default() += 1;
        }
        let (hash, votes) = counts.into_iter().max_by_key(|(_, n)| *n)?;
        if votes >= self.quorum.threshold {
            info!(height = self.height, %hash, votes, "slot externalized");
            self.externalized = Some(hash);
            return Some(hash);
        }
        None
    }

    /// The concrete block behind an externalized hash, if this node holds
    /// the candidate. Nodes that do not must fetch it from a peer.
    pub fn resolve(&self, hash: &Hash) -> Option<Block> {
        self.candidates.get(hash).cloned()
    }

    /// Move to the next slot, dropping this slot's votes and candidates.
    pub fn advance(&mut self, next_height: u64) {
        self.height = next_height;
        self.votes.clear();
        self.candidates.clear();
        self.externalized = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::genesis_block;
    use crate::ChainParams;
    use agora_core::Seed;

    fn fixture(n: u8) -> (Vec<KeyPair>, QuorumSet, Block) {
        let seeds: Vec<Seed> = (0..n).map(|i| Seed::from_bytes([i + 1; 32])).collect();
        let key_pairs: Vec<KeyPair> = seeds.iter().map(KeyPair::from_seed).collect();
        let quorum = QuorumSet::new(key_pairs.iter().map(|kp| kp.address).collect());
        let genesis = genesis_block(&seeds, &ChainParams::default());
        (key_pairs, quorum, genesis)
    }

    #[test]
    fn test_quorum_defaults_to_unanimity() {
        let (_, quorum, _) = fixture(3);
        assert_eq!(quorum.threshold, 3);
    }

    #[test]
    fn test_bft_threshold() {
        assert_eq!(QuorumSet::bft_threshold(3), 3);
        assert_eq!(QuorumSet::bft_threshold(4), 4);
        assert_eq!(QuorumSet::bft_threshold(6), 5);
        assert_eq!(QuorumSet::bft_threshold(9), 7);
    }

    #[test]
    fn test_with_threshold_bounds() {
        let (_, quorum, _) = fixture(3);
        assert!(QuorumSet::with_threshold(quorum.validators.clone(), 0).is_err());
        assert!(QuorumSet::with_threshold(quorum.validators.clone(), 4).is_err());
        assert!(QuorumSet::with_threshold(quorum.validators, 2).is_ok());
    }

    #[test]
    fn test_envelope_signature() {
        let (key_pairs, _, genesis) = fixture(2);
        let envelope = Envelope::new(1, genesis.hash(), &key_pairs[0]);
        assert!(envelope.verify());

        let mut forged = envelope.clone();
        forged.height = 2;
        assert!(!forged.verify());
    }

    #[test]
    fn test_envelope_round_trip() {
        let (key_pairs, _, genesis) = fixture(2);
        let envelope = Envelope::new(1, genesis.hash(), &key_pairs[0]);
        let back: Envelope = agora_core::from_slice(&agora_core::to_vec(&envelope)).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_unanimous_agreement_externalizes() {
        let (key_pairs, quorum, genesis) = fixture(2);
        let candidate = Block::make(&genesis.header, vec![], vec![]);

        let mut alice = ConsensusDriver::new(key_pairs[0].clone(), quorum.clone(), 1);
        let mut bob = ConsensusDriver::new(key_pairs[1].clone(), quorum, 1);

        let env_a = alice.nominate(candidate.clone());
        let env_b = bob.nominate(candidate.clone());

        let externalized = alice.receive(&env_b).unwrap().unwrap();
        assert_eq!(externalized, candidate.hash());
        assert_eq!(bob.receive(&env_a).unwrap().unwrap(), candidate.hash());
        assert_eq!(alice.resolve(&externalized).unwrap(), candidate);
    }

    #[test]
    fn test_split_votes_do_not_externalize() {
        let (key_pairs, quorum, genesis) = fixture(2);
        let a = Block::make(&genesis.header, vec![], vec![]);
        let mut other_header = genesis.header.clone();
        other_header.height = 7;
        let b = Block::make(&other_header, vec![], vec![]);

        let mut alice = ConsensusDriver::new(key_pairs[0].clone(), quorum, 1);
        alice.nominate(a);
        let env_b = Envelope::new(1, b.hash(), &key_pairs[1]);
        assert!(alice.receive(&env_b).unwrap().is_none());
    }

    #[test]
    fn test_outsider_envelope_rejected() {
        let (key_pairs, quorum, genesis) = fixture(2);
        let mut driver = ConsensusDriver::new(key_pairs[0].clone(), quorum, 1);
        let outsider = KeyPair::random();
        let envelope = Envelope::new(1, genesis.hash(), &outsider);
        assert!(matches!(
            driver.receive(&envelope),
            Err(ConsensusError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_tampered_envelope_rejected() {
        let (key_pairs, quorum, genesis) = fixture(2);
        let mut driver = ConsensusDriver::new(key_pairs[0].clone(), quorum, 1);
        let mut envelope = Envelope::new(1, genesis.hash(), &key_pairs[1]);
        envelope.block_hash = agora_core::hash_bytes(b"swapped");
        assert!(matches!(
            driver.receive(&envelope),
            Err(ConsensusError::Core(CoreError::SignatureInvalid))
        ));
    }

    #[test]
    fn test_other_slot_envelopes_ignored() {
        let (key_pairs, quorum, genesis) = fixture(2);
        let mut driver = ConsensusDriver::new(key_pairs[0].clone(), quorum, 1);
        let envelope = Envelope::new(9, genesis.hash(), &key_pairs[1]);
        assert!(driver.receive(&envelope).unwrap().is_none());
    }

    #[test]
    fn test_advance_resets_slot() {
        let (key_pairs, quorum, genesis) = fixture(2);
        let candidate = Block::make(&genesis.header, vec![], vec![]);
        let mut alice = ConsensusDriver::new(key_pairs[0].clone(), quorum, 1);
        let hash = alice.nominate(candidate).block_hash;

        alice.advance(2);
        assert_eq!(alice.slot_height(), 2);
        assert!(alice.resolve(&hash).is_none());
    }
}
