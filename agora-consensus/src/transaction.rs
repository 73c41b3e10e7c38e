//! Transactions and the transaction pool

use crate::utxo::utxo_key;
use crate::{ConsensusError, Result};
use agora_core::wire::{
    read_u32, read_u8, write_u32, write_u8, write_var_len, CanonicalDeserialize,
    CanonicalSerialize, WireError,
};
use agora_core::{hash_full, Hash, PublicKey, Signature};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Transaction kind. The discriminant byte is consensus-relevant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxType {
    /// Moves value between outputs
    Payment,

    /// Locks value as validator stake
    Freeze,
}

impl CanonicalSerialize for TxType {
    fn encode(&self, out: &mut Vec<u8>) {
        write_u8(
            out,
            match self {
                TxType::Payment => 0,
                TxType::Freeze => 1,
            },
        );
    }
}

impl CanonicalDeserialize for TxType {
    fn decode(input: &mut &[u8]) -> std::result::Result<Self, WireError> {
        match read_u8(input)? {
            0 => Ok(TxType::Payment),
            1 => Ok(TxType::Freeze),
            other => Err(WireError::InvalidDiscriminant(other)),
        }
    }
}

/// A reference to a previous output plus the signature unlocking it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    /// Hash of the transaction holding the spent output
    pub previous: Hash,

    /// Index of the spent output within that transaction
    pub index: u32,

    /// Owner's signature over the spending transaction minus signatures
    pub signature: Signature,
}

impl Input {
    /// The UTXO set key this input consumes.
    pub fn utxo_key(&self) -> Hash {
        utxo_key(&self.previous, self.index)
    }
}

impl CanonicalSerialize for Input {
    fn encode(&self, out: &mut Vec<u8>) {
        self.previous.encode(out);
        write_u32(out, self.index);
        self.signature.encode(out);
    }
}

impl CanonicalDeserialize for Input {
    fn decode(input: &mut &[u8]) -> std::result::Result<Self, WireError> {
        Ok(Self {
            previous: Hash::decode(input)?,
            index: read_u32(input)?,
            signature: Signature::decode(input)?,
        })
    }
}

/// A pay-to-public-key output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    /// Amount in base units
    pub value: u64,

    /// Destination public key
    pub address: PublicKey,
}

impl CanonicalSerialize for Output {
    fn encode(&self, out: &mut Vec<u8>) {
        self.value.encode(out);
        self.address.encode(out);
    }
}

impl CanonicalDeserialize for Output {
    fn decode(input: &mut &[u8]) -> std::result::Result<Self, WireError> {
        Ok(Self {
            value: u64::decode(input)?,
            address: PublicKey::decode(input)?,
        })
    }
}

/// A payment or freeze transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Payment or Freeze
    pub tx_type: TxType,

    /// Spent outputs, empty only in genesis
    pub inputs: Vec<Input>,

    /// Created outputs
    pub outputs: Vec<Output>,
}

impl Transaction {
    /// Content hash over the full canonical encoding.
    pub fn hash(&self) -> Hash {
        hash_full(self)
    }

    /// Bytes every input signature authenticates: the canonical encoding
    /// with all input signatures omitted.
    pub fn signature_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.tx_type.encode(&mut out);
        write_var_len(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            input.previous.encode(&mut out);
            write_u32(&mut out, input.index);
        }
        self.outputs.encode(&mut out);
        out
    }

    /// Sum of output values; None on overflow.
    pub fn output_total(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.value))
    }

    /// Genesis transactions carry no inputs.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }
}

impl CanonicalSerialize for Transaction {
    fn encode(&self, out: &mut Vec<u8>) {
        self.tx_type.encode(out);
        self.inputs.encode(out);
        self.outputs.encode(out);
    }
}

impl CanonicalDeserialize for Transaction {
    fn decode(input: &mut &[u8]) -> std::result::Result<Self, WireError> {
        Ok(Self {
            tx_type: TxType::decode(input)?,
            inputs: Vec::decode(input)?,
            outputs: Vec::decode(input)?,
        })
    }
}

/// Pending transactions, iterated in hash order at block time.
///
/// Arrival order does not matter: the backing map is keyed by transaction
/// hash, which is also the order transactions appear in a block. A spent
/// index rejects pool-level double spends early.
#[derive(Debug, Default)]
pub struct TransactionPool {
    txs: BTreeMap<Hash, Transaction>,
    spent: HashMap<Hash, Hash>,
}

impl TransactionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a transaction. Rejects duplicates and conflicts with already
    /// pooled spends.
    pub fn add(&mut self, tx: Transaction) -> Result<()> {
        let hash = tx.hash();
        if self.txs.contains_key(&hash) {
            return Err(ConsensusError::DuplicateTransaction);
        }
        for input in &tx.inputs {
            let key = input.utxo_key();
            if self.spent.contains_key(&key) {
                return Err(ConsensusError::DoubleSpend(key));
            }
        }
        for input in &tx.inputs {
            self.spent.insert(input.utxo_key(), hash);
        }
        self.txs.insert(hash, tx);
        Ok(())
    }

    pub fn has(&self, hash: &Hash) -> bool {
        self.txs.contains_key(hash)
    }

    /// The lowest `n` transactions by hash, in block order.
    pub fn first(&self, n: usize) -> Vec<Transaction> {
        self.txs.values().take(n).cloned().collect()
    }

    /// Remove transactions by hash, releasing their spent entries.
    pub fn remove(&mut self, hashes: &[Hash]) {
        for hash in hashes {
            if let Some(tx) = self.txs.remove(hash) {
                for input in &tx.inputs {
                    self.spent.remove(&input.utxo_key());
                }
            }
        }
    }

    /// Drop every transaction with an input the resolver no longer knows.
    pub fn evict_unresolvable<F: Fn(&Hash) -> bool>(&mut self, resolve: F) {
        let stale: Vec<Hash> = self
            .txs
            .iter()
            .filter(|(_, tx)| tx.inputs.iter().any(|i| !resolve(&i.utxo_key())))
            .map(|(hash, _)| *hash)
            .collect();
        self.remove(&stale);
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::KeyPair;

    fn payment(value: u64, previous: Hash, index: u32) -> Transaction {
        Transaction {
            tx_type: TxType::Payment,
            inputs: vec![Input {
                previous,
                index,
                signature: Signature::default(),
            }],
            outputs: vec![Output {
                value,
                address: KeyPair::random().address,
            }],
        }
    }

    #[test]
    fn test_hash_covers_every_field() {
        let tx = payment(10, Hash::ZERO, 0);
        let mut other = tx.clone();
        other.outputs[0].value = 11;
        assert_ne!(tx.hash(), other.hash());
        assert_eq!(tx.hash(), tx.clone().hash());
    }

    #[test]
    fn test_signature_payload_excludes_signatures() {
        let kp = KeyPair::random();
        let mut tx = payment(10, Hash::ZERO, 0);
        let unsigned = tx.signature_payload();
        tx.inputs[0].signature = kp.sign(&unsigned);
        assert_eq!(tx.signature_payload(), unsigned);
        assert!(kp.address.verify(&tx.inputs[0].signature, &tx.signature_payload()));
    }

    #[test]
    fn test_canonical_round_trip() {
        let tx = payment(10, agora_core::hash_bytes(b"prev"), 3);
        let bytes = agora_core::to_vec(&tx);
        let back: Transaction = agora_core::from_slice(&bytes).unwrap();
        assert_eq!(back, tx);
    }

    #[test]
    fn test_output_total_checks_overflow() {
        let mut tx = payment(u64::MAX, Hash::ZERO, 0);
        tx.outputs.push(Output {
            value: 1,
            address: KeyPair::random().address,
        });
        assert_eq!(tx.output_total(), None);
    }

    #[test]
    fn test_pool_orders_by_hash() {
        let mut pool = TransactionPool::new();
        let a = payment(1, agora_core::hash_bytes(b"a"), 0);
        let b = payment(2, agora_core::hash_bytes(b"b"), 0);
        let c = payment(3, agora_core::hash_bytes(b"c"), 0);
        for tx in [&a, &b, &c] {
            pool.add(tx.clone()).unwrap();
        }

        let drained: Vec<Hash> = pool.first(3).iter().map(Transaction::hash).collect();
        let mut sorted = drained.clone();
        sorted.sort();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained, sorted);
    }

    #[test]
    fn test_pool_rejects_duplicates() {
        let mut pool = TransactionPool::new();
        let tx = payment(1, Hash::ZERO, 0);
        pool.add(tx.clone()).unwrap();
        assert!(matches!(
            pool.add(tx),
            Err(ConsensusError::DuplicateTransaction)
        ));
    }

    #[test]
    fn test_pool_rejects_double_spends() {
        let mut pool = TransactionPool::new();
        pool.add(payment(1, Hash::ZERO, 0)).unwrap();
        let conflict = payment(2, Hash::ZERO, 0);
        assert!(matches!(
            pool.add(conflict),
            Err(ConsensusError::DoubleSpend(_))
        ));
    }

    #[test]
    fn test_remove_releases_spent_entries() {
        let mut pool = TransactionPool::new();
        let tx = payment(1, Hash::ZERO, 0);
        let hash = tx.hash();
        pool.add(tx).unwrap();
        pool.remove(&[hash]);
        assert!(pool.is_empty());
        // The conflicting spend is admissible again.
        pool.add(payment(2, Hash::ZERO, 0)).unwrap();
    }

    #[test]
    fn test_evict_unresolvable() {
        let mut pool = TransactionPool::new();
        let keep = payment(1, agora_core::hash_bytes(b"live"), 0);
        let drop = payment(2, agora_core::hash_bytes(b"gone"), 0);
        let live_key = keep.inputs[0].utxo_key();
        let keep_hash = keep.hash();
        pool.add(keep).unwrap();
        pool.add(drop).unwrap();

        pool.evict_unresolvable(|key| *key == live_key);
        assert_eq!(pool.len(), 1);
        assert!(pool.has(&keep_hash));
    }
}
