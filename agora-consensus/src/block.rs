//! Blocks, headers and merkle trees

use crate::enrollment::{make_enrollment, Enrollment};
use crate::transaction::{Output, Transaction, TxType};
use crate::utxo::utxo_key;
use crate::{constants, ChainParams};
use agora_core::wire::{
    read_u32, take, write_u32, CanonicalDeserialize, CanonicalSerialize, WireError,
};
use agora_core::{hash_bytes, Hash, Hasher, KeyPair, SchnorrSignature, Seed};
use serde::{Deserialize, Serialize};

/// A length-carrying bitfield marking which quorum validators signed a
/// block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitMask {
    len: u32,
    bits: Vec<u8>,
}

impl BitMask {
    pub fn new(len: u32) -> Self {
        Self {
            len,
            bits: vec![0u8; ((len as usize) + 7) / 8],
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set(&mut self, index: u32) {
        assert!(index < self.len, "bit index out of range");
        self.bits[(index / 8) as usize] |= 1 << (index % 8);
    }

    pub fn get(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        self.bits[(index / 8) as usize] & (1 << (index % 8)) != 0
    }

    pub fn count_ones(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }
}

impl CanonicalSerialize for BitMask {
    fn encode(&self, out: &mut Vec<u8>) {
        write_u32(out, self.len);
        out.extend_from_slice(&self.bits);
    }
}

impl CanonicalDeserialize for BitMask {
    fn decode(input: &mut &[u8]) -> std::result::Result<Self, WireError> {
        let len = read_u32(input)?;
        let byte_len = ((len as usize) + 7) / 8;
        let bits = take(input, byte_len)?.to_vec();
        Ok(Self { len, bits })
    }
}

/// Header of a block. Hashing the header identifies the block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Hash of the previous block's header; zero for genesis
    pub prev_block: Hash,

    /// Height in the chain, genesis is 0
    pub height: u64,

    /// Root of the merkle tree over the sorted transactions
    pub merkle_root: Hash,

    /// Which quorum validators signed
    pub validators: BitMask,

    /// Proposer's Schnorr signature over the header
    pub signature: SchnorrSignature,

    /// Enrollments externalized by this block, ascending by `utxo_key`
    pub enrollments: Vec<Enrollment>,
}

impl BlockHeader {
    /// The header's content hash: every field except the aggregate
    /// signature and signer bitmask, so collecting signatures after
    /// agreement does not change a block's identity.
    pub fn hash(&self) -> Hash {
        hash_bytes(&self.signature_payload())
    }

    /// Bytes both the header hash and the aggregate signature cover:
    /// everything except the signature and the signer bitmask.
    pub fn signature_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.prev_block.encode(&mut out);
        self.height.encode(&mut out);
        self.merkle_root.encode(&mut out);
        self.enrollments.encode(&mut out);
        out
    }
}

impl CanonicalSerialize for BlockHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        self.prev_block.encode(out);
        self.height.encode(out);
        self.merkle_root.encode(out);
        self.validators.encode(out);
        self.signature.encode(out);
        self.enrollments.encode(out);
    }
}

impl CanonicalDeserialize for BlockHeader {
    fn decode(input: &mut &[u8]) -> std::result::Result<Self, WireError> {
        Ok(Self {
            prev_block: Hash::decode(input)?,
            height: u64::decode(input)?,
            merkle_root: Hash::decode(input)?,
            validators: BitMask::decode(input)?,
            signature: SchnorrSignature::decode(input)?,
            enrollments: Vec::decode(input)?,
        })
    }
}

/// A block: header, hash-sorted transactions and the serialized merkle
/// tree kept alongside for inclusion proofs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Transaction>,
    pub merkle_tree: Vec<Hash>,
}

impl Block {
    /// Build the successor of `prev` from transactions and enrollments.
    /// Transactions are sorted by hash, enrollments by staked key.
    pub fn make(prev: &BlockHeader, txs: Vec<Transaction>, enrollments: Vec<Enrollment>) -> Block {
        Self::assemble(prev.hash(), prev.height + 1, txs, enrollments)
    }

    fn assemble(
        prev_block: Hash,
        height: u64,
        mut txs: Vec<Transaction>,
        mut enrollments: Vec<Enrollment>,
    ) -> Block {
        txs.sort_by_cached_key(Transaction::hash);
        enrollments.sort_by(|a, b| a.utxo_key.cmp(&b.utxo_key));
        let tree = build_merkle_tree(txs.iter().map(Transaction::hash).collect());
        let merkle_root = tree.last().copied().unwrap_or(Hash::ZERO);
        Block {
            header: BlockHeader {
                prev_block,
                height,
                merkle_root,
                validators: BitMask::new(0),
                signature: SchnorrSignature::default(),
                enrollments,
            },
            txs,
            merkle_tree: tree,
        }
    }

    /// The block's identity: the hash of its header.
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Sibling hashes proving the transaction at `index` is in the tree.
    pub fn merkle_path(&self, mut index: usize) -> Vec<Hash> {
        if index >= self.txs.len() {
            return Vec::new();
        }
        let mut level: Vec<Hash> = self.txs.iter().map(Transaction::hash).collect();
        let mut path = Vec::new();
        while level.len() > 1 {
            if level.len() % 2 == 1 {
                level.push(*level.last().expect("level not empty"));
            }
            path.push(level[index ^ 1]);
            index /= 2;
            level = level
                .chunks(2)
                .map(|pair| merkle_parent(&pair[0], &pair[1]))
                .collect();
        }
        path
    }

    /// Fold a leaf up a merkle path and compare against the root.
    pub fn verify_merkle_path(root: &Hash, leaf: Hash, mut index: usize, path: &[Hash]) -> bool {
        let mut acc = leaf;
        for sibling in path {
            acc = if index % 2 == 0 {
                merkle_parent(&acc, sibling)
            } else {
                merkle_parent(sibling, &acc)
            };
            index /= 2;
        }
        acc == *root
    }
}

impl CanonicalSerialize for Block {
    fn encode(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        self.txs.encode(out);
        self.merkle_tree.encode(out);
    }
}

impl CanonicalDeserialize for Block {
    fn decode(input: &mut &[u8]) -> std::result::Result<Self, WireError> {
        Ok(Self {
            header: BlockHeader::decode(input)?,
            txs: Vec::decode(input)?,
            merkle_tree: Vec::decode(input)?,
        })
    }
}

/// Hash of an internal merkle node: `hash(left || right)`.
pub fn merkle_parent(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hasher.finish()
}

/// Build the full merkle tree bottom-up, all levels concatenated, root
/// last. An odd level duplicates its last element before pairing.
pub fn build_merkle_tree(mut level: Vec<Hash>) -> Vec<Hash> {
    let mut tree = Vec::new();
    if level.is_empty() {
        return tree;
    }
    loop {
        if level.len() > 1 && level.len() % 2 == 1 {
            level.push(*level.last().expect("level not empty"));
        }
        tree.extend_from_slice(&level);
        if level.len() == 1 {
            return tree;
        }
        level = level
            .chunks(2)
            .map(|pair| merkle_parent(&pair[0], &pair[1]))
            .collect();
    }
}

/// Construct the height-0 block for a new network.
///
/// One payment transaction distributes the initial supply over
/// `tx_in_block` outputs assigned to the validators round-robin, each
/// validator freezes its stake, and every freeze output is enrolled. The
/// result is byte-for-byte reproducible from the same seeds.
pub fn genesis_block(validator_seeds: &[Seed], params: &ChainParams) -> Block {
    assert!(!validator_seeds.is_empty(), "genesis needs validators");
    assert!(
        validator_seeds.len() < params.tx_in_block as usize,
        "too many genesis validators for the block size"
    );
    let key_pairs: Vec<KeyPair> = validator_seeds.iter().map(KeyPair::from_seed).collect();

    let distribution = Transaction {
        tx_type: TxType::Payment,
        inputs: vec![],
        outputs: (0..params.tx_in_block)
            .map(|i| Output {
                value: constants::GENESIS_SHARE,
                address: key_pairs[i as usize % key_pairs.len()].address,
            })
            .collect(),
    };

    let mut txs = vec![distribution];
    for kp in &key_pairs {
        txs.push(Transaction {
            tx_type: TxType::Freeze,
            inputs: vec![],
            outputs: vec![Output {
                value: params.min_freeze_amount,
                address: kp.address,
            }],
        });
    }

    let enrollments = key_pairs
        .iter()
        .enumerate()
        .map(|(i, kp)| {
            let freeze_key = utxo_key(&txs[i + 1].hash(), 0);
            make_enrollment(kp, &freeze_key, params.validator_cycle)
        })
        .collect();

    Block::assemble(Hash::ZERO, 0, txs, enrollments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::hash_bytes;

    fn seeds(n: u8) -> Vec<Seed> {
        (0..n).map(|i| Seed::from_bytes([i + 1; 32])).collect()
    }

    fn dummy_tx(tag: &[u8]) -> Transaction {
        // Vary the value so each dummy transaction hashes differently.
        Transaction {
            tx_type: TxType::Payment,
            inputs: vec![],
            outputs: vec![Output {
                value: u64::from(hash_bytes(tag).as_bytes()[0]) + 1,
                address: KeyPair::from_seed(&Seed::from_bytes([9; 32])).address,
            }],
        }
    }

    #[test]
    fn test_bitmask_set_get() {
        let mut mask = BitMask::new(10);
        mask.set(0);
        mask.set(9);
        assert!(mask.get(0));
        assert!(!mask.get(1));
        assert!(mask.get(9));
        assert!(!mask.get(10));
        assert_eq!(mask.count_ones(), 2);
    }

    #[test]
    fn test_bitmask_round_trip() {
        let mut mask = BitMask::new(6);
        mask.set(2);
        let back: BitMask = agora_core::from_slice(&agora_core::to_vec(&mask)).unwrap();
        assert_eq!(back, mask);
    }

    #[test]
    fn test_merkle_odd_count_duplicates_last() {
        let leaves: Vec<Hash> = [b"a" as &[u8], b"b", b"c"].iter().map(|t| hash_bytes(t)).collect();
        let tree = build_merkle_tree(leaves.clone());

        // Level 0 is padded to four leaves, then two parents, then the root.
        assert_eq!(tree.len(), 4 + 2 + 1);
        let expected_root = merkle_parent(
            &merkle_parent(&leaves[0], &leaves[1]),
            &merkle_parent(&leaves[2], &leaves[2]),
        );
        assert_eq!(*tree.last().unwrap(), expected_root);
    }

    #[test]
    fn test_merkle_single_leaf() {
        let leaf = hash_bytes(b"only");
        let tree = build_merkle_tree(vec![leaf]);
        assert_eq!(tree, vec![leaf]);
    }

    #[test]
    fn test_merkle_paths_verify() {
        let txs: Vec<Transaction> = [b"a" as &[u8], b"b", b"c", b"d", b"e"]
            .iter()
            .map(|t| dummy_tx(t))
            .collect();
        let prev = genesis_block(&seeds(2), &ChainParams::default());
        let block = Block::make(&prev.header, txs, vec![]);

        for (i, tx) in block.txs.iter().enumerate() {
            let path = block.merkle_path(i);
            assert!(Block::verify_merkle_path(
                &block.header.merkle_root,
                tx.hash(),
                i,
                &path
            ));
            assert!(!Block::verify_merkle_path(
                &block.header.merkle_root,
                hash_bytes(b"not in block"),
                i,
                &path
            ));
        }
    }

    #[test]
    fn test_make_links_and_sorts() {
        let genesis = genesis_block(&seeds(2), &ChainParams::default());
        let txs: Vec<Transaction> = [b"x" as &[u8], b"y", b"z"].iter().map(|t| dummy_tx(t)).collect();
        let block = Block::make(&genesis.header, txs, vec![]);

        assert_eq!(block.header.height, 1);
        assert_eq!(block.header.prev_block, genesis.header.hash());
        let hashes: Vec<Hash> = block.txs.iter().map(Transaction::hash).collect();
        let mut sorted = hashes.clone();
        sorted.sort();
        assert_eq!(hashes, sorted);
    }

    #[test]
    fn test_genesis_is_deterministic() {
        let params = ChainParams::default();
        let a = genesis_block(&seeds(3), &params);
        let b = genesis_block(&seeds(3), &params);
        assert_eq!(agora_core::to_vec(&a), agora_core::to_vec(&b));
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_genesis_shape() {
        let params = ChainParams::default();
        let block = genesis_block(&seeds(2), &params);

        assert_eq!(block.header.height, 0);
        assert!(block.header.prev_block.is_zero());
        // One distribution payment plus one freeze per validator.
        assert_eq!(block.txs.len(), 3);
        assert_eq!(block.header.enrollments.len(), 2);
        let keys: Vec<Hash> = block.header.enrollments.iter().map(|e| e.utxo_key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);

        let payments: Vec<&Transaction> = block
            .txs
            .iter()
            .filter(|tx| tx.tx_type == TxType::Payment)
            .collect();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].outputs.len(), params.tx_in_block as usize);
    }

    #[test]
    fn test_block_round_trip() {
        let block = genesis_block(&seeds(2), &ChainParams::default());
        let back: Block = agora_core::from_slice(&agora_core::to_vec(&block)).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn test_header_identity_ignores_aggregate_signature() {
        let mut block = genesis_block(&seeds(2), &ChainParams::default());
        let before = block.header.hash();
        block.header.signature = SchnorrSignature::from_parts([1; 32], [2; 32]);
        block.header.validators = BitMask::new(2);

        // Collecting signatures must not change the block's identity, but
        // the wire encoding does carry them.
        assert_eq!(block.header.hash(), before);
        assert_ne!(
            agora_core::to_vec(&block.header),
            agora_core::to_vec(&genesis_block(&seeds(2), &ChainParams::default()).header)
        );
    }
}
