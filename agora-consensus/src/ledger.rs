//! The ledger: single writer over chain, UTXO set, pool and enrollments
//!
//! All consensus state is owned here and mutated only through
//! [`Ledger::accept_block`], which applies a fully validated block
//! atomically. Everything the RPC surface exposes goes through this type.

use crate::block::Block;
use crate::enrollment::{Enrollment, EnrollmentManager, PreImage};
use crate::storage::BlockStorage;
use crate::transaction::{Transaction, TransactionPool};
use crate::utxo::{Utxo, UtxoOverlay, UtxoSet};
use crate::validation::{verify_block, verify_block_tx, verify_genesis};
use crate::{ChainParams, ConsensusError, Result};
use agora_core::{Hash, KeyPair, PublicKey};
use tracing::{debug, info};

pub struct Ledger {
    params: ChainParams,
    storage: Box<dyn BlockStorage>,
    utxo_set: UtxoSet,
    pool: TransactionPool,
    enrollments: EnrollmentManager,
}

impl Ledger {
    /// Build a ledger over its genesis block and an injected archive.
    ///
    /// An empty archive is seeded with the genesis; a non-empty one must
    /// start with the same genesis and is replayed to rebuild the UTXO and
    /// enrollment state.
    pub fn new(
        genesis: Block,
        params: ChainParams,
        mut storage: Box<dyn BlockStorage>,
    ) -> Result<Self> {
        verify_genesis(&genesis, &params)?;
        if storage.is_empty() {
            storage.push(&genesis)?;
        } else {
            let stored = storage.get(0).expect("non-empty storage has block 0");
            if stored.hash() != genesis.hash() {
                return Err(ConsensusError::ProtocolViolation(
                    "stored chain starts from a different genesis".to_string(),
                ));
            }
        }

        let mut ledger = Self {
            enrollments: EnrollmentManager::new(params.clone()),
            params,
            storage,
            utxo_set: UtxoSet::new(),
            pool: TransactionPool::new(),
        };
        for height in 0..ledger.storage.len() {
            let block = ledger
                .storage
                .get(height)
                .expect("height below storage length");
            ledger.apply_state(&block, height == 0)?;
        }
        info!(height = ledger.block_height(), "ledger ready");
        Ok(ledger)
    }

    /// Height of the latest accepted block.
    pub fn block_height(&self) -> u64 {
        self.storage.len() - 1
    }

    /// Up to `max` blocks starting at `start`.
    pub fn blocks_from(&self, start: u64, max: u32) -> Vec<Block> {
        (start..self.storage.len())
            .take(max as usize)
            .filter_map(|h| self.storage.get(h))
            .collect()
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// Validate a transaction against the current UTXO set and admit it to
    /// the pool.
    pub fn put_transaction(&mut self, tx: Transaction) -> Result<()> {
        let mut overlay = UtxoOverlay::new(&self.utxo_set);
        verify_block_tx(&tx, &mut overlay, self.block_height() + 1, &self.params)?;
        let hash = tx.hash();
        self.pool.add(tx)?;
        debug!(%hash, pending = self.pool.len(), "transaction pooled");
        Ok(())
    }

    pub fn has_transaction(&self, hash: &Hash) -> bool {
        self.pool.has(hash)
    }

    pub fn pending_transactions(&self) -> usize {
        self.pool.len()
    }

    /// Validate and append an externalized block, applying the UTXO delta,
    /// enrollment changes and pool eviction atomically.
    pub fn accept_block(&mut self, block: Block) -> Result<()> {
        let prev = self
            .storage
            .latest()
            .ok_or_else(|| ConsensusError::Fatal("block archive is empty".to_string()))?;
        verify_block(
            &block,
            prev.header.height,
            &prev.header.hash(),
            &self.utxo_set,
            self.enrollments.validator_count(block.header.height),
            &self.params,
        )?;

        self.apply_state(&block, false)?;

        let included: Vec<Hash> = block.txs.iter().map(Transaction::hash).collect();
        self.pool.remove(&included);
        let utxo_set = &self.utxo_set;
        self.pool
            .evict_unresolvable(|key| utxo_set.find(key).is_some());
        self.enrollments
            .prune_candidates(|key| utxo_set.find(key).is_some());

        self.storage.push(&block)?;
        info!(
            height = block.header.height,
            txs = block.txs.len(),
            enrollments = block.header.enrollments.len(),
            "block accepted"
        );
        Ok(())
    }

    /// Apply a block's UTXO and enrollment effects. The block is trusted
    /// here; validation happens in [`Self::accept_block`].
    fn apply_state(&mut self, block: &Block, genesis: bool) -> Result<()> {
        for tx in &block.txs {
            for input in &tx.inputs {
                self.utxo_set.consume(&input.utxo_key())?;
            }
            self.utxo_set
                .put_tx(tx, block.header.height, self.params.maturity_delay, genesis);
        }
        for enrollment in &block.header.enrollments {
            let utxo = self
                .utxo_set
                .find(&enrollment.utxo_key)
                .ok_or(ConsensusError::UtxoNotFound(enrollment.utxo_key))?;
            let owner = utxo.output.address;
            self.enrollments
                .enroll(enrollment, owner, block.header.height);
        }
        self.enrollments.expire(block.header.height);
        Ok(())
    }

    /// Assemble the candidate for the next height, or None while the pool
    /// holds fewer than `tx_in_block` ready transactions. Empty-slot
    /// padding is deliberately not performed; the proposer waits.
    pub fn candidate_block(&self) -> Option<Block> {
        if self.pool.len() < self.params.tx_in_block as usize {
            return None;
        }
        let txs = self.pool.first(self.params.tx_in_block as usize);
        let enrollments = self.enrollments.candidates();
        let prev = self.storage.latest()?;
        Some(Block::make(&prev.header, txs, enrollments))
    }

    /// Admit an enrollment whose staked output exists in the UTXO set.
    pub fn enroll_validator(&mut self, enrollment: Enrollment) -> Result<()> {
        let utxo = self
            .utxo_set
            .find(&enrollment.utxo_key)
            .cloned()
            .ok_or(ConsensusError::UtxoNotFound(enrollment.utxo_key))?;
        self.enrollments.add_candidate(enrollment, &utxo)
    }

    /// Build, retain and admit an enrollment for one of this node's own
    /// frozen outputs.
    pub fn make_enrollment(&mut self, key_pair: &KeyPair, stake_key: &Hash) -> Result<Enrollment> {
        let enrollment =
            self.enrollments
                .make_enrollment(key_pair, stake_key, self.params.validator_cycle);
        self.enroll_validator(enrollment.clone())?;
        Ok(enrollment)
    }

    pub fn get_enrollment(&self, utxo_key: &Hash) -> Option<Enrollment> {
        self.enrollments.get_candidate(utxo_key).cloned()
    }

    pub fn receive_preimage(&mut self, preimage: &PreImage) -> Result<()> {
        self.enrollments.receive_preimage(preimage)
    }

    /// Pre-image this node should reveal for its own enrollment at the
    /// current height.
    pub fn our_preimage(&self, stake_key: &Hash) -> Option<PreImage> {
        self.enrollments.our_preimage(stake_key, self.block_height())
    }

    /// Validators active at the current height.
    pub fn validator_count(&self) -> usize {
        self.enrollments.validator_count(self.block_height())
    }

    pub fn active_validators(&self) -> Vec<PublicKey> {
        self.enrollments.active_validators(self.block_height())
    }

    pub fn find_utxo(&self, key: &Hash) -> Option<&Utxo> {
        self.utxo_set.find(key)
    }

    /// Outputs owned by a key, used when picking a stake to enroll.
    pub fn utxos_owned_by(&self, address: &PublicKey) -> Vec<(Hash, Utxo)> {
        self.utxo_set.owned_by(address)
    }
}
