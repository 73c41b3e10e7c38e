//! The UTXO ledger state
//!
//! Outputs are appended when their transaction is accepted into a block and
//! destroyed when spent. Keys are content-derived so the set never needs the
//! full transaction to answer a lookup.

use crate::transaction::{Output, Transaction, TxType};
use crate::{ConsensusError, Result};
use agora_core::{Hash, Hasher, PublicKey};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Key of an unspent output: `hash(tx_hash || output_index as LE u64)`.
pub fn utxo_key(tx_hash: &Hash, index: u32) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(tx_hash.as_bytes());
    hasher.update(&u64::from(index).to_le_bytes());
    hasher.finish()
}

/// An unspent output with its spendability metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// Earliest block height at which the output may be spent
    pub unlock_height: u64,

    /// Type of the transaction that created the output
    pub tx_type: TxType,

    /// The output itself
    pub output: Output,
}

/// The set of unspent outputs.
#[derive(Debug, Clone, Default)]
pub struct UtxoSet {
    entries: HashMap<Hash, Utxo>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one UTXO per output of an accepted transaction.
    ///
    /// Unlock heights: genesis outputs are immediately spendable, payments
    /// unlock at the next height, freezes after the maturity delay.
    pub fn put_tx(&mut self, tx: &Transaction, height: u64, maturity_delay: u64, genesis: bool) {
        let unlock_height = if genesis {
            0
        } else {
            match tx.tx_type {
                TxType::Payment => height + 1,
                TxType::Freeze => height + maturity_delay,
            }
        };
        let tx_hash = tx.hash();
        for (index, output) in tx.outputs.iter().enumerate() {
            self.entries.insert(
                utxo_key(&tx_hash, index as u32),
                Utxo {
                    unlock_height,
                    tx_type: tx.tx_type,
                    output: output.clone(),
                },
            );
        }
    }

    pub fn find(&self, key: &Hash) -> Option<&Utxo> {
        self.entries.get(key)
    }

    /// Remove an output on an accepted spend.
    pub fn consume(&mut self, key: &Hash) -> Result<Utxo> {
        self.entries
            .remove(key)
            .ok_or(ConsensusError::UtxoNotFound(*key))
    }

    /// All outputs owned by a key, sorted by UTXO key.
    pub fn owned_by(&self, address: &PublicKey) -> Vec<(Hash, Utxo)> {
        let mut owned: Vec<(Hash, Utxo)> = self
            .entries
            .iter()
            .filter(|(_, utxo)| utxo.output.address == *address)
            .map(|(key, utxo)| (*key, utxo.clone()))
            .collect();
        owned.sort_by(|a, b| a.0.cmp(&b.0));
        owned
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Scratch view over a [`UtxoSet`] used during block validation.
///
/// Spends and newly created outputs are recorded here instead of the base
/// set, so a rejected block leaves the ledger untouched and enrollment
/// checks can see freeze outputs introduced by the block under validation.
pub struct UtxoOverlay<'a> {
    base: &'a UtxoSet,
    spent: HashSet<Hash>,
    created: HashMap<Hash, Utxo>,
}

impl<'a> UtxoOverlay<'a> {
    pub fn new(base: &'a UtxoSet) -> Self {
        Self {
            base,
            spent: HashSet::new(),
            created: HashMap::new(),
        }
    }

    pub fn find(&self, key: &Hash) -> Option<Utxo> {
        if let Some(utxo) = self.created.get(key) {
            return Some(utxo.clone());
        }
        if self.spent.contains(key) {
            return None;
        }
        self.base.find(key).cloned()
    }

    /// Mark an output spent, returning it. Spending twice is a double
    /// spend; spending an unknown key reports it missing.
    pub fn spend(&mut self, key: &Hash) -> Result<Utxo> {
        if self.spent.contains(key) {
            return Err(ConsensusError::DoubleSpend(*key));
        }
        let utxo = match self.created.remove(key) {
            Some(utxo) => utxo,
            None => self
                .base
                .find(key)
                .cloned()
                .ok_or(ConsensusError::UtxoNotFound(*key))?,
        };
        self.spent.insert(*key);
        Ok(utxo)
    }

    /// Record the outputs of a transaction within the block under
    /// validation.
    pub fn add_tx(&mut self, tx: &Transaction, height: u64, maturity_delay: u64) {
        let unlock_height = match tx.tx_type {
            TxType::Payment => height + 1,
            TxType::Freeze => height + maturity_delay,
        };
        let tx_hash = tx.hash();
        for (index, output) in tx.outputs.iter().enumerate() {
            self.created.insert(
                utxo_key(&tx_hash, index as u32),
                Utxo {
                    unlock_height,
                    tx_type: tx.tx_type,
                    output: output.clone(),
                },
            );
        }
    }
}
