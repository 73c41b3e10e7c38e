//! Block acceptance predicates
//!
//! Pure functions, no I/O: callers decide whether to reject, log or ban the
//! source peer. The first failing rule decides the error, tested in a fixed
//! order so every node rejects a bad block for the same reason.

use crate::block::{build_merkle_tree, Block};
use crate::enrollment::verify_enrollment;
use crate::transaction::{Transaction, TxType};
use crate::utxo::{UtxoOverlay, UtxoSet};
use crate::{ChainParams, ConsensusError, Result};
use agora_core::{CoreError, Hash};

/// Accept-or-reject predicate for a non-genesis block.
pub fn verify_block(
    block: &Block,
    prev_height: u64,
    prev_hash: &Hash,
    utxo_set: &UtxoSet,
    active_enrollments: usize,
    params: &ChainParams,
) -> Result<()> {
    let header = &block.header;
    if header.height != prev_height + 1 {
        return Err(ConsensusError::ProtocolViolation(format!(
            "height {} does not follow {}",
            header.height, prev_height
        )));
    }
    if header.prev_block != *prev_hash {
        return Err(ConsensusError::ProtocolViolation(
            "previous block hash does not match the chain".to_string(),
        ));
    }
    if block.txs.len() != params.tx_in_block as usize {
        return Err(ConsensusError::ProtocolViolation(format!(
            "expected {} transactions, got {}",
            params.tx_in_block,
            block.txs.len()
        )));
    }
    verify_tx_order(&block.txs)?;

    let mut overlay = UtxoOverlay::new(utxo_set);
    for tx in &block.txs {
        verify_block_tx(tx, &mut overlay, header.height, params)?;
    }

    let computed = build_merkle_tree(block.txs.iter().map(Transaction::hash).collect());
    if computed.last() != Some(&header.merkle_root) {
        return Err(ConsensusError::ProtocolViolation(
            "merkle root does not match the transactions".to_string(),
        ));
    }

    verify_enrollment_order(block)?;
    if block.header.enrollments.len() + active_enrollments < params.min_validator_count as usize {
        return Err(ConsensusError::ProtocolViolation(format!(
            "validator count would fall below {}",
            params.min_validator_count
        )));
    }
    for enrollment in &header.enrollments {
        let utxo = overlay
            .find(&enrollment.utxo_key)
            .ok_or(ConsensusError::UtxoNotFound(enrollment.utxo_key))?;
        verify_enrollment(enrollment, &utxo, params)?;
    }
    Ok(())
}

/// Accept-or-reject predicate for the genesis block.
pub fn verify_genesis(block: &Block, params: &ChainParams) -> Result<()> {
    let header = &block.header;
    if header.height != 0 {
        return Err(ConsensusError::ProtocolViolation(
            "genesis height must be 0".to_string(),
        ));
    }
    if !header.prev_block.is_zero() {
        return Err(ConsensusError::ProtocolViolation(
            "genesis previous hash must be zero".to_string(),
        ));
    }
    if block.txs.is_empty() || block.txs.len() > params.tx_in_block as usize {
        return Err(ConsensusError::ProtocolViolation(format!(
            "genesis must carry 1..={} transactions",
            params.tx_in_block
        )));
    }
    verify_tx_order(&block.txs)?;
    for tx in &block.txs {
        if !tx.is_coinbase() {
            return Err(ConsensusError::ProtocolViolation(
                "genesis transactions must have no inputs".to_string(),
            ));
        }
        if tx.outputs.is_empty() || tx.outputs.iter().any(|o| o.value == 0) {
            return Err(ConsensusError::ProtocolViolation(
                "genesis outputs must be positive".to_string(),
            ));
        }
    }

    let computed = build_merkle_tree(block.txs.iter().map(Transaction::hash).collect());
    if computed.last() != Some(&header.merkle_root) {
        return Err(ConsensusError::ProtocolViolation(
            "merkle root does not match the transactions".to_string(),
        ));
    }

    verify_enrollment_order(block)?;
    // Enrollments must stake freeze outputs of this very block.
    let empty = UtxoSet::new();
    let mut overlay = UtxoOverlay::new(&empty);
    for tx in &block.txs {
        overlay.add_tx(tx, 0, params.maturity_delay);
    }
    for enrollment in &header.enrollments {
        let utxo = overlay
            .find(&enrollment.utxo_key)
            .ok_or(ConsensusError::UtxoNotFound(enrollment.utxo_key))?;
        verify_enrollment(enrollment, &utxo, params)?;
    }
    Ok(())
}

/// Validate one transaction against the overlay, consuming its inputs and
/// recording its outputs for later transactions and enrollments.
pub fn verify_block_tx(
    tx: &Transaction,
    overlay: &mut UtxoOverlay<'_>,
    height: u64,
    params: &ChainParams,
) -> Result<()> {
    if tx.inputs.is_empty() {
        return Err(ConsensusError::ProtocolViolation(
            "transaction has no inputs".to_string(),
        ));
    }
    if tx.outputs.is_empty() {
        return Err(ConsensusError::ProtocolViolation(
            "transaction has no outputs".to_string(),
        ));
    }
    if tx.outputs.iter().any(|o| o.value == 0) {
        return Err(ConsensusError::ProtocolViolation(
            "zero-value output".to_string(),
        ));
    }
    let output_total = tx
        .output_total()
        .ok_or_else(|| ConsensusError::ProtocolViolation("output value overflow".to_string()))?;
    if tx.tx_type == TxType::Freeze {
        if let Some(low) = tx.outputs.iter().find(|o| o.value < params.min_freeze_amount) {
            return Err(ConsensusError::InsufficientStake {
                needed: params.min_freeze_amount,
                available: low.value,
            });
        }
    }

    let payload = tx.signature_payload();
    let mut input_total = 0u64;
    for input in &tx.inputs {
        let utxo = overlay.spend(&input.utxo_key())?;
        if utxo.unlock_height > height {
            return Err(ConsensusError::ProtocolViolation(format!(
                "output locked until height {}",
                utxo.unlock_height
            )));
        }
        if !utxo.output.address.verify(&input.signature, &payload) {
            return Err(ConsensusError::Core(CoreError::SignatureInvalid));
        }
        input_total = input_total
            .checked_add(utxo.output.value)
            .ok_or_else(|| ConsensusError::ProtocolViolation("input value overflow".to_string()))?;
    }
    if input_total < output_total {
        return Err(ConsensusError::ProtocolViolation(format!(
            "outputs {} exceed inputs {}",
            output_total, input_total
        )));
    }

    overlay.add_tx(tx, height, params.maturity_delay);
    Ok(())
}

fn verify_tx_order(txs: &[Transaction]) -> Result<()> {
    let hashes: Vec<Hash> = txs.iter().map(Transaction::hash).collect();
    if hashes.windows(2).any(|w| w[0] >= w[1]) {
        return Err(ConsensusError::ProtocolViolation(
            "transactions are not sorted by hash".to_string(),
        ));
    }
    Ok(())
}

fn verify_enrollment_order(block: &Block) -> Result<()> {
    let keys: Vec<Hash> = block.header.enrollments.iter().map(|e| e.utxo_key).collect();
    if keys.windows(2).any(|w| w[0] >= w[1]) {
        return Err(ConsensusError::ProtocolViolation(
            "enrollments are not sorted by staked key".to_string(),
        ));
    }
    Ok(())
}
