//! Integration tests driving the consensus core end to end

use agora_consensus::*;
use agora_core::{KeyPair, Seed, Signature};

fn seeds(n: u8) -> Vec<Seed> {
    (0..n).map(|i| Seed::from_bytes([i + 1; 32])).collect()
}

/// A signed payment spending output `index` of `previous`, paying the whole
/// value to `to` split over `split` outputs.
fn spend(
    previous: &Transaction,
    index: u32,
    owner: &KeyPair,
    to: &KeyPair,
    split: u32,
) -> Transaction {
    let value = previous.outputs[index as usize].value;
    let share = value / u64::from(split);
    let mut outputs: Vec<Output> = (0..split)
        .map(|_| Output {
            value: share,
            address: to.address,
        })
        .collect();
    outputs[0].value = value - share * u64::from(split - 1);
    let mut tx = Transaction {
        tx_type: TxType::Payment,
        inputs: vec![Input {
            previous: previous.hash(),
            index,
            signature: Signature::default(),
        }],
        outputs,
    };
    let payload = tx.signature_payload();
    tx.inputs[0].signature = owner.sign(&payload);
    tx
}

fn owner_of<'a>(key_pairs: &'a [KeyPair], tx: &Transaction, index: u32) -> &'a KeyPair {
    key_pairs
        .iter()
        .find(|kp| kp.address == tx.outputs[index as usize].address)
        .expect("output owner among validators")
}

#[test]
fn test_two_node_block_append() {
    let params = ChainParams {
        validator_cycle: 20,
        ..ChainParams::default()
    };
    let seeds = seeds(2);
    let key_pairs: Vec<KeyPair> = seeds.iter().map(KeyPair::from_seed).collect();
    let genesis = genesis_block(&seeds, &params);

    // Two independent nodes starting from the same genesis.
    let mut node0 = Ledger::new(
        genesis.clone(),
        params.clone(),
        Box::new(MemoryBlockStorage::new()),
    )
    .unwrap();
    let mut node1 = Ledger::new(
        genesis.clone(),
        params.clone(),
        Box::new(MemoryBlockStorage::new()),
    )
    .unwrap();
    assert_eq!(node0.validator_count(), 2);

    // Gossip one payment per distribution output to both nodes.
    let dist = genesis
        .txs
        .iter()
        .find(|tx| tx.tx_type == TxType::Payment)
        .unwrap();
    for index in 0..params.tx_in_block {
        let owner = owner_of(&key_pairs, dist, index);
        let tx = spend(dist, index, owner, &key_pairs[1], 1);
        node0.put_transaction(tx.clone()).unwrap();
        node1.put_transaction(tx).unwrap();
    }

    // Both validators nominate their candidate and exchange envelopes.
    let quorum = QuorumSet::new(key_pairs.iter().map(|kp| kp.address).collect());
    let mut driver0 = ConsensusDriver::new(key_pairs[0].clone(), quorum.clone(), 1);
    let mut driver1 = ConsensusDriver::new(key_pairs[1].clone(), quorum, 1);

    let env0 = driver0.nominate(node0.candidate_block().unwrap());
    let env1 = driver1.nominate(node1.candidate_block().unwrap());

    let hash0 = driver0.receive(&env1).unwrap().expect("quorum reached");
    let hash1 = driver1.receive(&env0).unwrap().expect("quorum reached");
    assert_eq!(hash0, hash1);

    // Externalize on both nodes.
    node0.accept_block(driver0.resolve(&hash0).unwrap()).unwrap();
    node1.accept_block(driver1.resolve(&hash1).unwrap()).unwrap();
    driver0.advance(2);
    driver1.advance(2);

    assert_eq!(node0.block_height(), 1);
    assert_eq!(node1.block_height(), 1);

    // Identical byte sequences on every node.
    let bytes0: Vec<Vec<u8>> = node0
        .blocks_from(0, 16)
        .iter()
        .map(agora_core::to_vec)
        .collect();
    let bytes1: Vec<Vec<u8>> = node1
        .blocks_from(0, 16)
        .iter()
        .map(agora_core::to_vec)
        .collect();
    assert_eq!(bytes0, bytes1);
    assert_eq!(bytes0.len(), 2);
}

#[test]
fn test_validator_rollover_via_freeze_and_enroll() {
    let params = ChainParams {
        tx_in_block: 4,
        validator_cycle: 6,
        ..ChainParams::default()
    };
    let seeds = seeds(2);
    let key_pairs: Vec<KeyPair> = seeds.iter().map(KeyPair::from_seed).collect();
    let newcomer = KeyPair::from_seed(&Seed::from_bytes([42; 32]));
    let genesis = genesis_block(&seeds, &params);

    let mut node = Ledger::new(
        genesis.clone(),
        params.clone(),
        Box::new(MemoryBlockStorage::new()),
    )
    .unwrap();

    // Block 1: freeze stake for the newcomer, keep the remaining outputs
    // moving (split so block 2 has enough to spend).
    let dist = genesis
        .txs
        .iter()
        .find(|tx| tx.tx_type == TxType::Payment)
        .unwrap();
    let mut freeze = Transaction {
        tx_type: TxType::Freeze,
        inputs: vec![Input {
            previous: dist.hash(),
            index: 0,
            signature: Signature::default(),
        }],
        outputs: vec![Output {
            value: params.min_freeze_amount,
            address: newcomer.address,
        }],
    };
    let payload = freeze.signature_payload();
    freeze.inputs[0].signature = owner_of(&key_pairs, dist, 0).sign(&payload);
    let stake_key = utxo_key(&freeze.hash(), 0);

    let mut payments = Vec::new();
    for index in 1..params.tx_in_block {
        let owner = owner_of(&key_pairs, dist, index);
        payments.push(spend(dist, index, owner, &key_pairs[1], 2));
    }

    node.put_transaction(freeze).unwrap();
    for tx in &payments {
        node.put_transaction(tx.clone()).unwrap();
    }
    let block1 = node.candidate_block().unwrap();
    node.accept_block(block1).unwrap();
    assert_eq!(node.block_height(), 1);
    assert_eq!(node.validator_count(), 2);

    // The newcomer enrolls over its frozen output; the enrollment rides
    // block 2.
    node.make_enrollment(&newcomer, &stake_key).unwrap();

    for index in 0..params.tx_in_block {
        let source = &payments[(index / 2) as usize];
        let tx = spend(source, index % 2, &key_pairs[1], &key_pairs[0], 1);
        node.put_transaction(tx).unwrap();
    }
    let block2 = node.candidate_block().unwrap();
    assert_eq!(block2.header.enrollments.len(), 1);
    node.accept_block(block2).unwrap();

    assert_eq!(node.block_height(), 2);
    assert_eq!(node.validator_count(), 3);

    // The new validator can reveal the committed pre-image immediately and
    // a bogus reveal is rejected.
    let reveal = node.our_preimage(&stake_key).unwrap();
    node.receive_preimage(&reveal).unwrap();
    let bogus = PreImage {
        hash: agora_core::hash_bytes(b"bogus"),
        ..reveal
    };
    assert!(node.receive_preimage(&bogus).is_err());
}
