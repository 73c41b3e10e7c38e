//! The RPC surface of a full node
//!
//! Every method a peer may invoke remotely. Argument and return types are
//! the canonical-codec domain types; the transport is request/response and
//! the order of responses between peers is not significant.

use crate::Result;
use agora_consensus::{Block, Enrollment, Envelope, PreImage, Transaction};
use agora_core::{Hash, PublicKey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Whether a node considers itself caught up with the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkState {
    Complete,
    Incomplete,
}

/// A node's self-description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub state: NetworkState,
    pub addresses: Vec<String>,
}

/// Methods a full node exposes to its peers.
#[async_trait]
pub trait FullNodeApi: Send + Sync {
    /// The node's public key.
    async fn public_key(&self) -> Result<PublicKey>;

    /// The node's network self-description.
    async fn node_info(&self) -> Result<NodeInfo>;

    /// Height of the latest externalized block.
    async fn block_height(&self) -> Result<u64>;

    /// Up to `max` blocks starting at `height`.
    async fn blocks_from(&self, height: u64, max: u32) -> Result<Vec<Block>>;

    /// Submit a transaction to the node's pool.
    async fn put_transaction(&self, tx: Transaction) -> Result<()>;

    /// Whether the node's pool holds the given transaction.
    async fn has_transaction(&self, hash: Hash) -> Result<bool>;

    /// Submit a validator enrollment.
    async fn enroll_validator(&self, enrollment: Enrollment) -> Result<()>;

    /// Look up a pending enrollment by its staked key.
    async fn get_enrollment(&self, utxo_key: Hash) -> Result<Option<Enrollment>>;

    /// Deliver a revealed pre-image.
    async fn receive_preimage(&self, preimage: PreImage) -> Result<()>;

    /// Deliver a consensus envelope.
    async fn receive_envelope(&self, envelope: Envelope) -> Result<()>;

    /// Ask the node to push gossip to the given address.
    async fn register_listener(&self, address: String) -> Result<()>;
}
