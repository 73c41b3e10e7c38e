//! Retry-with-ban peer client
//!
//! Every remote call funnels through one retry loop: invoke, log, sleep,
//! retry, and on exhaustion report the peer to the ban manager. Call sites
//! choose whether exhaustion surfaces as an error or as a zero value, and
//! fire-and-forget sends run on their own task so callers never block.

use crate::api::{FullNodeApi, NodeInfo};
use crate::ban::BanManager;
use crate::{NetworkError, Result};
use agora_consensus::{Block, Enrollment, Envelope, PreImage, Transaction};
use agora_core::{Hash, PublicKey};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Retry policy for one peer.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Pause between attempts
    pub retry_delay: Duration,

    /// Attempts before the peer is reported to the ban manager
    pub max_retries: u32,

    /// Per-attempt timeout
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(500),
            max_retries: 5,
            timeout: Duration::from_secs(10),
        }
    }
}

/// What to do when every attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnFail {
    /// Surface the failure to the caller
    Throw,

    /// Swallow it; the caller falls back to a zero value
    Ignore,
}

/// A remote peer behind the retry loop.
pub struct PeerClient<A: FullNodeApi> {
    peer: Arc<A>,
    address: String,
    config: ClientConfig,
    ban: Arc<BanManager>,
}

impl<A: FullNodeApi> Clone for PeerClient<A> {
    fn clone(&self) -> Self {
        Self {
            peer: self.peer.clone(),
            address: self.address.clone(),
            config: self.config.clone(),
            ban: self.ban.clone(),
        }
    }
}

impl<A: FullNodeApi + 'static> PeerClient<A> {
    pub fn new(address: String, peer: Arc<A>, config: ClientConfig, ban: Arc<BanManager>) -> Self {
        Self {
            peer,
            address,
            config,
            ban,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// The retry loop. `Throw` exhaustion returns an error and logs each
    /// attempt loudly; `Ignore` exhaustion returns `Ok(None)` and logs
    /// quietly. Both report the peer to the ban manager.
    async fn attempt_request<T, F, Fut>(
        &self,
        op: &'static str,
        on_fail: OnFail,
        call: F,
    ) -> Result<Option<T>>
    where
        F: Fn(Arc<A>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.ban.is_banned(&self.address) {
            return Err(NetworkError::PeerBanned(self.address.clone()));
        }
        let mut attempt = 0;
        loop {
            attempt += 1;
            match tokio::time::timeout(self.config.timeout, call(self.peer.clone())).await {
                Ok(Ok(value)) => return Ok(Some(value)),
                Ok(Err(error)) => match on_fail {
                    OnFail::Throw => {
                        warn!(peer = %self.address, op, attempt, %error, "request failed")
                    }
                    OnFail::Ignore => {
                        debug!(peer = %self.address, op, attempt, %error, "request failed")
                    }
                },
                Err(_) => match on_fail {
                    OnFail::Throw => {
                        warn!(peer = %self.address, op, attempt, "request timed out")
                    }
                    OnFail::Ignore => {
                        debug!(peer = %self.address, op, attempt, "request timed out")
                    }
                },
            }
            if attempt >= self.config.max_retries {
                break;
            }
            tokio::time::sleep(self.config.retry_delay).await;
        }
        self.ban.on_failed_request(&self.address);
        match on_fail {
            OnFail::Throw => Err(NetworkError::TransportFailure(format!(
                "{} to {} failed after {} attempts",
                op, self.address, self.config.max_retries
            ))),
            OnFail::Ignore => Ok(None),
        }
    }

    async fn request<T, F, Fut>(&self, op: &'static str, call: F) -> Result<T>
    where
        F: Fn(Arc<A>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.attempt_request(op, OnFail::Throw, call)
            .await?
            .ok_or_else(|| {
                NetworkError::TransportFailure(format!("{} to {} failed", op, self.address))
            })
    }

    async fn request_or_default<T, F, Fut>(&self, op: &'static str, call: F) -> T
    where
        T: Default,
        F: Fn(Arc<A>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.attempt_request(op, OnFail::Ignore, call).await {
            Ok(Some(value)) => value,
            _ => T::default(),
        }
    }

    pub async fn get_public_key(&self) -> Result<PublicKey> {
        self.request("public_key", |p| async move { p.public_key().await })
            .await
    }

    pub async fn get_node_info(&self) -> Result<NodeInfo> {
        self.request("node_info", |p| async move { p.node_info().await })
            .await
    }

    pub async fn get_block_height(&self) -> Result<u64> {
        self.request("block_height", |p| async move { p.block_height().await })
            .await
    }

    pub async fn get_blocks_from(&self, height: u64, max: u32) -> Result<Vec<Block>> {
        self.request("blocks_from", move |p| async move {
            p.blocks_from(height, max).await
        })
        .await
    }

    pub async fn put_transaction(&self, tx: Transaction) -> Result<()> {
        self.request("put_transaction", move |p| {
            let tx = tx.clone();
            async move { p.put_transaction(tx).await }
        })
        .await
    }

    /// Falls back to false when the peer cannot be reached.
    pub async fn has_transaction(&self, hash: Hash) -> bool {
        self.request_or_default("has_transaction", move |p| async move {
            p.has_transaction(hash).await
        })
        .await
    }

    pub async fn enroll_validator(&self, enrollment: Enrollment) -> Result<()> {
        self.request("enroll_validator", move |p| {
            let enrollment = enrollment.clone();
            async move { p.enroll_validator(enrollment).await }
        })
        .await
    }

    /// Falls back to None when the peer cannot be reached.
    pub async fn get_enrollment(&self, utxo_key: Hash) -> Option<Enrollment> {
        self.request_or_default("get_enrollment", move |p| async move {
            p.get_enrollment(utxo_key).await
        })
        .await
    }

    pub async fn receive_preimage(&self, preimage: PreImage) -> Result<()> {
        self.request("receive_preimage", move |p| {
            let preimage = preimage.clone();
            async move { p.receive_preimage(preimage).await }
        })
        .await
    }

    pub async fn receive_envelope(&self, envelope: Envelope) -> Result<()> {
        self.request("receive_envelope", move |p| {
            let envelope = envelope.clone();
            async move { p.receive_envelope(envelope).await }
        })
        .await
    }

    pub async fn register_listener(&self, address: String) -> Result<()> {
        self.request("register_listener", move |p| {
            let address = address.clone();
            async move { p.register_listener(address).await }
        })
        .await
    }

    /// Push a transaction without blocking the caller. The peer is asked
    /// first whether it already holds the transaction; failures never
    /// surface.
    pub fn send_transaction(&self, tx: Transaction) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let hash = tx.hash();
            if client.has_transaction(hash).await {
                debug!(peer = %client.address, %hash, "peer already has transaction");
                return;
            }
            let _ = client
                .attempt_request("send_transaction", OnFail::Ignore, move |p| {
                    let tx = tx.clone();
                    async move { p.put_transaction(tx).await }
                })
                .await;
        })
    }

    /// Push an envelope without blocking the caller; failures never
    /// surface.
    pub fn send_envelope(&self, envelope: Envelope) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let _ = client
                .attempt_request("send_envelope", OnFail::Ignore, move |p| {
                    let envelope = envelope.clone();
                    async move { p.receive_envelope(envelope).await }
                })
                .await;
        })
    }

    /// Push an enrollment without blocking the caller; failures never
    /// surface.
    pub fn send_enrollment(&self, enrollment: Enrollment) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let _ = client
                .attempt_request("send_enrollment", OnFail::Ignore, move |p| {
                    let enrollment = enrollment.clone();
                    async move { p.enroll_validator(enrollment).await }
                })
                .await;
        })
    }

    /// Push a pre-image without blocking the caller; failures never
    /// surface.
    pub fn send_preimage(&self, preimage: PreImage) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let _ = client
                .attempt_request("send_preimage", OnFail::Ignore, move |p| {
                    let preimage = preimage.clone();
                    async move { p.receive_preimage(preimage).await }
                })
                .await;
        })
    }
}
