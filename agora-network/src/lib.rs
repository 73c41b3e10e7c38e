//! Agora Network - peer substrate
//!
//! The RPC surface a full node exposes, the retry-with-ban client used to
//! talk to peers, and the ban manager that suppresses repeat offenders.

pub mod api;
pub mod ban;
pub mod client;
pub mod error;

pub use api::{FullNodeApi, NetworkState, NodeInfo};
pub use ban::{BanConfig, BanManager, Clock, ManualClock, SystemClock};
pub use client::{ClientConfig, OnFail, PeerClient};
pub use error::NetworkError;

/// Result type for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;
