//! Per-peer failure tracking and timed bans
//!
//! Time flows through an injectable [`Clock`] so tests can advance it
//! deterministically.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock tests move by hand.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }
}

/// Ban policy knobs.
#[derive(Debug, Clone)]
pub struct BanConfig {
    /// Failures before a peer is banned
    pub max_failed_requests: u32,

    /// How long a ban lasts
    pub ban_duration: Duration,
}

impl Default for BanConfig {
    fn default() -> Self {
        Self {
            max_failed_requests: 32,
            ban_duration: Duration::seconds(60 * 60 * 24),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct PeerStatus {
    failed_requests: u32,
    banned_until: Option<DateTime<Utc>>,
}

/// Records per-peer failure counts and bans peers past the threshold.
pub struct BanManager {
    config: BanConfig,
    clock: Arc<dyn Clock>,
    peers: Mutex<HashMap<String, PeerStatus>>,
}

impl BanManager {
    pub fn new(config: BanConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Count one failed request; at the threshold the peer is banned and
    /// its counter reset.
    pub fn on_failed_request(&self, address: &str) {
        let now = self.clock.now();
        let mut peers = self.peers.lock().expect("ban table lock poisoned");
        let status = peers.entry(address.to_string()).or_default();
        Self::expire(status, now);
        status.failed_requests += 1;
        if status.failed_requests >= self.config.max_failed_requests {
            status.failed_requests = 0;
            status.banned_until = Some(now + self.config.ban_duration);
            warn!(peer = address, until = ?status.banned_until, "peer banned");
        }
    }

    /// Whether a peer is currently banned.
    pub fn is_banned(&self, address: &str) -> bool {
        let now = self.clock.now();
        let mut peers = self.peers.lock().expect("ban table lock poisoned");
        match peers.get_mut(address) {
            Some(status) => {
                Self::expire(status, now);
                status.banned_until.is_some()
            }
            None => false,
        }
    }

    /// Failures recorded against a peer since its last ban.
    pub fn failed_requests(&self, address: &str) -> u32 {
        let peers = self.peers.lock().expect("ban table lock poisoned");
        peers.get(address).map_or(0, |s| s.failed_requests)
    }

    fn expire(status: &mut PeerStatus, now: DateTime<Utc>) {
        if status.banned_until.is_some_and(|until| until <= now) {
            status.banned_until = None;
            status.failed_requests = 0;
        }
    }
}
