pub mod distributed;

use crate::sender::RequestError;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::{HashMap, HashMapExt};
use async_trait::async_trait;
use codec::address::{MAX_RELAYS, PeerAddress};
use tokio::sync::watch;

#[derive(Debug)]
pub enum RelayError {
    /// The candidate answered, but not with an acceptance.
    Denied,
    Request(RequestError),
}

impl std::error::Error for RelayError {}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<RequestError> for RelayError {
    fn from(value: RequestError) -> Self {
        Self::Request(value)
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Target number of live relay connections.
    pub max_relays: usize,
    /// How long a failed candidate stays quarantined before it may be
    /// tried again.
    pub failure_ttl: Duration,
    /// When set, these and only these are used as candidates; the caller
    /// owns the failure filter.
    pub manual_relays: Vec<PeerAddress>,
    /// Advertise the relayed address as slow.
    pub slow: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_relays: MAX_RELAYS,
            failure_ttl: Duration::from_secs(60),
            manual_relays: Vec::new(),
            slow: false,
        }
    }
}

/// A live connection to one relay peer.
///
/// Closing is level-triggered: every clone observes it, and the close
/// signal fires whether the local side hung up or the transport died.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    address: PeerAddress,
    closed: Arc<watch::Sender<bool>>,
}

impl PeerConnection {
    pub fn new(address: PeerAddress) -> Self {
        Self {
            address,
            closed: Arc::new(watch::channel(false).0),
        }
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn close(&self) {
        let _ = self.closed.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub async fn wait_closed(&self) {
        let mut closed = self.close_signal();
        loop {
            if *closed.borrow() {
                return;
            }

            if closed.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Issues the wire-level relay setup handshake with one candidate.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn send_setup_message(
        &self,
        candidate: &PeerAddress,
        config: &RelayConfig,
    ) -> Result<PeerConnection, RelayError>;
}

/// Failure memory with per-entry expiry, so a transiently broken candidate
/// becomes eligible again after the wait time.
pub(crate) struct ExpiringSet {
    ttl: Duration,
    entries: HashMap<PeerAddress, Instant>,
}

impl ExpiringSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, peer: PeerAddress) {
        self.entries.insert(peer, Instant::now());
    }

    pub fn contains(&mut self, peer: &PeerAddress) -> bool {
        let ttl = self.ttl;
        self.entries.retain(|_, inserted| inserted.elapsed() < ttl);
        self.entries.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
