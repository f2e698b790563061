use parking_lot::RwLock;
use service::Routing;

use codec::address::PeerAddress;

/// A seed routing table fed from the configured bootstrap peers.
///
/// The iterative lookup machinery lives outside this crate; until it is
/// wired in, the relay subsystem draws its candidates from here.
pub struct StaticRouting {
    peers: RwLock<Vec<PeerAddress>>,
}

impl StaticRouting {
    pub fn new(peers: Vec<PeerAddress>) -> Self {
        Self {
            peers: RwLock::new(peers),
        }
    }

    pub fn add(&self, peer: PeerAddress) {
        self.peers.write().push(peer);
    }
}

impl Routing for StaticRouting {
    fn neighbors(&self) -> Vec<PeerAddress> {
        self.peers.read().clone()
    }
}
