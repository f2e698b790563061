//! ## Peer core
//!
//! The runtime half of the overlay node: transport endpoints, the dispatch
//! table routing inbound messages to per-peer handlers, the request/response
//! bookkeeping with timeouts and cancellation, the master/slave peer
//! lifecycle over a shared I/O bundle, and the relay subsystem that keeps an
//! unreachable peer connected through public ones.
//!
//! The routing table, the tracker store and the NAT port-mapping probes are
//! collaborators behind the traits below; this crate only consumes them.

pub mod dispatcher;
pub mod peer;
pub mod pool;
pub mod relay;
pub mod rpc;
pub mod sender;
pub mod server;

use codec::{address::PeerAddress, crypto::PublicKey, data::Data, id::Id160};

/// Upper bound on a single message, header included. Anything larger is a
/// hostile or corrupt length prefix.
pub(crate) const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// The routing layer, the source of relay candidates.
pub trait Routing: Send + Sync {
    /// The current close neighbors, best first.
    fn neighbors(&self) -> Vec<PeerAddress>;

    /// Every peer the routing table currently knows.
    fn peer_map(&self) -> Vec<PeerAddress> {
        self.neighbors()
    }
}

/// Tracker storage consumed by the tracker operations.
pub trait TrackerStorage: Send + Sync {
    fn put(
        &self,
        location: &Id160,
        domain: &Id160,
        peer: &PeerAddress,
        public_key: Option<&PublicKey>,
        data: &Data,
    ) -> bool;

    fn get(&self, location: &Id160, domain: &Id160) -> Option<Vec<(PeerAddress, Data)>>;

    fn size(&self, location: &Id160, domain: &Id160) -> usize;

    fn max_size(&self) -> usize;
}

/// NAT port-mapping helper. `shutdown` blocks while mappings are released
/// and runs as the very last step of a master teardown.
pub trait NatHelper: Send + Sync {
    fn map_ports(&self, tcp_port: u16, udp_port: u16);

    fn shutdown(&self);
}

/// The helper used when no port mapping is wanted.
pub struct NoNat;

impl NatHelper for NoNat {
    fn map_ports(&self, _tcp_port: u16, _udp_port: u16) {}

    fn shutdown(&self) {}
}

/// Callbacks fired when the relay subsystem gains or loses a connection.
pub trait RelayListener: Send + Sync {
    fn relay_added(&self, relay: &PeerAddress);

    fn relay_removed(&self, relay: &PeerAddress);
}
