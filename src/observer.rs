use codec::address::PeerAddress;
use service::RelayListener;

/// Logs relay gains and losses of the local peer.
#[derive(Default, Clone)]
pub struct Observer;

impl RelayListener for Observer {
    fn relay_added(&self, relay: &PeerAddress) {
        log::info!(
            "relay added: peer={}, address={}:{}/{}",
            relay.id,
            relay.ip,
            relay.tcp_port,
            relay.udp_port
        );
    }

    fn relay_removed(&self, relay: &PeerAddress) {
        log::info!("relay removed: peer={}", relay.id);
    }
}
