pub mod config;
pub mod observer;
pub mod routing;
pub mod tracker;

use crate::{config::Config, observer::Observer, routing::StaticRouting, tracker::MemoryTracker};

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use codec::{crypto, message::Command};
use rand::SeedableRng;
use service::{
    peer::{Peer, PeerCreator, PeerOptions},
    relay::{RelayConfig, distributed::DistributedRelay},
    rpc::{
        relay::{RelayRpc, RelayServerRpc},
        tracker::TrackerRpc,
    },
    Routing,
};

/// A running node: the master peer plus, when firewalled, the relay
/// maintainer.
pub struct Node {
    peer: Arc<Peer>,
    relay: Option<Arc<DistributedRelay>>,
}

impl Node {
    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    pub async fn shutdown(&self) {
        if let Some(relay) = &self.relay {
            relay.shutdown().await;
        }

        self.peer.shutdown().await;
    }
}

/// In order to let integration tests start the node without going through
/// the binary, the whole wiring lives here instead of in the main function.
pub async fn startup(config: Arc<Config>) -> Result<Node> {
    // The node identity is ephemeral: a fresh key pair whose public half
    // hashes to the peer id.
    let mut rng = rand::rngs::StdRng::from_entropy();
    let private_key = crypto::generate_keypair(&mut rng);
    let id = crypto::public_key_id(&private_key.public_key()?);

    let mut options = PeerOptions::new(id, private_key);
    options.version = config.network.version;
    options.tcp_listen = config.network.tcp_listen;
    options.udp_listen = config.network.udp_listen;
    options.external_ip = config.network.external_ip;
    options.external_tcp_port = config.network.external_tcp_port;
    options.external_udp_port = config.network.external_udp_port;
    options.firewalled_tcp = config.network.firewalled;
    options.firewalled_udp = config.network.firewalled;
    options.reservations = config.runtime.reservations;
    options.timeout = Duration::from_secs(config.runtime.timeout);
    options.heartbeat = Duration::from_secs(config.runtime.heartbeat);
    options.mtu = config.network.mtu;

    let peer = PeerCreator::master(options).await?;

    let address = peer.address();
    peer.connection()
        .nat
        .map_ports(address.tcp_port, address.udp_port);

    peer.register_handler(
        service::rpc::tracker::COMMANDS,
        Arc::new(TrackerRpc::new(
            peer.bean().clone(),
            Arc::new(MemoryTracker::default()),
        )),
    );

    let mut bootstrap = Vec::with_capacity(config.network.bootstrap.len());
    for entry in &config.network.bootstrap {
        bootstrap.push(entry.to_address()?);
    }

    let routing = Arc::new(StaticRouting::new(bootstrap));

    // Periodic neighbor liveness checks, torn down with the peer.
    {
        let sender = peer.connection().sender.clone();
        let bean = peer.bean().clone();
        let routing = routing.clone();
        let heartbeat = peer.connection().dispatcher.heartbeat();

        peer.spawn_maintenance(async move {
            loop {
                tokio::time::sleep(heartbeat).await;
                for target in routing.neighbors() {
                    let result = service::rpc::ping::ping(
                        &sender,
                        bean.address(),
                        target.clone(),
                        service::sender::Transport::Udp,
                    )
                    .await;

                    if let Err(error) = result {
                        log::debug!("neighbor unreachable: peer={}, error={:?}", target.id, error);
                    }
                }
            }
        });
    }

    let relay = if config.network.firewalled {
        let mut manual_relays = Vec::with_capacity(config.relay.manual_relays.len());
        for entry in &config.relay.manual_relays {
            manual_relays.push(entry.to_address()?);
        }

        let connector = Arc::new(RelayRpc::new(
            peer.connection().sender.clone(),
            peer.bean().clone(),
            peer.connection().dispatcher.heartbeat(),
        ));

        peer.bean().add_relay_listener(Arc::new(Observer));

        Some(DistributedRelay::start(
            peer.bean().clone(),
            routing,
            connector,
            RelayConfig {
                max_relays: config.relay.max_relays,
                failure_ttl: Duration::from_secs(config.relay.failure_ttl),
                manual_relays,
                slow: config.relay.slow,
            },
        ))
    } else {
        // A reachable node offers relay connectivity to firewalled ones.
        peer.register_handler(
            &[Command::RelaySetup],
            Arc::new(RelayServerRpc::new(
                peer.bean().clone(),
                config.relay.max_clients,
            )),
        );

        None
    };

    log::info!(
        "node started: id={}, firewalled={}",
        peer.id(),
        config.network.firewalled
    );

    Ok(Node { peer, relay })
}
