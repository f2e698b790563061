use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use codec::address::PeerAddress;
use codec::crypto::{self, PrivateKey};
use codec::id::Id160;
use dht_node_service::Routing;
use dht_node_service::peer::PeerBean;
use dht_node_service::relay::distributed::DistributedRelay;
use dht_node_service::relay::{PeerConnection, RelayConfig, RelayConnector, RelayError};
use parking_lot::Mutex;

fn test_key() -> PrivateKey {
    static KEY: OnceLock<PrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = <rand::rngs::StdRng as rand::SeedableRng>::seed_from_u64(0x5eed);
        crypto::generate_keypair(&mut rng)
    })
    .clone()
}

fn candidate(id: u32) -> PeerAddress {
    PeerAddress::new(
        Id160::from_words([0, 0, 0, 0, id]),
        "10.0.0.1".parse().unwrap(),
        (7000 + id) as u16,
        (8000 + id) as u16,
    )
}

fn firewalled_bean() -> Arc<PeerBean> {
    let mut address = PeerAddress::new(
        Id160::from_words([9, 9, 9, 9, 9]),
        "192.0.2.1".parse().unwrap(),
        7700,
        7700,
    );
    address.flags.firewalled_tcp = true;
    address.flags.firewalled_udp = true;

    Arc::new(PeerBean::new(address, test_key()))
}

struct StaticRouting(Vec<PeerAddress>);

impl Routing for StaticRouting {
    fn neighbors(&self) -> Vec<PeerAddress> {
        self.0.clone()
    }
}

/// Accepts every candidate except the refused ones and remembers the
/// connections it handed out.
#[derive(Default)]
struct MockConnector {
    refused: Vec<Id160>,
    connections: Mutex<Vec<PeerConnection>>,
    attempts: Mutex<Vec<Id160>>,
}

impl MockConnector {
    fn connection_to(&self, id: &Id160) -> Option<PeerConnection> {
        self.connections
            .lock()
            .iter()
            .find(|connection| connection.address().id == *id)
            .cloned()
    }

    fn attempt_count(&self) -> usize {
        self.attempts.lock().len()
    }
}

#[async_trait]
impl RelayConnector for MockConnector {
    async fn send_setup_message(
        &self,
        candidate: &PeerAddress,
        _config: &RelayConfig,
    ) -> Result<PeerConnection, RelayError> {
        self.attempts.lock().push(candidate.id);

        if self.refused.contains(&candidate.id) {
            return Err(RelayError::Denied);
        }

        let connection = PeerConnection::new(candidate.clone());
        self.connections.lock().push(connection.clone());
        Ok(connection)
    }
}

async fn wait_until<F>(what: &str, predicate: F)
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if predicate() {
            return;
        }

        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    panic!("timed out waiting for: {}", what);
}

#[tokio::test]
async fn fills_slots_and_republishes_the_address() -> Result<()> {
    let bean = firewalled_bean();
    let connector = Arc::new(MockConnector::default());
    let routing = Arc::new(StaticRouting(vec![candidate(1), candidate(2), candidate(3)]));

    let relay = DistributedRelay::start(
        bean.clone(),
        routing,
        connector.clone(),
        RelayConfig {
            max_relays: 2,
            ..RelayConfig::default()
        },
    );

    wait_until("two relays", || relay.relays().len() == 2).await;
    wait_until("address republished", || bean.address().relays.len() == 2).await;

    let address = bean.address();
    assert_eq!(address.relays.len(), 2);
    assert!(address.flags.relayed);
    assert!(!address.flags.firewalled_tcp);
    assert!(!address.flags.firewalled_udp);

    relay.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn replaces_a_lost_relay() -> Result<()> {
    let bean = firewalled_bean();
    let connector = Arc::new(MockConnector::default());
    let routing = Arc::new(StaticRouting(vec![
        candidate(1),
        candidate(2),
        candidate(3),
        candidate(4),
    ]));

    let relay = DistributedRelay::start(
        bean.clone(),
        routing,
        connector.clone(),
        RelayConfig {
            max_relays: 2,
            ..RelayConfig::default()
        },
    );

    wait_until("two relays", || relay.relays().len() == 2).await;

    let lost = relay.relays()[0].clone();
    connector
        .connection_to(&lost.id)
        .expect("connection for an active relay")
        .close();

    wait_until("replacement connected", || {
        relay.relays().len() == 2 && !relay.relays().contains(&lost)
    })
    .await;
    wait_until("address republished", || bean.address().relays.len() == 2).await;

    // The closed peer is quarantined and the address still carries exactly
    // two relay sockets.
    assert!(relay.failed_count() >= 1);
    let address = bean.address();
    assert_eq!(address.relays.len(), 2);
    assert!(address.flags.relayed);

    relay.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn losing_the_last_relay_restores_the_firewalled_address() -> Result<()> {
    let bean = firewalled_bean();
    let connector = Arc::new(MockConnector::default());
    let routing = Arc::new(StaticRouting(vec![candidate(1)]));

    let relay = DistributedRelay::start(
        bean.clone(),
        routing,
        connector.clone(),
        RelayConfig {
            max_relays: 1,
            ..RelayConfig::default()
        },
    );

    wait_until("one relay", || relay.relays().len() == 1).await;
    assert!(bean.address().flags.relayed);

    connector
        .connection_to(&candidate(1).id)
        .expect("connection for the active relay")
        .close();

    // The only candidate is quarantined now, so the peer falls back to the
    // firewalled address.
    wait_until("no relays", || relay.relays().is_empty()).await;
    wait_until("address republished", || !bean.address().flags.relayed).await;

    let address = bean.address();
    assert!(address.relays.is_empty());
    assert!(address.flags.firewalled_tcp);
    assert!(address.flags.firewalled_udp);

    relay.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn refused_candidates_are_skipped() -> Result<()> {
    let bean = firewalled_bean();
    let connector = Arc::new(MockConnector {
        refused: vec![candidate(1).id],
        ..MockConnector::default()
    });
    let routing = Arc::new(StaticRouting(vec![candidate(1), candidate(2)]));

    let relay = DistributedRelay::start(
        bean.clone(),
        routing,
        connector.clone(),
        RelayConfig {
            max_relays: 1,
            ..RelayConfig::default()
        },
    );

    wait_until("the accepting relay", || {
        relay.relays().iter().any(|peer| peer.id == candidate(2).id)
    })
    .await;

    assert!(relay.failed_count() >= 1);

    relay.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn manual_relays_are_used_verbatim() -> Result<()> {
    let bean = firewalled_bean();
    let connector = Arc::new(MockConnector::default());

    // The routing layer would offer nothing; the manual list wins.
    let routing = Arc::new(StaticRouting(Vec::new()));

    let relay = DistributedRelay::start(
        bean.clone(),
        routing,
        connector.clone(),
        RelayConfig {
            max_relays: 1,
            manual_relays: vec![candidate(7)],
            ..RelayConfig::default()
        },
    );

    wait_until("the manual relay", || relay.relays().len() == 1).await;
    assert_eq!(relay.relays()[0].id, candidate(7).id);

    relay.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn shutdown_empties_the_active_set_exactly_once() -> Result<()> {
    let bean = firewalled_bean();
    let connector = Arc::new(MockConnector::default());
    let routing = Arc::new(StaticRouting(vec![candidate(1), candidate(2)]));

    let relay = DistributedRelay::start(
        bean.clone(),
        routing,
        connector.clone(),
        RelayConfig {
            max_relays: 2,
            ..RelayConfig::default()
        },
    );

    wait_until("two relays", || relay.relays().len() == 2).await;

    relay.shutdown().await;
    assert!(relay.relays().is_empty());

    let attempts = connector.attempt_count();

    // Idempotent, and no new setup goes out after completion.
    relay.shutdown().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.attempt_count(), attempts);

    Ok(())
}
