use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use codec::crypto::{self, PrivateKey};
use codec::id::Id160;
use dht_node_service::peer::{Peer, PeerCreator, PeerOptions};
use dht_node_service::rpc::ping::ping;
use dht_node_service::sender::{RequestError, Transport};
use rand::SeedableRng;

fn test_key() -> PrivateKey {
    static KEY: OnceLock<PrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        crypto::generate_keypair(&mut rng)
    })
    .clone()
}

fn options(id: u32) -> PeerOptions {
    let mut options = PeerOptions::new(Id160::from_words([0, 0, 0, 0, id]), test_key());
    options.tcp_listen = "127.0.0.1:0".parse().unwrap();
    options.udp_listen = "127.0.0.1:0".parse().unwrap();
    options.timeout = Duration::from_millis(500);
    options
}

#[tokio::test]
async fn masters_ping_each_other() -> Result<()> {
    let alice = PeerCreator::master(options(1)).await?;
    let bob = PeerCreator::master(options(2)).await?;

    let sender = &alice.connection().sender;
    ping(sender, alice.address(), bob.address(), Transport::Udp).await?;
    ping(sender, alice.address(), bob.address(), Transport::Tcp).await?;

    alice.shutdown().await;
    bob.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn unknown_recipient_answers_with_a_typed_response() -> Result<()> {
    let alice = PeerCreator::master(options(1)).await?;
    let bob = PeerCreator::master(options(2)).await?;

    // Address the message at an identity bob never registered.
    let stranger = bob.address().with_id(Id160::MAX);
    let result = ping(
        &alice.connection().sender,
        alice.address(),
        stranger,
        Transport::Udp,
    )
    .await;

    match result {
        Err(RequestError::Rejected(kind)) => {
            assert_eq!(kind, codec::message::MessageType::UnknownId)
        }
        other => panic!("unexpected result: {:?}", other),
    }

    alice.shutdown().await;
    bob.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn slaves_dispatch_independently() -> Result<()> {
    let alice = PeerCreator::master(options(1)).await?;
    let master = PeerCreator::master(options(2)).await?;

    let first = PeerCreator::slave(&master, Id160::from_words([0, 0, 0, 0, 10]), test_key());
    let second = PeerCreator::slave(&master, Id160::from_words([0, 0, 0, 0, 11]), test_key());

    let sender = &alice.connection().sender;
    ping(sender, alice.address(), first.address(), Transport::Udp).await?;
    ping(sender, alice.address(), second.address(), Transport::Udp).await?;

    // Shutting one slave down deregisters that identity only.
    first.shutdown().await;
    assert!(!master.connection().dispatcher.is_registered(&first.id()));
    assert!(master.connection().dispatcher.is_registered(&second.id()));

    let rejected = ping(sender, alice.address(), first.address(), Transport::Udp).await;
    assert!(matches!(
        rejected,
        Err(RequestError::Rejected(
            codec::message::MessageType::UnknownId
        ))
    ));

    ping(sender, alice.address(), second.address(), Transport::Udp).await?;
    ping(sender, alice.address(), master.address(), Transport::Udp).await?;

    alice.shutdown().await;
    master.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn master_shutdown_takes_slaves_down() -> Result<()> {
    let master = PeerCreator::master(options(1)).await?;
    let slave = PeerCreator::slave(&master, Id160::from_words([0, 0, 0, 0, 10]), test_key());

    master.shutdown().await;

    assert!(slave.is_shutdown());
    slave.closed().await;

    Ok(())
}

async fn silent_udp_peer() -> Result<(std::net::UdpSocket, SocketAddr)> {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
    let address = socket.local_addr()?;
    Ok((socket, address))
}

#[tokio::test]
async fn request_without_response_times_out() -> Result<()> {
    let alice = PeerCreator::master(options(1)).await?;
    let (_socket, silent) = silent_udp_peer().await?;

    let mut target = alice.address().with_id(Id160::MAX);
    target.udp_port = silent.port();

    let result = ping(
        &alice.connection().sender,
        alice.address(),
        target,
        Transport::Udp,
    )
    .await;

    assert!(matches!(result, Err(RequestError::Timeout)));

    alice.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn cancelling_a_request_releases_its_slot() -> Result<()> {
    let alice = PeerCreator::master(options(1)).await?;
    let (_socket, silent) = silent_udp_peer().await?;

    let mut target = alice.address().with_id(Id160::MAX);
    target.udp_port = silent.port();

    let message = codec::message::Message::request(
        codec::message::Command::Ping,
        alice.address(),
        target,
    );

    let sender = &alice.connection().sender;
    let future = sender.send(message, Transport::Udp).await?;
    assert_eq!(sender.pending().len(), 1);

    future.cancel();
    assert!(sender.pending().is_empty());

    alice.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn shutdown_cancels_in_flight_requests_and_releases_ports() -> Result<()> {
    let alice = PeerCreator::master(options(1)).await?;
    let (_socket, silent) = silent_udp_peer().await?;

    let mut target = alice.address().with_id(Id160::MAX);
    target.udp_port = silent.port();

    let message = codec::message::Message::request(
        codec::message::Command::Ping,
        alice.address(),
        target,
    );

    let future = alice
        .connection()
        .sender
        .send(message, Transport::Udp)
        .await?;

    let tcp_addr = alice.connection().server.tcp_local();
    let udp_addr = alice.connection().server.udp_local();

    alice.shutdown().await;

    // Deregistered first, outstanding requests failed with cancellation.
    assert!(!alice.connection().dispatcher.is_registered(&alice.id()));
    assert!(matches!(
        future.response().await,
        Err(RequestError::Cancelled)
    ));

    // Both ports are free again once the shutdown completed.
    drop(tokio::net::TcpListener::bind(tcp_addr).await?);
    drop(tokio::net::UdpSocket::bind(udp_addr).await?);

    // A second shutdown observes the already-completed teardown.
    alice.shutdown().await;
    assert!(alice.is_shutdown());

    Ok(())
}

#[tokio::test]
async fn bind_conflict_fails_construction() -> Result<()> {
    let alice = PeerCreator::master(options(1)).await?;

    let mut conflicting = options(2);
    conflicting.tcp_listen = alice.connection().server.tcp_local();
    assert!(PeerCreator::master(conflicting).await.is_err());

    alice.shutdown().await;

    Ok(())
}

#[allow(dead_code)]
fn assert_peer_is_send_and_sync(peer: Peer) -> impl Send + Sync {
    peer
}
