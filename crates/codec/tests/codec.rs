use std::net::SocketAddr;
use std::sync::OnceLock;

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use dht_node_codec::address::{Flags, PeerAddress, PeerSocketAddress};
use dht_node_codec::crypto::{self, PrivateKey};
use dht_node_codec::data::Data;
use dht_node_codec::decoder::MessageDecoder;
use dht_node_codec::encoder::MessageEncoder;
use dht_node_codec::id::Id160;
use dht_node_codec::message::{Command, Message, MessageType, Payload};
use rand::SeedableRng;

fn test_key() -> &'static PrivateKey {
    static KEY: OnceLock<PrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        crypto::generate_keypair(&mut rng)
    })
}

fn sender() -> PeerAddress {
    PeerAddress::new(Id160::ZERO, "127.0.0.1".parse().unwrap(), 7070, 7070)
}

fn remote() -> Option<SocketAddr> {
    Some("127.0.0.1:7070".parse().unwrap())
}

#[test]
fn header_layout() -> Result<()> {
    let mut message = Message::new(
        Command::Ping,
        MessageType::Request1,
        sender(),
        PeerAddress::from_id(Id160::MAX),
    );
    message.set_version(0x01020304);
    message.set_id(0x05060708);

    let mut bytes = BytesMut::new();
    MessageEncoder::default().encode(&message, &mut bytes)?;

    assert_eq!(bytes.len(), 64);
    assert_eq!(&bytes[0..4], &[0x01, 0x02, 0x03, 0x04]);
    assert_eq!(&bytes[4..8], &[0x05, 0x06, 0x07, 0x08]);
    assert_eq!(bytes[8], 0x00);
    assert_eq!(&bytes[9..29], Id160::ZERO.as_bytes());
    assert_eq!(&bytes[29..31], &7070u16.to_be_bytes());
    assert_eq!(&bytes[31..33], &7070u16.to_be_bytes());
    assert_eq!(&bytes[33..53], Id160::MAX.as_bytes());
    assert_eq!(&bytes[53..57], &[0, 0, 0, 0]);
    assert_eq!(&bytes[57..59], &[0, 0]);
    // Not forwarded, so no sender IP in the header tail.
    assert_eq!(&bytes[60..64], &[0, 0, 0, 0]);

    let decoded = MessageDecoder::decode(&bytes, remote())?;
    assert_eq!(decoded, message);

    Ok(())
}

#[test]
fn forwarded_sender_ip_rides_in_the_header() -> Result<()> {
    let mut sender = PeerAddress::new(
        Id160::from_words([1, 2, 3, 4, 5]),
        "192.0.2.7".parse().unwrap(),
        4000,
        4001,
    );
    sender.flags.forwarded = true;

    let message = Message::request(Command::Ping, sender, PeerAddress::from_id(Id160::MAX));

    let mut bytes = BytesMut::new();
    MessageEncoder::default().encode(&message, &mut bytes)?;
    assert_eq!(&bytes[60..64], &[192, 0, 2, 7]);

    // No observed remote needed, the header itself carries the address.
    let decoded = MessageDecoder::decode(&bytes, None)?;
    assert_eq!(decoded, message);

    Ok(())
}

#[test]
fn payload_round_trip() -> Result<()> {
    let neighbor = PeerAddress::new(
        Id160::from_words([9, 9, 9, 9, 9]),
        "10.1.2.3".parse().unwrap(),
        1234,
        1235,
    );

    let mut relayed = PeerAddress::new(
        Id160::from_words([7, 7, 7, 7, 7]),
        "2001:db8::1".parse().unwrap(),
        80,
        81,
    );
    relayed.flags = Flags {
        firewalled_tcp: true,
        firewalled_udp: true,
        relayed: true,
        slow: true,
        forwarded: false,
    };
    relayed.relays = vec![PeerSocketAddress {
        ip: "10.0.0.9".parse().unwrap(),
        tcp_port: 700,
        udp_port: 701,
    }];

    let mut message = Message::request(
        Command::Neighbors,
        sender(),
        PeerAddress::from_id(Id160::from_words([0, 0, 0, 0, 2])),
    );
    message.add_payload(Payload::KeyKey(Id160::ZERO, Id160::MAX))?;
    message.add_payload(Payload::SetNeighbors(vec![neighbor, relayed]))?;
    message.add_payload(Payload::MapKeyData(vec![(
        Id160::from_words([1, 1, 1, 1, 1]),
        Data::new(Bytes::from_static(b"value")).with_ttl(3600)?.with_protection(),
    )]))?;
    message.add_payload(Payload::Long(0xdead_beef_cafe))?;

    let mut bytes = BytesMut::new();
    MessageEncoder::default().encode(&message, &mut bytes)?;

    // Emitted payload bytes match the declared content length.
    let declared = u32::from_be_bytes([bytes[53], bytes[54], bytes[55], bytes[56]]) as usize;
    assert_eq!(bytes.len() - 64, declared);
    assert_eq!(MessageDecoder::message_size(&bytes)?, bytes.len());

    let decoded = MessageDecoder::decode(&bytes, remote())?;
    assert_eq!(decoded, message);

    Ok(())
}

#[test]
fn collection_payloads_round_trip() -> Result<()> {
    let mut message = Message::request(
        Command::Broadcast,
        sender(),
        PeerAddress::from_id(Id160::from_words([8, 8, 8, 8, 8])),
    );
    message.add_payload(Payload::SetKeys(vec![
        Id160::ZERO,
        Id160::MAX,
        Id160::from_words([1, 2, 3, 4, 5]),
    ]))?;
    message.add_payload(Payload::MapKeyKey(vec![(Id160::ZERO, Id160::MAX)]))?;
    message.add_payload(Payload::ChannelBuffer(Bytes::from_static(b"opaque bytes")))?;
    message.add_payload(Payload::Integer(7))?;

    let mut bytes = BytesMut::new();
    MessageEncoder::default().encode(&message, &mut bytes)?;

    let declared = u32::from_be_bytes([bytes[53], bytes[54], bytes[55], bytes[56]]) as usize;
    assert_eq!(bytes.len() - 64, declared);

    let decoded = MessageDecoder::decode(&bytes, remote())?;
    assert_eq!(decoded, message);

    Ok(())
}

#[test]
fn signed_data_atoms_round_trip() -> Result<()> {
    let data = Data::new(Bytes::from_static(b"payload"))
        .with_ttl(60)?
        .with_public_key(test_key().public_key()?)
        .with_signature(Bytes::from_static(&[0x11; 40]))?;

    let mut message = Message::request(Command::Add, sender(), PeerAddress::from_id(Id160::MAX));
    message.add_payload(Payload::MapKeyData(vec![(Id160::ZERO, data)]))?;

    let mut bytes = BytesMut::new();
    MessageEncoder::default().encode(&message, &mut bytes)?;

    let decoded = MessageDecoder::decode(&bytes, remote())?;
    assert_eq!(decoded, message);

    match &decoded.payloads()[0] {
        Payload::MapKeyData(entries) => {
            assert_eq!(entries[0].1.signature().map(|it| it.len()), Some(40));
            assert!(entries[0].1.public_key().is_some());
        }
        payload => panic!("unexpected payload: {:?}", payload),
    }

    Ok(())
}

#[test]
fn neighbor_set_is_capped_at_255() -> Result<()> {
    let neighbors = (0..300u32)
        .map(|index| {
            PeerAddress::new(
                Id160::from_words([0, 0, 0, 0, index]),
                "10.0.0.1".parse().unwrap(),
                1000,
                1001,
            )
        })
        .collect::<Vec<_>>();

    let mut message = Message::request(
        Command::Neighbors,
        sender(),
        PeerAddress::from_id(Id160::MAX),
    );
    message.add_payload(Payload::SetNeighbors(neighbors))?;

    let mut bytes = BytesMut::new();
    MessageEncoder::default().encode(&message, &mut bytes)?;

    // First payload byte is the count, capped at the one-byte maximum.
    assert_eq!(bytes[64], 255);

    let decoded = MessageDecoder::decode(&bytes, remote())?;
    match &decoded.payloads()[0] {
        Payload::SetNeighbors(decoded) => assert_eq!(decoded.len(), 255),
        payload => panic!("unexpected payload: {:?}", payload),
    }

    Ok(())
}

#[test]
fn configured_neighbor_limit_applies() -> Result<()> {
    let neighbors = (0..40u32)
        .map(|index| {
            PeerAddress::new(
                Id160::from_words([0, 0, 0, 0, index]),
                "10.0.0.1".parse().unwrap(),
                1000,
                1001,
            )
        })
        .collect::<Vec<_>>();

    let mut message = Message::request(
        Command::Neighbors,
        sender(),
        PeerAddress::from_id(Id160::MAX),
    );
    message.add_payload(Payload::SetNeighbors(neighbors))?;

    let mut bytes = BytesMut::new();
    MessageEncoder::with_neighbor_limit(8).encode(&message, &mut bytes)?;
    assert_eq!(bytes[64], 8);

    Ok(())
}

#[test]
fn signed_message_verifies_and_patches_inherited_keys() -> Result<()> {
    let key = test_key();
    let public_key = key.public_key()?;

    let mut message = Message::request(
        Command::TrackerAdd,
        sender(),
        PeerAddress::from_id(Id160::MAX),
    );
    message.add_payload(Payload::Integer(42))?;
    message.add_payload(Payload::MapKeyData(vec![(
        Id160::from_words([3, 3, 3, 3, 3]),
        Data::new(Bytes::from_static(b"tracked"))
            .with_public_key(public_key.clone())
            .with_inherited_key(),
    )]))?;
    message.add_payload(Payload::PublicKeySignature(public_key.clone()))?;
    message.sign_with(key.clone());

    let mut bytes = BytesMut::new();
    MessageEncoder::default().encode(&message, &mut bytes)?;

    // The signing slot accounts for its 40 signature bytes up front.
    let declared = u32::from_be_bytes([bytes[53], bytes[54], bytes[55], bytes[56]]) as usize;
    assert_eq!(bytes.len() - 64, declared);

    let decoded = MessageDecoder::decode(&bytes, remote())?;
    assert_eq!(decoded.public_key(), Some(&public_key));
    assert_eq!(decoded.payloads()[0], Payload::Integer(42));
    match &decoded.payloads()[1] {
        Payload::MapKeyData(entries) => {
            assert_eq!(entries[0].1.public_key(), Some(&public_key));
        }
        payload => panic!("unexpected payload: {:?}", payload),
    }

    assert_eq!(decoded, message);

    Ok(())
}

#[test]
fn flipped_payload_byte_fails_verification() -> Result<()> {
    let key = test_key();
    let public_key = key.public_key()?;

    let mut message = Message::request(Command::Put, sender(), PeerAddress::from_id(Id160::MAX));
    message.add_payload(Payload::Integer(42))?;
    message.add_payload(Payload::PublicKeySignature(public_key))?;
    message.sign_with(key.clone());

    let mut bytes = BytesMut::new();
    MessageEncoder::default().encode(&message, &mut bytes)?;

    // Flip one bit inside the integer payload.
    let mut tampered = bytes.to_vec();
    tampered[65] ^= 0x01;

    let decoded = MessageDecoder::decode(&tampered, remote())?;
    assert!(decoded.public_key().is_none());

    // The untampered buffer still verifies.
    let decoded = MessageDecoder::decode(&bytes, remote())?;
    assert!(decoded.public_key().is_some());

    Ok(())
}

#[test]
fn truncated_buffers_name_the_failing_field() {
    let mut message = Message::request(Command::Get, sender(), PeerAddress::from_id(Id160::MAX));
    message.add_payload(Payload::Key(Id160::MAX)).unwrap();

    let mut bytes = BytesMut::new();
    MessageEncoder::default().encode(&message, &mut bytes).unwrap();

    assert!(MessageDecoder::decode(&bytes[..40], remote()).is_err());
    assert!(MessageDecoder::decode(&bytes[..70], remote()).is_err());
}
