use crate::{
    Error, HEADER_BYTES, Reader,
    address::{Flags, PeerAddress},
    crypto::{MessageSignature, PublicKey, SIGNATURE_COMPONENT_BYTES},
    data::Data,
    message::{Command, ContentType, Message, MessageType, PAYLOAD_SLOTS, Payload},
};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;

/// Message deserializer, the exact inverse of the encoder.
///
/// The caller passes the address the socket observed; for a sender that is
/// not port-forwarded the header carries no IP and the observed address is
/// the only truth. Keeping both is how a peer detects that a NAT rewrote
/// its coordinates.
pub struct MessageDecoder;

impl MessageDecoder {
    /// Total size of the message beginning at `bytes`, for framing a TCP
    /// stream. Needs the header up to and including the content length.
    pub fn message_size(bytes: &[u8]) -> Result<usize, Error> {
        if bytes.len() < 57 {
            return Err(Error::UnexpectedEnd("content length"));
        }

        let length = u32::from_be_bytes([bytes[53], bytes[54], bytes[55], bytes[56]]);
        Ok(HEADER_BYTES + length as usize)
    }

    pub fn decode(bytes: &[u8], remote: Option<SocketAddr>) -> Result<Message, Error> {
        let mut reader = Reader::new(bytes);

        let version = reader.get_u32("version")?;
        let id = reader.get_u32("message id")?;
        let packed = reader.get_u8("type and command")?;

        // Every nibble value maps onto a variant, reserved ones included.
        let kind = MessageType::try_from(packed >> 4).map_err(|_| Error::BadLength("type"))?;
        let command = Command::try_from(packed & 0x0f).map_err(|_| Error::BadLength("command"))?;

        let sender_id = reader.get_id("sender id")?;
        let tcp_port = reader.get_u16("sender tcp port")?;
        let udp_port = reader.get_u16("sender udp port")?;
        let recipient_id = reader.get_id("recipient id")?;
        let content_length = reader.get_u32("content length")? as usize;
        let content_types = reader.get_u16("content types")?;
        let options = reader.get_u8("sender options")?;
        let header_ip = reader.take(4, "sender ip")?;

        let flags = Flags::from_options(options);
        let ipv6 = options & 0b0000_0001 != 0;

        let ip = if flags.forwarded && !ipv6 {
            IpAddr::V4(Ipv4Addr::new(
                header_ip[0],
                header_ip[1],
                header_ip[2],
                header_ip[3],
            ))
        } else if let Some(remote) = remote {
            remote.ip()
        } else if ipv6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };

        let mut sender = PeerAddress::new(sender_id, ip, tcp_port, udp_port);
        sender.flags = flags;

        let mut message = Message::new(command, kind, sender, PeerAddress::from_id(recipient_id));
        message.set_version(version);
        message.set_id(id);
        if let Some(remote) = remote {
            message.set_real_sender(remote);
        }

        let mut verified = None;
        for slot in 0..PAYLOAD_SLOTS {
            let kind = ContentType::try_from(((content_types >> (slot * 4)) & 0x0f) as u8)
                .map_err(|_| Error::BadLength("content type"))?;

            if let Some(payload) = Self::decode_payload(kind, &mut reader, &mut verified)? {
                message.push_payload(payload);
            }
        }

        if reader.position() - HEADER_BYTES != content_length {
            return Err(Error::BadLength("content length"));
        }

        if let Some(key) = verified {
            message.set_public_key(key);
        }

        Ok(message)
    }

    fn decode_payload(
        kind: ContentType,
        reader: &mut Reader,
        verified: &mut Option<PublicKey>,
    ) -> Result<Option<Payload>, Error> {
        Ok(Some(match kind {
            ContentType::Empty | ContentType::Reserved1 | ContentType::Reserved2
            | ContentType::Reserved3 => return Ok(None),
            ContentType::Key => Payload::Key(reader.get_id("key")?),
            ContentType::KeyKey => {
                Payload::KeyKey(reader.get_id("first key")?, reader.get_id("second key")?)
            }
            ContentType::MapKeyData => {
                let size = reader.get_u32("key-data map size")? as usize;
                let mut entries = Vec::with_capacity(size.min(1024));
                for _ in 0..size {
                    let key = reader.get_id("map key")?;
                    entries.push((key, Data::decode(reader)?));
                }

                Payload::MapKeyData(entries)
            }
            ContentType::MapKeyKey => {
                let size = reader.get_u32("key-key map size")? as usize;
                let mut entries = Vec::with_capacity(size.min(1024));
                for _ in 0..size {
                    entries.push((reader.get_id("map key")?, reader.get_id("map value")?));
                }

                Payload::MapKeyKey(entries)
            }
            ContentType::SetKeys => {
                let size = reader.get_u32("key set size")? as usize;
                let mut keys = Vec::with_capacity(size.min(1024));
                for _ in 0..size {
                    keys.push(reader.get_id("set key")?);
                }

                Payload::SetKeys(keys)
            }
            ContentType::SetNeighbors => {
                let size = reader.get_u8("neighbor count")? as usize;
                let mut neighbors = Vec::with_capacity(size);
                for _ in 0..size {
                    neighbors.push(PeerAddress::decode(reader)?);
                }

                Payload::SetNeighbors(neighbors)
            }
            ContentType::ChannelBuffer => {
                let size = reader.get_u32("buffer length")? as usize;
                Payload::ChannelBuffer(Bytes::copy_from_slice(reader.take(size, "buffer")?))
            }
            ContentType::Long => Payload::Long(reader.get_u64("long value")?),
            ContentType::Integer => Payload::Integer(reader.get_u32("integer value")?),
            ContentType::MapPeerData => {
                let size = reader.get_u8("peer-data map size")? as usize;
                let mut entries = Vec::with_capacity(size);
                for _ in 0..size {
                    let peer = PeerAddress::decode(reader)?;
                    entries.push((peer, Data::decode(reader)?));
                }

                Payload::MapPeerData(entries)
            }
            ContentType::PublicKey => {
                let size = reader.get_u16("public key length")? as usize;
                Payload::PublicKey(PublicKey::from_der(reader.take(size, "public key")?)?)
            }
            ContentType::PublicKeySignature => {
                let size = reader.get_u16("public key length")? as usize;
                let key = PublicKey::from_der(reader.take(size, "public key")?)?;

                // Everything up to here, header included, is covered by the
                // signature that follows.
                let signed = reader.readable();

                let mut signature = MessageSignature {
                    r: [0u8; SIGNATURE_COMPONENT_BYTES],
                    s: [0u8; SIGNATURE_COMPONENT_BYTES],
                };

                signature
                    .r
                    .copy_from_slice(reader.take(SIGNATURE_COMPONENT_BYTES, "signature r")?);
                signature
                    .s
                    .copy_from_slice(reader.take(SIGNATURE_COMPONENT_BYTES, "signature s")?);

                // A failed check leaves the message key unset; the payload
                // itself decoded fine and handlers decide what to reject.
                if key.verify(&[signed], &signature) {
                    *verified = Some(key.clone());
                }

                Payload::PublicKeySignature(key)
            }
        }))
    }
}
