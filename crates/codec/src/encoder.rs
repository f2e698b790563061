use crate::{
    Error, HEADER_BYTES,
    crypto::SIGNATURE_BYTES,
    message::{ContentType, Message, Payload},
};

use std::net::IpAddr;

use bytes::{BufMut, BytesMut};

/// Message serializer.
///
/// The content length is the sum of the per-slot lengths and is computed
/// before the header is written; the signing slot contributes the 40
/// signature bytes up front, so nothing is patched after signing.
///
/// ```
/// use bytes::BytesMut;
/// use dht_node_codec::address::PeerAddress;
/// use dht_node_codec::encoder::MessageEncoder;
/// use dht_node_codec::id::Id160;
/// use dht_node_codec::message::{Command, Message, MessageType};
///
/// let sender = PeerAddress::new(Id160::ZERO, "127.0.0.1".parse().unwrap(), 7070, 7070);
/// let message = Message::request(Command::Ping, sender, PeerAddress::from_id(Id160::MAX));
///
/// let mut bytes = BytesMut::with_capacity(1500);
/// MessageEncoder::default().encode(&message, &mut bytes).unwrap();
///
/// assert_eq!(bytes.len(), 64);
/// ```
pub struct MessageEncoder {
    neighbor_limit: usize,
}

impl Default for MessageEncoder {
    fn default() -> Self {
        Self {
            neighbor_limit: u8::MAX as usize,
        }
    }
}

impl MessageEncoder {
    /// Cap the number of neighbors a `SetNeighbors` slot will carry. The
    /// wire prefix is one byte, so the effective cap never exceeds 255.
    pub fn with_neighbor_limit(neighbor_limit: usize) -> Self {
        Self { neighbor_limit }
    }

    pub fn encode(&self, message: &Message, bytes: &mut BytesMut) -> Result<(), Error> {
        bytes.clear();

        let content_length = self.content_length(message)?;

        bytes.put_u32(message.version());
        bytes.put_u32(message.id());
        bytes.put_u8((u8::from(message.kind()) << 4) | u8::from(message.command()));

        let sender = message.sender();
        sender.id.encode(bytes);
        bytes.put_u16(sender.tcp_port);
        bytes.put_u16(sender.udp_port);

        message.recipient().id.encode(bytes);
        bytes.put_u32(content_length);
        bytes.put_u16(self.content_types(message));
        bytes.put_u8(sender.options());

        // Only a forwarded IPv4 sender address fits the tail of the header;
        // in every other case the receiver learns the IP from the socket.
        match sender.ip {
            IpAddr::V4(ip) if sender.flags.forwarded => bytes.put(ip.octets().as_slice()),
            _ => bytes.put_u32(0),
        }

        debug_assert_eq!(bytes.len(), HEADER_BYTES);

        for payload in message.payloads() {
            self.encode_payload(payload, bytes)?;
        }

        if message
            .payloads()
            .iter()
            .any(|it| it.content_type() == ContentType::PublicKeySignature)
        {
            let key = message.private_key().ok_or(Error::MissingPrivateKey)?;
            let signature = key.sign(&[&bytes[..]])?;
            bytes.put(signature.r.as_slice());
            bytes.put(signature.s.as_slice());
        }

        debug_assert_eq!(bytes.len(), HEADER_BYTES + content_length as usize);

        Ok(())
    }

    fn content_types(&self, message: &Message) -> u16 {
        let mut types = 0u16;
        for slot in (0..crate::message::PAYLOAD_SLOTS).rev() {
            let kind = message
                .payloads()
                .get(slot)
                .map(|it| it.content_type())
                .unwrap_or(ContentType::Empty);

            types = (types << 4) | u8::from(kind) as u16;
        }

        types
    }

    fn content_length(&self, message: &Message) -> Result<u32, Error> {
        let mut length = 0usize;
        for payload in message.payloads() {
            length += self.payload_size(payload)?;
        }

        u32::try_from(length).map_err(|_| Error::Oversized("content length"))
    }

    fn payload_size(&self, payload: &Payload) -> Result<usize, Error> {
        Ok(match payload {
            Payload::Key(..) => 20,
            Payload::KeyKey(..) => 40,
            Payload::MapKeyData(entries) => {
                let mut size = 4;
                for (_, data) in entries {
                    size += 20 + data.size()?;
                }

                size
            }
            Payload::MapKeyKey(entries) => 4 + entries.len() * 40,
            Payload::SetKeys(keys) => 4 + keys.len() * 20,
            Payload::SetNeighbors(neighbors) => {
                let mut size = 1;
                for neighbor in self.capped_neighbors(neighbors) {
                    size += neighbor.size();
                }

                size
            }
            Payload::ChannelBuffer(buffer) => 4 + buffer.len(),
            Payload::Long(..) => 8,
            Payload::Integer(..) => 4,
            Payload::MapPeerData(entries) => {
                let mut size = 1;
                for (peer, data) in entries.iter().take(u8::MAX as usize) {
                    size += peer.size() + data.size()?;
                }

                size
            }
            Payload::PublicKey(key) => {
                2 + check_key_len(key.as_der().len())?
            }
            Payload::PublicKeySignature(key) => {
                2 + check_key_len(key.as_der().len())? + SIGNATURE_BYTES
            }
        })
    }

    fn encode_payload(&self, payload: &Payload, bytes: &mut BytesMut) -> Result<(), Error> {
        match payload {
            Payload::Key(key) => key.encode(bytes),
            Payload::KeyKey(first, second) => {
                first.encode(bytes);
                second.encode(bytes);
            }
            Payload::MapKeyData(entries) => {
                bytes.put_u32(entries.len() as u32);
                for (key, data) in entries {
                    key.encode(bytes);
                    data.encode(bytes)?;
                }
            }
            Payload::MapKeyKey(entries) => {
                bytes.put_u32(entries.len() as u32);
                for (first, second) in entries {
                    first.encode(bytes);
                    second.encode(bytes);
                }
            }
            Payload::SetKeys(keys) => {
                bytes.put_u32(keys.len() as u32);
                for key in keys {
                    key.encode(bytes);
                }
            }
            Payload::SetNeighbors(neighbors) => {
                let neighbors = self.capped_neighbors(neighbors);
                bytes.put_u8(neighbors.len() as u8);
                for neighbor in neighbors {
                    neighbor.encode(bytes);
                }
            }
            Payload::ChannelBuffer(buffer) => {
                bytes.put_u32(buffer.len() as u32);
                bytes.put(buffer.as_ref());
            }
            Payload::Long(value) => bytes.put_u64(*value),
            Payload::Integer(value) => bytes.put_u32(*value),
            Payload::MapPeerData(entries) => {
                let entries = &entries[..entries.len().min(u8::MAX as usize)];
                bytes.put_u8(entries.len() as u8);
                for (peer, data) in entries {
                    peer.encode(bytes);
                    data.encode(bytes)?;
                }
            }
            Payload::PublicKey(key) | Payload::PublicKeySignature(key) => {
                bytes.put_u16(check_key_len(key.as_der().len())? as u16);
                bytes.put(key.as_der());
            }
        }

        Ok(())
    }

    fn capped_neighbors<'a>(
        &self,
        neighbors: &'a [crate::address::PeerAddress],
    ) -> &'a [crate::address::PeerAddress] {
        let cap = self.neighbor_limit.min(u8::MAX as usize).min(neighbors.len());
        &neighbors[..cap]
    }
}

fn check_key_len(len: usize) -> Result<usize, Error> {
    if len >= u16::MAX as usize {
        return Err(Error::Oversized("public key"));
    }

    Ok(len)
}
