use crate::{
    Error,
    address::PeerAddress,
    crypto::{PrivateKey, PublicKey},
    data::Data,
    id::Id160,
};

use std::net::SocketAddr;

use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Number of payload slots in a message.
pub const PAYLOAD_SLOTS: usize = 4;

/// The sixteen overlay operations, packed into the low nibble of header
/// byte eight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Command {
    Ping = 0,
    Put = 1,
    Get = 2,
    Add = 3,
    Remove = 4,
    Neighbors = 5,
    Quit = 6,
    DirectData = 7,
    TrackerAdd = 8,
    TrackerGet = 9,
    Pex = 10,
    Task = 11,
    Broadcast = 12,
    RelaySetup = 13,
    RelayData = 14,
    Reserved15 = 15,
}

/// The sixteen message types, packed into the high nibble of header byte
/// eight. Values unknown to this build land in the reserved variants so a
/// newer peer never crashes an older one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    Request1 = 0,
    Request2 = 1,
    Request3 = 2,
    Request4 = 3,
    Ok = 4,
    PartiallyOk = 5,
    NotFound = 6,
    Denied = 7,
    UnknownId = 8,
    Exception = 9,
    Cancel = 10,
    User1 = 11,
    User2 = 12,
    Reserved13 = 13,
    Reserved14 = 14,
    Reserved15 = 15,
}

impl MessageType {
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::Request1 | Self::Request2 | Self::Request3 | Self::Request4
        )
    }
}

/// Payload slot type tags as they appear in the content-type nibbles of the
/// header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ContentType {
    Empty = 0,
    Key = 1,
    KeyKey = 2,
    MapKeyData = 3,
    MapKeyKey = 4,
    SetKeys = 5,
    SetNeighbors = 6,
    ChannelBuffer = 7,
    Long = 8,
    Integer = 9,
    MapPeerData = 10,
    PublicKey = 11,
    PublicKeySignature = 12,
    Reserved1 = 13,
    Reserved2 = 14,
    Reserved3 = 15,
}

/// One typed payload slot value.
///
/// Map-valued slots are lists of pairs: encoding order is insertion order,
/// which keeps `decode(encode(m)) == m` bytewise. The wire format itself
/// promises no ordering.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Key(Id160),
    KeyKey(Id160, Id160),
    MapKeyData(Vec<(Id160, Data)>),
    MapKeyKey(Vec<(Id160, Id160)>),
    SetKeys(Vec<Id160>),
    SetNeighbors(Vec<PeerAddress>),
    ChannelBuffer(Bytes),
    Long(u64),
    Integer(u32),
    MapPeerData(Vec<(PeerAddress, Data)>),
    PublicKey(PublicKey),
    PublicKeySignature(PublicKey),
}

impl Payload {
    pub fn content_type(&self) -> ContentType {
        match self {
            Self::Key(..) => ContentType::Key,
            Self::KeyKey(..) => ContentType::KeyKey,
            Self::MapKeyData(..) => ContentType::MapKeyData,
            Self::MapKeyKey(..) => ContentType::MapKeyKey,
            Self::SetKeys(..) => ContentType::SetKeys,
            Self::SetNeighbors(..) => ContentType::SetNeighbors,
            Self::ChannelBuffer(..) => ContentType::ChannelBuffer,
            Self::Long(..) => ContentType::Long,
            Self::Integer(..) => ContentType::Integer,
            Self::MapPeerData(..) => ContentType::MapPeerData,
            Self::PublicKey(..) => ContentType::PublicKey,
            Self::PublicKeySignature(..) => ContentType::PublicKeySignature,
        }
    }
}

/// The in-memory message envelope.
///
/// Equality covers what the wire preserves: version, correlator, command,
/// type, sender, recipient identity and the payload slots. The signing key,
/// the verified public key and the socket-observed sender address are
/// transport state and stay out of it.
#[derive(Debug, Clone)]
pub struct Message {
    version: u32,
    id: u32,
    command: Command,
    kind: MessageType,
    sender: PeerAddress,
    recipient: PeerAddress,
    payloads: Vec<Payload>,
    private_key: Option<PrivateKey>,
    public_key: Option<PublicKey>,
    real_sender: Option<SocketAddr>,
}

impl Message {
    pub fn new(
        command: Command,
        kind: MessageType,
        sender: PeerAddress,
        recipient: PeerAddress,
    ) -> Self {
        Self {
            version: 0,
            id: 0,
            command,
            kind,
            sender,
            recipient,
            payloads: Vec::new(),
            private_key: None,
            public_key: None,
            real_sender: None,
        }
    }

    /// A first-round request.
    pub fn request(command: Command, sender: PeerAddress, recipient: PeerAddress) -> Self {
        Self::new(command, MessageType::Request1, sender, recipient)
    }

    /// A reply to `request`: same version, correlator and command, the typed
    /// outcome in `kind`, addressed back at the request's sender.
    pub fn response_to(request: &Message, kind: MessageType, sender: PeerAddress) -> Self {
        let mut message = Self::new(
            request.command,
            kind,
            sender,
            PeerAddress::from_id(request.sender.id),
        );
        message.version = request.version;
        message.id = request.id;
        message
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn sender(&self) -> &PeerAddress {
        &self.sender
    }

    pub fn recipient(&self) -> &PeerAddress {
        &self.recipient
    }

    pub fn payloads(&self) -> &[Payload] {
        &self.payloads
    }

    pub fn add_payload(&mut self, payload: Payload) -> Result<(), Error> {
        if self.payloads.len() >= PAYLOAD_SLOTS {
            return Err(Error::TooManyPayloads);
        }

        self.payloads.push(payload);
        Ok(())
    }

    pub(crate) fn push_payload(&mut self, payload: Payload) {
        self.payloads.push(payload);
    }

    /// Attach the key the encoder signs with. Signing also requires a
    /// [`Payload::PublicKeySignature`] slot so the declared content length
    /// accounts for the signature up front.
    pub fn sign_with(&mut self, key: PrivateKey) {
        self.private_key = Some(key);
    }

    pub fn private_key(&self) -> Option<&PrivateKey> {
        self.private_key.as_ref()
    }

    /// The sender's verified public key, set by the decoder only after the
    /// message signature checked out.
    pub fn public_key(&self) -> Option<&PublicKey> {
        self.public_key.as_ref()
    }

    pub(crate) fn set_public_key(&mut self, key: PublicKey) {
        for payload in self.payloads.iter_mut() {
            match payload {
                Payload::MapKeyData(entries) => {
                    for (_, data) in entries.iter_mut() {
                        data.patch_public_key(&key);
                    }
                }
                Payload::MapPeerData(entries) => {
                    for (_, data) in entries.iter_mut() {
                        data.patch_public_key(&key);
                    }
                }
                _ => {}
            }
        }

        self.public_key = Some(key);
    }

    /// The address the socket observed, recorded by the decoder. Differing
    /// from the sender's claimed coordinates means a NAT rewrote them.
    pub fn real_sender(&self) -> Option<SocketAddr> {
        self.real_sender
    }

    pub(crate) fn set_real_sender(&mut self, address: SocketAddr) {
        self.real_sender = Some(address);
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.id == other.id
            && self.command == other.command
            && self.kind == other.kind
            && self.sender == other.sender
            && self.recipient.id == other.recipient.id
            && self.payloads == other.payloads
    }
}
