use crate::{Error, Reader, id::Id160};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};

/// Upper bound on relay endpoints a peer may advertise.
pub const MAX_RELAYS: usize = 5;

const IPV6: u8 = 0b0000_0001;
const FIREWALL_UDP: u8 = 0b0000_0010;
const FIREWALL_TCP: u8 = 0b0000_0100;
const RELAYED: u8 = 0b0000_1000;
const SLOW: u8 = 0b0001_0000;
const FORWARDED: u8 = 0b0010_0000;

/// Reachability flags carried in the address options byte.
///
/// The IPv6 bit of the wire encoding is derived from the address itself and
/// never stored here.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flags {
    pub firewalled_tcp: bool,
    pub firewalled_udp: bool,
    pub relayed: bool,
    pub slow: bool,
    pub forwarded: bool,
}

impl Flags {
    pub(crate) fn from_options(options: u8) -> Self {
        Self {
            firewalled_tcp: options & FIREWALL_TCP != 0,
            firewalled_udp: options & FIREWALL_UDP != 0,
            relayed: options & RELAYED != 0,
            slow: options & SLOW != 0,
            forwarded: options & FORWARDED != 0,
        }
    }
}

/// One relay endpoint: the relay's address and both transport ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerSocketAddress {
    pub ip: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
}

impl PeerSocketAddress {
    pub fn size(&self) -> usize {
        1 + ip_bytes(&self.ip) + 4
    }

    pub fn encode(&self, bytes: &mut BytesMut) {
        match self.ip {
            IpAddr::V4(ip) => {
                bytes.put_u8(4);
                bytes.put(ip.octets().as_slice());
            }
            IpAddr::V6(ip) => {
                bytes.put_u8(6);
                bytes.put(ip.octets().as_slice());
            }
        }

        bytes.put_u16(self.tcp_port);
        bytes.put_u16(self.udp_port);
    }

    pub(crate) fn decode(reader: &mut Reader) -> Result<Self, Error> {
        let ip = match reader.get_u8("relay address family")? {
            4 => {
                let raw = reader.take(4, "relay ip")?;
                IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))
            }
            6 => {
                let raw = reader.take(16, "relay ip")?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(raw);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            family => return Err(Error::UnknownAddressFamily(family)),
        };

        Ok(Self {
            ip,
            tcp_port: reader.get_u16("relay tcp port")?,
            udp_port: reader.get_u16("relay udp port")?,
        })
    }
}

/// A peer identity plus everything needed to reach it: transport
/// coordinates, reachability flags and up to [`MAX_RELAYS`] relay endpoints.
///
/// Addresses are immutable; the `with_*` methods return changed copies.
///
/// ```
/// use dht_node_codec::address::PeerAddress;
/// use dht_node_codec::id::Id160;
///
/// let address = PeerAddress::new(
///     Id160::from_words([0, 0, 0, 0, 1]),
///     "10.0.0.1".parse().unwrap(),
///     7700,
///     7701,
/// );
///
/// assert_eq!(address.size(), 20 + 2 + 2 + 1 + 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub id: Id160,
    pub ip: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub flags: Flags,
    pub relays: Vec<PeerSocketAddress>,
}

impl PeerAddress {
    pub fn new(id: Id160, ip: IpAddr, tcp_port: u16, udp_port: u16) -> Self {
        Self {
            id,
            ip,
            tcp_port,
            udp_port,
            flags: Flags::default(),
            relays: Vec::new(),
        }
    }

    /// An address carrying nothing but the identity, the way a recipient
    /// travels in the message header.
    pub fn from_id(id: Id160) -> Self {
        Self::new(id, IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, 0)
    }

    pub fn with_id(&self, id: Id160) -> Self {
        let mut address = self.clone();
        address.id = id;
        address
    }

    pub fn with_flags(&self, flags: Flags) -> Self {
        let mut address = self.clone();
        address.flags = flags;
        address
    }

    pub fn with_relays(&self, relays: Vec<PeerSocketAddress>) -> Self {
        let mut address = self.clone();
        address.relays = relays;
        address.relays.truncate(MAX_RELAYS);
        address
    }

    pub fn with_ip(&self, ip: IpAddr) -> Self {
        let mut address = self.clone();
        address.ip = ip;
        address
    }

    pub fn tcp_socket(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    pub fn udp_socket(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    /// The options byte: address family plus reachability flags.
    pub fn options(&self) -> u8 {
        let mut options = 0;
        if self.ip.is_ipv6() {
            options |= IPV6;
        }
        if self.flags.firewalled_udp {
            options |= FIREWALL_UDP;
        }
        if self.flags.firewalled_tcp {
            options |= FIREWALL_TCP;
        }
        if self.flags.relayed {
            options |= RELAYED;
        }
        if self.flags.slow {
            options |= SLOW;
        }
        if self.flags.forwarded {
            options |= FORWARDED;
        }

        options
    }

    /// Serialized size, deterministic from the flags.
    pub fn size(&self) -> usize {
        let mut size = crate::id::ID_BYTES + 2 + 2 + 1 + ip_bytes(&self.ip);
        if self.flags.relayed {
            size += 1;
            for relay in self.relays.iter().take(MAX_RELAYS) {
                size += relay.size();
            }
        }

        size
    }

    pub fn encode(&self, bytes: &mut BytesMut) {
        self.id.encode(bytes);
        bytes.put_u16(self.tcp_port);
        bytes.put_u16(self.udp_port);
        bytes.put_u8(self.options());

        match self.ip {
            IpAddr::V4(ip) => bytes.put(ip.octets().as_slice()),
            IpAddr::V6(ip) => bytes.put(ip.octets().as_slice()),
        }

        if self.flags.relayed {
            let relays = &self.relays[..self.relays.len().min(MAX_RELAYS)];
            bytes.put_u8(relays.len() as u8);
            for relay in relays {
                relay.encode(bytes);
            }
        }
    }

    pub(crate) fn decode(reader: &mut Reader) -> Result<Self, Error> {
        let id = reader.get_id("peer id")?;
        let tcp_port = reader.get_u16("tcp port")?;
        let udp_port = reader.get_u16("udp port")?;
        let options = reader.get_u8("address options")?;
        let flags = Flags::from_options(options);

        let ip = if options & IPV6 != 0 {
            let raw = reader.take(16, "peer ip")?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(raw);
            IpAddr::V6(Ipv6Addr::from(octets))
        } else {
            let raw = reader.take(4, "peer ip")?;
            IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))
        };

        let mut relays = Vec::new();
        if flags.relayed {
            let count = reader.get_u8("relay count")? as usize;
            if count > MAX_RELAYS {
                return Err(Error::BadLength("relay count"));
            }

            for _ in 0..count {
                relays.push(PeerSocketAddress::decode(reader)?);
            }
        }

        Ok(Self {
            id,
            ip,
            tcp_port,
            udp_port,
            flags,
            relays,
        })
    }
}

fn ip_bytes(ip: &IpAddr) -> usize {
    match ip {
        IpAddr::V4(_) => 4,
        IpAddr::V6(_) => 16,
    }
}
