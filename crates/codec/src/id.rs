use crate::Error;

use bytes::{BufMut, BytesMut};

/// Serialized size of an identifier.
pub const ID_BYTES: usize = 20;

/// 160-bit opaque identifier.
///
/// Used for peer ids, content keys and domain keys alike. Equality, ordering
/// and hashing are bytewise; the wire form is exactly twenty bytes, five
/// 32-bit words in big-endian transmission order.
///
/// ```
/// use dht_node_codec::id::Id160;
///
/// let id = Id160::from_words([1, 2, 3, 4, 5]);
///
/// assert_eq!(id.as_bytes()[3], 1);
/// assert_eq!(id.as_bytes()[19], 5);
/// assert_eq!(format!("{}", id), "0x0000000100000002000000030000000400000005");
/// ```
#[derive(Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id160([u8; ID_BYTES]);

impl Id160 {
    pub const ZERO: Self = Self([0x00; ID_BYTES]);
    pub const MAX: Self = Self([0xff; ID_BYTES]);

    pub const fn new(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn from_words(words: [u32; 5]) -> Self {
        let mut bytes = [0u8; ID_BYTES];
        for (index, word) in words.iter().enumerate() {
            bytes[index * 4..index * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }

        Self(bytes)
    }

    pub fn from_hex(value: &str) -> Result<Self, Error> {
        let value = value.strip_prefix("0x").unwrap_or(value);
        if value.len() != ID_BYTES * 2 {
            return Err(Error::BadLength("id hex"));
        }

        let mut bytes = [0u8; ID_BYTES];
        for (index, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&value[index * 2..index * 2 + 2], 16)
                .map_err(|_| Error::BadLength("id hex"))?;
        }

        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.put(self.0.as_slice());
    }
}

impl From<[u8; ID_BYTES]> for Id160 {
    fn from(value: [u8; ID_BYTES]) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for Id160 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x")?;
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for Id160 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}
