use crate::{Error, Reader, crypto::PublicKey};

use bytes::{BufMut, Bytes, BytesMut};

const PROTECTED_BIT: u32 = 1 << 31;

// On the wire a public key length of 0xFFFF means "reuse the message-level
// public key"; the flag below is the in-memory form of that sentinel.
const INHERIT_SENTINEL: u16 = u16::MAX;

/// A stored payload atom: value bytes plus a time-to-live, an entry
/// protection bit and optional signing material.
///
/// The fixed 11-byte prefix is `ttl(4) || value_len(4) || pubkey_len(2) ||
/// sig_len(1)`; the protection bit rides in the high bit of the ttl word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    ttl_seconds: u32,
    protected: bool,
    value: Bytes,
    inherit_key: bool,
    public_key: Option<PublicKey>,
    signature: Option<Bytes>,
}

impl Data {
    pub fn new(value: Bytes) -> Self {
        Self {
            ttl_seconds: 0,
            protected: false,
            value,
            inherit_key: false,
            public_key: None,
            signature: None,
        }
    }

    /// The ttl must leave the protection bit free.
    pub fn with_ttl(mut self, ttl_seconds: u32) -> Result<Self, Error> {
        if ttl_seconds & PROTECTED_BIT != 0 {
            return Err(Error::OversizedTtl(ttl_seconds));
        }

        self.ttl_seconds = ttl_seconds;
        Ok(self)
    }

    pub fn with_protection(mut self) -> Self {
        self.protected = true;
        self
    }

    pub fn with_public_key(mut self, key: PublicKey) -> Self {
        self.public_key = Some(key);
        self
    }

    /// Mark the atom as signed by the key of the enclosing message rather
    /// than carrying its own copy.
    pub fn with_inherited_key(mut self) -> Self {
        self.inherit_key = true;
        self
    }

    pub fn with_signature(mut self, signature: Bytes) -> Result<Self, Error> {
        if signature.len() > u8::MAX as usize {
            return Err(Error::Oversized("data signature"));
        }

        self.signature = Some(signature);
        Ok(self)
    }

    pub fn ttl_seconds(&self) -> u32 {
        self.ttl_seconds
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn public_key(&self) -> Option<&PublicKey> {
        self.public_key.as_ref()
    }

    pub fn inherits_key(&self) -> bool {
        self.inherit_key
    }

    pub fn signature(&self) -> Option<&Bytes> {
        self.signature.as_ref()
    }

    /// Resolve the inherit sentinel once the message-level key is known.
    pub(crate) fn patch_public_key(&mut self, key: &PublicKey) {
        if self.inherit_key && self.public_key.is_none() {
            self.public_key = Some(key.clone());
        }
    }

    pub fn size(&self) -> Result<usize, Error> {
        let key_len = if self.inherit_key {
            0
        } else {
            match &self.public_key {
                Some(key) if key.as_der().len() >= INHERIT_SENTINEL as usize => {
                    return Err(Error::Oversized("data public key"));
                }
                Some(key) => key.as_der().len(),
                None => 0,
            }
        };

        let sig_len = self.signature.as_ref().map(|it| it.len()).unwrap_or(0);
        Ok(11 + self.value.len() + key_len + sig_len)
    }

    pub fn encode(&self, bytes: &mut BytesMut) -> Result<(), Error> {
        let mut ttl = self.ttl_seconds;
        if self.protected {
            ttl |= PROTECTED_BIT;
        }

        bytes.put_u32(ttl);
        bytes.put_u32(self.value.len() as u32);

        let key = if self.inherit_key {
            bytes.put_u16(INHERIT_SENTINEL);
            None
        } else {
            match &self.public_key {
                Some(key) if key.as_der().len() >= INHERIT_SENTINEL as usize => {
                    return Err(Error::Oversized("data public key"));
                }
                Some(key) => {
                    bytes.put_u16(key.as_der().len() as u16);
                    Some(key)
                }
                None => {
                    bytes.put_u16(0);
                    None
                }
            }
        };

        let signature = self.signature.as_ref();
        bytes.put_u8(signature.map(|it| it.len()).unwrap_or(0) as u8);
        bytes.put(self.value.as_ref());

        if let Some(key) = key {
            bytes.put(key.as_der());
        }

        if let Some(signature) = signature {
            bytes.put(signature.as_ref());
        }

        Ok(())
    }

    pub(crate) fn decode(reader: &mut Reader) -> Result<Self, Error> {
        let ttl = reader.get_u32("data ttl")?;
        let value_len = reader.get_u32("data value length")? as usize;
        let key_len = reader.get_u16("data public key length")?;
        let sig_len = reader.get_u8("data signature length")? as usize;

        let value = Bytes::copy_from_slice(reader.take(value_len, "data value")?);

        let (inherit_key, public_key) = match key_len {
            INHERIT_SENTINEL => (true, None),
            0 => (false, None),
            len => {
                let der = reader.take(len as usize, "data public key")?;
                (false, Some(PublicKey::from_der(der)?))
            }
        };

        let signature = if sig_len > 0 {
            Some(Bytes::copy_from_slice(
                reader.take(sig_len, "data signature")?,
            ))
        } else {
            None
        };

        Ok(Self {
            ttl_seconds: ttl & !PROTECTED_BIT,
            protected: ttl & PROTECTED_BIT != 0,
            value,
            inherit_key,
            public_key,
            signature,
        })
    }
}
