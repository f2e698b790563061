use crate::{Error, id::Id160};

use dsa::{Components, KeySize, Signature, SigningKey, VerifyingKey};
use num_bigint::BigUint;
use pkcs8::{DecodePublicKey, EncodePublicKey};
use sha1::{Digest, Sha1};
use signature::{DigestSigner, DigestVerifier, rand_core::CryptoRngCore};

/// Size of one raw signature component.
pub const SIGNATURE_COMPONENT_BYTES: usize = 20;

/// Size of a complete raw signature, two 160-bit components.
pub const SIGNATURE_BYTES: usize = SIGNATURE_COMPONENT_BYTES * 2;

/// The two 160-bit components of a DSA signature as they travel on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageSignature {
    pub r: [u8; SIGNATURE_COMPONENT_BYTES],
    pub s: [u8; SIGNATURE_COMPONENT_BYTES],
}

/// A DSA verification key together with its X.509 SubjectPublicKeyInfo
/// encoding.
///
/// The DER bytes are kept alongside the parsed key so encoding is a plain
/// copy and equality is bytewise over what actually travels on the wire.
#[derive(Clone)]
pub struct PublicKey {
    der: Vec<u8>,
    key: VerifyingKey,
}

impl PublicKey {
    pub fn from_der(der: &[u8]) -> Result<Self, Error> {
        Ok(Self {
            key: VerifyingKey::from_public_key_der(der).map_err(|_| Error::InvalidPublicKey)?,
            der: der.to_vec(),
        })
    }

    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    /// Verify a raw two-component signature over the concatenation of the
    /// given buffers.
    pub fn verify(&self, source: &[&[u8]], signature: &MessageSignature) -> bool {
        let r = BigUint::from_bytes_be(&signature.r);
        let s = BigUint::from_bytes_be(&signature.s);
        let Ok(signature) = Signature::from_components(r, s) else {
            return false;
        };

        let mut digest = Sha1::new();
        for buf in source {
            digest.update(buf);
        }

        self.key.verify_digest(digest, &signature).is_ok()
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for PublicKey {}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({} bytes)", self.der.len())
    }
}

/// A DSA signing key.
///
/// Signing is deterministic (RFC 6979), so encoding the same message with
/// the same key always yields the same bytes.
#[derive(Clone)]
pub struct PrivateKey(SigningKey);

impl PrivateKey {
    /// Sign the concatenation of the given buffers with DSA-SHA1.
    pub fn sign(&self, source: &[&[u8]]) -> Result<MessageSignature, Error> {
        let mut digest = Sha1::new();
        for buf in source {
            digest.update(buf);
        }

        let signature: Signature = self
            .0
            .try_sign_digest(digest)
            .map_err(|_| Error::SigningFailed)?;

        Ok(MessageSignature {
            r: pad_component(signature.r())?,
            s: pad_component(signature.s())?,
        })
    }

    pub fn public_key(&self) -> Result<PublicKey, Error> {
        let key = self.0.verifying_key().clone();
        let der = key
            .to_public_key_der()
            .map_err(|_| Error::InvalidPublicKey)?
            .into_vec();

        Ok(PublicKey { der, key })
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey")
    }
}

/// Generate a fresh DSA-1024/160 key pair.
pub fn generate_keypair(csprng: &mut impl CryptoRngCore) -> PrivateKey {
    let components = Components::generate(csprng, KeySize::DSA_1024_160);
    PrivateKey(SigningKey::generate(csprng, components))
}

/// Derive a peer identifier from a public key, the SHA-1 of its DER
/// encoding.
pub fn public_key_id(key: &PublicKey) -> Id160 {
    let digest = Sha1::digest(key.as_der());
    let mut bytes = [0u8; crate::id::ID_BYTES];
    bytes.copy_from_slice(&digest);
    Id160::new(bytes)
}

// A component below 2^152 serializes to fewer than twenty bytes and must be
// left-padded back to the fixed wire width.
fn pad_component(value: &BigUint) -> Result<[u8; SIGNATURE_COMPONENT_BYTES], Error> {
    let raw = value.to_bytes_be();
    if raw.len() > SIGNATURE_COMPONENT_BYTES {
        return Err(Error::SigningFailed);
    }

    let mut bytes = [0u8; SIGNATURE_COMPONENT_BYTES];
    bytes[SIGNATURE_COMPONENT_BYTES - raw.len()..].copy_from_slice(&raw);
    Ok(bytes)
}
