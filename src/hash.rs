use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};
use std::fmt;

/// A SHA-256 digest.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub fn digest(bytes: &[u8]) -> Self {
        Hash(Sha256::digest(bytes).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Identity address: the digest of an identity public key.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Addr(pub [u8; 32]);

impl Addr {
    pub fn from_pk(pk: &[u8]) -> Self {
        Addr(Sha256::digest(pk).into())
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Addr({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Content digest built field by field.
///
/// Integers go in big-endian, variable length byte strings are length
/// prefixed, so two honest nodes always hash identical content to the
/// same bytes.
pub trait Hashable {
    fn add_hash(&self, hasher: &mut Sha256);

    fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        self.add_hash(&mut hasher);
        Hash(hasher.finalize().into())
    }
}

/// A message carrying signatures over its own payload.
///
/// `payload_hash` leaves the signature fields out and is what gets signed.
pub trait Payload: Hashable {
    fn add_payload_hash(&self, hasher: &mut Sha256);

    fn payload_hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        self.add_payload_hash(&mut hasher);
        Hash(hasher.finalize().into())
    }
}

pub fn add_bytes(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// Deterministic random value, advanced by hashing in new material.
#[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rand(pub [u8; 32]);

impl Rand {
    pub fn new(seed: &[u8]) -> Self {
        Rand(Sha256::digest(seed).into())
    }

    pub fn derive(&self, msg: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        hasher.update(msg);
        Rand(hasher.finalize().into())
    }

    pub fn modulo(&self, n: usize) -> usize {
        let head: [u8; 8] = [
            self.0[0], self.0[1], self.0[2], self.0[3],
            self.0[4], self.0[5], self.0[6], self.0[7],
        ];
        (u64::from_be_bytes(head) % n.max(1) as u64) as usize
    }

    pub fn hash(&self) -> Hash {
        Hash(self.0)
    }
}

impl fmt::Debug for Rand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rand({})", hex::encode(&self.0[..4]))
    }
}
