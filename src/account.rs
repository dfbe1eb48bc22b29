use ed25519_dalek::{self, Verifier, Signer};
use rand::rngs::OsRng;

use crate::hash::{Addr, Hash};

pub type PublicKey = ed25519_dalek::PublicKey;
pub type SecretKey = ed25519_dalek::SecretKey;
pub type Signature = ed25519_dalek::Signature;

/// Individual identity of a node. Signs the messages it sends so peers
/// can tell who contributed a share.
#[derive(Debug)]
pub struct Keypair {
    pub kp: ed25519_dalek::Keypair
}

impl Keypair {
    pub fn gen() -> Self {
        let mut csprng = OsRng {};
        Self { kp: ed25519_dalek::Keypair::generate(&mut csprng) }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Result<Self, ed25519_dalek::SignatureError> {
        let secret = SecretKey::from_bytes(seed)?;
        let public = PublicKey::from(&secret);
        Ok(Self { kp: ed25519_dalek::Keypair { secret, public } })
    }

    pub fn public_bytes(&self) -> Vec<u8> {
        self.kp.public.to_bytes().to_vec()
    }

    pub fn addr(&self) -> Addr {
        Addr::from_pk(self.kp.public.as_bytes())
    }

    pub fn sign(&self, msg: &Hash) -> Vec<u8> {
        self.kp.sign(msg.as_bytes()).to_bytes().to_vec()
    }
}

/// Checks an identity signature given the raw key and signature bytes.
/// Malformed input simply fails verification.
pub fn verify(pk: &[u8], msg: &Hash, sig: &[u8]) -> bool {
    let pk = match PublicKey::from_bytes(pk) {
        Ok(pk) => pk,
        Err(_) => return false
    };
    let sig = match Signature::try_from(sig) {
        Ok(sig) => sig,
        Err(_) => return false
    };
    pk.verify(msg.as_bytes(), &sig).is_ok()
}
