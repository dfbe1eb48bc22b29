use sha2::{Sha256, Digest};
use serde::{Serialize, Deserialize};

use crate::hash::{self, Addr, Hashable, Rand};
use crate::threshold;

/// A committee member: its identity key and the public key of its share
/// of the group secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub pk: Vec<u8>,
    pub share_pk: threshold::PublicKey
}

impl Member {
    pub fn addr(&self) -> Addr {
        Addr::from_pk(&self.pk)
    }
}

/// A committee: group public key plus ordered member set. The member at
/// position `i` signs with share id `i + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub pk: threshold::PublicKey,
    pub members: Vec<Member>
}

impl Group {
    /// Share id and record of the member with the given address.
    pub fn member(&self, addr: &Addr) -> Option<(u64, &Member)> {
        self.members
            .iter()
            .position(|m| &m.addr() == addr)
            .map(|i| (i as u64 + 1, &self.members[i]))
    }

    /// Members ordered by how eligible they are to propose, given the
    /// proposer random value of a round.
    pub fn ranking(&self, rand: &Rand) -> Vec<Addr> {
        let mut keyed: Vec<([u8; 32], Addr)> = self.members
            .iter()
            .map(|m| {
                let addr = m.addr();
                let mut hasher = Sha256::new();
                hasher.update(rand.0);
                hasher.update(addr.0);
                let key: [u8; 32] = hasher.finalize().into();
                (key, addr)
            })
            .collect();
        keyed.sort();
        keyed.into_iter().map(|(_, addr)| addr).collect()
    }

    pub fn rank(&self, rand: &Rand, addr: &Addr) -> Option<u16> {
        self.ranking(rand)
            .iter()
            .position(|a| a == addr)
            .map(|i| i as u16)
    }
}

impl Hashable for Group {
    fn add_hash(&self, hasher: &mut Sha256) {
        hash::add_bytes(hasher, &self.pk.0);
        hasher.update((self.members.len() as u64).to_be_bytes());
        for m in &self.members {
            hash::add_bytes(hasher, &m.pk);
            hash::add_bytes(hasher, &m.share_pk.0);
        }
    }
}
