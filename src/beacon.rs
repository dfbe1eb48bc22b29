//! Random beacon.
//!
//! The beacon, block proposal and notarization advance to the next round
//! in lockstep. Every round the beacon committee threshold-signs the
//! previous random value; the hash of that signature is folded into three
//! independent random streams which pick the beacon, proposer and
//! notarization committees of the next round. Replaying the same
//! signatures from the same seed reproduces the same committees.

use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::account;
use crate::fault::Fault;
use crate::group::Group;
use crate::hash::{self, Addr, Hash, Hashable, Payload, Rand};
use crate::threshold;

const RB_SEED: &[u8] = b"random beacon committee rand seed";
const BP_SEED: &[u8] = b"block proposer committee rand seed";
const NT_SEED: &[u8] = b"notarization committee rand seed";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("unexpected round {got}, expected {expected}")]
    UnexpectedRound { got: u64, expected: u64 },
    #[error("share or signature does not extend the current random value")]
    UnexpectedRandVal,
    #[error("unknown group {0}")]
    UnknownGroup(usize),
    #[error("share for group {got}, beacon committee is {expected}")]
    WrongGroup { got: usize, expected: usize },
    #[error("threshold {threshold} unusable for group {group} of {size} members")]
    Threshold { threshold: usize, group: usize, size: usize },
    #[error("no groups")]
    NoGroups,
    #[error("{0} is not a member of the group")]
    NotInGroup(Addr),
    #[error("share from {0} already received")]
    DuplicateShare(Addr),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("committee for round {0} not selected yet")]
    CommitteeNotSelected(u64),
    #[error("{addr} not in proposer committee of round {round}")]
    AddrNotInCommittee { addr: Addr, round: u64 },
    #[error(transparent)]
    Fault(#[from] Fault),
}

impl Error {
    pub fn is_fault(&self) -> bool {
        matches!(self, Error::Fault(_))
    }
}

/// The aggregated beacon signature of a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandBeaconSig {
    pub round: u64,
    pub last_rand_val: Hash,
    pub sig: Vec<u8>,
}

impl Payload for RandBeaconSig {
    fn add_payload_hash(&self, hasher: &mut Sha256) {
        hasher.update(self.round.to_be_bytes());
        hasher.update(self.last_rand_val.0);
    }
}

impl Hashable for RandBeaconSig {
    fn add_hash(&self, hasher: &mut Sha256) {
        self.add_payload_hash(hasher);
        hash::add_bytes(hasher, &self.sig);
    }
}

/// One beacon committee member's contribution to a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandBeaconSigShare {
    pub owner: Addr,
    pub round: u64,
    pub last_rand_val: Hash,
    pub sig_share: Vec<u8>,
    pub sig: Vec<u8>,
}

impl RandBeaconSigShare {
    pub fn new(
        round: u64,
        last_rand_val: Hash,
        identity: &account::Keypair,
        share: &threshold::SecretShare
    ) -> Self {
        let msg = unsigned(round, last_rand_val).payload_hash();
        let mut s = Self {
            owner: identity.addr(),
            round,
            last_rand_val,
            sig_share: share.sign(&msg),
            sig: Vec::new(),
        };
        s.sig = identity.sign(&s.payload_hash());
        s
    }
}

impl Payload for RandBeaconSigShare {
    fn add_payload_hash(&self, hasher: &mut Sha256) {
        hasher.update(self.owner.0);
        hasher.update(self.round.to_be_bytes());
        hasher.update(self.last_rand_val.0);
        hash::add_bytes(hasher, &self.sig_share);
    }
}

impl Hashable for RandBeaconSigShare {
    fn add_hash(&self, hasher: &mut Sha256) {
        self.add_payload_hash(hasher);
        hash::add_bytes(hasher, &self.sig);
    }
}

fn unsigned(round: u64, last_rand_val: Hash) -> RandBeaconSig {
    RandBeaconSig { round, last_rand_val, sig: Vec::new() }
}

/// Group indices selected for one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Committees {
    pub rb: usize,
    pub bp: usize,
    pub nt: usize,
}

#[derive(Debug)]
struct Inner {
    rb_rand: Rand,
    bp_rand: Rand,
    nt_rand: Rand,
    next_rb_cmte_history: Vec<usize>,
    next_bp_cmte_history: Vec<usize>,
    next_nt_cmte_history: Vec<usize>,
    bp_rand_history: Vec<Rand>,
    last_rand_val: Hash,
    cur_round_shares: Vec<RandBeaconSigShare>,
}

impl Inner {
    fn round(&self) -> u64 {
        self.next_rb_cmte_history.len() as u64
    }

    fn committees(&self, round: u64) -> Result<Committees, Error> {
        if round == 0 || round > self.round() {
            return Err(Error::CommitteeNotSelected(round));
        }
        let i = (round - 1) as usize;
        Ok(Committees {
            rb: self.next_rb_cmte_history[i],
            bp: self.next_bp_cmte_history[i],
            nt: self.next_nt_cmte_history[i],
        })
    }

    fn derive_rand(&mut self, h: &Hash, groups: usize) {
        self.rb_rand = self.rb_rand.derive(&h.0);
        self.next_rb_cmte_history.push(self.rb_rand.modulo(groups));
        self.nt_rand = self.nt_rand.derive(&h.0);
        self.next_nt_cmte_history.push(self.nt_rand.modulo(groups));
        self.bp_rand = self.bp_rand.derive(&h.0);
        self.next_bp_cmte_history.push(self.bp_rand.modulo(groups));
        self.bp_rand_history.push(self.bp_rand);
    }
}

#[derive(Debug)]
pub struct RandomBeacon {
    groups: Vec<Group>,
    threshold: usize,
    inner: Mutex<Inner>,
}

impl RandomBeacon {
    /// Every group must be able to reach `threshold` shares.
    pub fn new(seed: Rand, groups: Vec<Group>, threshold: usize) -> Result<Self, Error> {
        if groups.is_empty() {
            return Err(Error::NoGroups);
        }
        for (i, g) in groups.iter().enumerate() {
            if threshold == 0 || threshold > g.members.len() {
                return Err(Error::Threshold { threshold, group: i, size: g.members.len() });
            }
        }
        let rb_rand = seed.derive(RB_SEED);
        let bp_rand = seed.derive(BP_SEED);
        let nt_rand = seed.derive(NT_SEED);
        let n = groups.len();
        Ok(Self {
            groups,
            threshold,
            inner: Mutex::new(Inner {
                rb_rand,
                bp_rand,
                nt_rand,
                next_rb_cmte_history: vec![rb_rand.modulo(n)],
                next_bp_cmte_history: vec![bp_rand.modulo(n)],
                next_nt_cmte_history: vec![nt_rand.modulo(n)],
                bp_rand_history: vec![bp_rand],
                last_rand_val: seed.hash(),
                cur_round_shares: Vec::new(),
            }),
        })
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn group(&self, id: usize) -> Option<&Group> {
        self.groups.get(id)
    }

    /// The round whose beacon signature is expected next.
    pub async fn round(&self) -> u64 {
        self.inner.lock().await.round()
    }

    /// The value the next round's shares must sign.
    pub async fn last_rand_val(&self) -> Hash {
        self.inner.lock().await.last_rand_val
    }

    pub async fn committees(&self, round: u64) -> Result<Committees, Error> {
        self.inner.lock().await.committees(round)
    }

    pub async fn committee_history(&self) -> Vec<Committees> {
        let inner = self.inner.lock().await;
        (1..=inner.round())
            .filter_map(|r| inner.committees(r).ok())
            .collect()
    }

    /// Proposal priority of `owner` in `round`, lower is better.
    pub async fn rank(&self, owner: &Addr, round: u64) -> Result<u16, Error> {
        let inner = self.inner.lock().await;
        let cmte = inner.committees(round)?;
        let group = self.groups.get(cmte.bp).ok_or(Error::UnknownGroup(cmte.bp))?;
        let rand = &inner.bp_rand_history[(round - 1) as usize];
        group.rank(rand, owner)
            .ok_or(Error::AddrNotInCommittee { addr: *owner, round })
    }

    /// Accumulates one beacon share. Once the threshold is reached the
    /// recovered round signature is returned; feed it to `recv_sig` to
    /// advance.
    pub async fn recv_share(
        &self,
        s: &RandBeaconSigShare,
        group_id: usize
    ) -> Result<Option<RandBeaconSig>, Error> {
        let mut inner = self.inner.lock().await;
        let expected = inner.round();
        if s.round != expected {
            return Err(Error::UnexpectedRound { got: s.round, expected });
        }
        if s.last_rand_val != inner.last_rand_val {
            return Err(Error::UnexpectedRandVal);
        }
        let group = self.groups.get(group_id).ok_or(Error::UnknownGroup(group_id))?;
        let rb = inner.committees(s.round)?.rb;
        if group_id != rb {
            return Err(Error::WrongGroup { got: group_id, expected: rb });
        }
        let (_, member) = group.member(&s.owner).ok_or(Error::NotInGroup(s.owner))?;
        if inner.cur_round_shares.iter().any(|x| x.owner == s.owner) {
            return Err(Error::DuplicateShare(s.owner));
        }
        if !account::verify(&member.pk, &s.payload_hash(), &s.sig) {
            return Err(Error::InvalidSignature);
        }
        let mut rbs = unsigned(s.round, s.last_rand_val);
        let msg = rbs.payload_hash();
        if !member.share_pk.verify(&msg, &s.sig_share) {
            return Err(Error::InvalidSignature);
        }

        inner.cur_round_shares.push(s.clone());
        debug!(round = s.round, owner = %s.owner, shares = inner.cur_round_shares.len(), "beacon share accepted");
        if inner.cur_round_shares.len() < self.threshold {
            return Ok(None);
        }

        let mut parts = Vec::with_capacity(self.threshold);
        for share in inner.cur_round_shares.iter().take(self.threshold) {
            let (id, _) = group.member(&share.owner).ok_or(Error::NotInGroup(share.owner))?;
            parts.push((id, share.sig_share.as_slice()));
        }
        let sig = threshold::recover(&parts).map_err(Fault::Recover)?;
        if !group.pk.verify(&msg, &sig) {
            return Err(Fault::BeaconSig { round: s.round }.into());
        }
        rbs.sig = sig;
        Ok(Some(rbs))
    }

    /// Adds the round signature, selecting the committees of the next
    /// round.
    pub async fn recv_sig(&self, s: &RandBeaconSig) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        let expected = inner.round();
        if s.round != expected {
            return Err(Error::UnexpectedRound { got: s.round, expected });
        }
        if s.last_rand_val != inner.last_rand_val {
            return Err(Error::UnexpectedRandVal);
        }
        let cmte = inner.committees(s.round)?;
        let group = self.groups.get(cmte.rb).ok_or(Error::UnknownGroup(cmte.rb))?;
        if !group.pk.verify(&s.payload_hash(), &s.sig) {
            return Err(Error::InvalidSignature);
        }

        let h = Hash::digest(&s.sig);
        inner.derive_rand(&h, self.groups.len());
        inner.last_rand_val = h;
        inner.cur_round_shares.clear();
        info!(round = inner.round(), rand = %h, "random beacon advanced");
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::testing;

    fn setup() -> (testing::Committee, RandomBeacon) {
        let committee = testing::committee(4, 3, 11);
        let beacon = RandomBeacon::new(Rand::new(b"seed"), vec![committee.group.clone()], 3).unwrap();
        (committee, beacon)
    }

    #[tokio::test]
    async fn threshold() {
        let (committee, beacon) = setup();
        assert_eq!(beacon.round().await, 1);
        let last = beacon.last_rand_val().await;
        let shares = committee.beacon_shares(1, last);
        assert_eq!(beacon.recv_share(&shares[0], 0).await, Ok(None));
        assert_eq!(beacon.recv_share(&shares[1], 0).await, Ok(None));
        let sig = beacon.recv_share(&shares[2], 0).await.unwrap().unwrap();
        assert_eq!(sig.round, 1);
        assert!(committee.group.pk.verify(&sig.payload_hash(), &sig.sig));
        assert_eq!(beacon.round().await, 1);
        beacon.recv_sig(&sig).await.unwrap();
        assert_eq!(beacon.round().await, 2);
        assert_eq!(beacon.last_rand_val().await, Hash::digest(&sig.sig));
    }

    #[tokio::test]
    async fn any_members_agree() {
        let (committee, beacon) = setup();
        let last = beacon.last_rand_val().await;
        let shares = committee.beacon_shares(1, last);
        let other = RandomBeacon::new(Rand::new(b"seed"), vec![committee.group.clone()], 3).unwrap();
        let mut a = None;
        for s in &shares[..3] {
            a = beacon.recv_share(s, 0).await.unwrap();
        }
        let mut b = None;
        for s in shares[1..].iter().rev() {
            b = other.recv_share(s, 0).await.unwrap();
        }
        assert_eq!(a.unwrap().sig, b.unwrap().sig);
    }

    #[tokio::test]
    async fn rejects() {
        let (committee, beacon) = setup();
        let last = beacon.last_rand_val().await;
        let shares = committee.beacon_shares(1, last);
        let early = committee.beacon_shares(2, last);
        assert_eq!(
            beacon.recv_share(&early[0], 0).await,
            Err(Error::UnexpectedRound { got: 2, expected: 1 })
        );
        let stale = committee.beacon_shares(1, Hash::digest(b"stale"));
        assert_eq!(beacon.recv_share(&stale[0], 0).await, Err(Error::UnexpectedRandVal));
        assert_eq!(beacon.recv_share(&shares[0], 3).await, Err(Error::UnknownGroup(3)));
        assert_eq!(beacon.recv_share(&shares[0], 0).await, Ok(None));
        assert_eq!(
            beacon.recv_share(&shares[0], 0).await,
            Err(Error::DuplicateShare(shares[0].owner))
        );
        let mut forged = shares[1].clone();
        forged.sig_share = shares[2].sig_share.clone();
        forged.sig = committee.identities[1].sign(&forged.payload_hash());
        assert_eq!(beacon.recv_share(&forged, 0).await, Err(Error::InvalidSignature));
        let mut unsigned = shares[1].clone();
        unsigned.sig = Vec::new();
        assert_eq!(beacon.recv_share(&unsigned, 0).await, Err(Error::InvalidSignature));
        let outsider = testing::committee(4, 3, 12).beacon_shares(1, last);
        assert_eq!(
            beacon.recv_share(&outsider[0], 0).await,
            Err(Error::NotInGroup(outsider[0].owner))
        );
    }

    #[tokio::test]
    async fn bad_sig() {
        let (committee, beacon) = setup();
        let last = beacon.last_rand_val().await;
        let shares = committee.beacon_shares(1, last);
        let forged = RandBeaconSig { round: 1, last_rand_val: last, sig: shares[0].sig_share.clone() };
        assert_eq!(beacon.recv_sig(&forged).await, Err(Error::InvalidSignature));
        let wrong_round = RandBeaconSig { round: 2, ..forged };
        assert_eq!(
            beacon.recv_sig(&wrong_round).await,
            Err(Error::UnexpectedRound { got: 2, expected: 1 })
        );
        assert_eq!(beacon.round().await, 1);
    }

    #[tokio::test]
    async fn deterministic() {
        let committees = [testing::committee(4, 3, 21), testing::committee(4, 3, 22), testing::committee(4, 3, 23)];
        let groups: Vec<Group> = committees.iter().map(|c| c.group.clone()).collect();
        let a = RandomBeacon::new(Rand::new(b"genesis"), groups.clone(), 3).unwrap();
        let b = RandomBeacon::new(Rand::new(b"genesis"), groups, 3).unwrap();
        for _ in 0..6 {
            let sig = testing::next_beacon_sig(&a, &committees).await;
            a.recv_sig(&sig).await.unwrap();
            b.recv_sig(&sig).await.unwrap();
        }
        assert_eq!(a.round().await, 7);
        assert_eq!(a.committee_history().await, b.committee_history().await);
        assert_eq!(a.committee_history().await.len(), 7);
        for round in 1..=7 {
            for c in &committees {
                for kp in &c.identities {
                    assert_eq!(a.rank(&kp.addr(), round).await.ok(), b.rank(&kp.addr(), round).await.ok());
                }
            }
        }
    }

    #[tokio::test]
    async fn rank() {
        let (committee, beacon) = setup();
        let mut ranks = Vec::new();
        for kp in &committee.identities {
            ranks.push(beacon.rank(&kp.addr(), 1).await.unwrap());
        }
        ranks.sort();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
        assert_eq!(
            beacon.rank(&committee.identities[0].addr(), 2).await,
            Err(Error::CommitteeNotSelected(2))
        );
        assert_eq!(
            beacon.rank(&committee.identities[0].addr(), 0).await,
            Err(Error::CommitteeNotSelected(0))
        );
        assert_eq!(
            beacon.rank(&Addr::default(), 1).await,
            Err(Error::AddrNotInCommittee { addr: Addr::default(), round: 1 })
        );
    }

    #[tokio::test]
    async fn wrong_group() {
        let committees = [testing::committee(4, 3, 31), testing::committee(4, 3, 32)];
        let groups: Vec<Group> = committees.iter().map(|c| c.group.clone()).collect();
        let beacon = RandomBeacon::new(Rand::new(b"genesis"), groups, 3).unwrap();
        let last = beacon.last_rand_val().await;
        let rb = beacon.committees(1).await.unwrap().rb;
        let other = 1 - rb;
        let outsider = committees[other].beacon_shares(1, last);
        assert_eq!(
            beacon.recv_share(&outsider[0], other).await,
            Err(Error::WrongGroup { got: other, expected: rb })
        );
        let shares = committees[rb].beacon_shares(1, last);
        assert_eq!(beacon.recv_share(&shares[0], rb).await, Ok(None));
        assert_eq!(beacon.recv_share(&shares[1], rb).await, Ok(None));
        let sig = beacon.recv_share(&shares[2], rb).await.unwrap().unwrap();
        beacon.recv_sig(&sig).await.unwrap();
        assert_eq!(beacon.round().await, 2);
    }

    #[test]
    fn bad_threshold() {
        let committee = testing::committee(4, 3, 11);
        let groups = vec![committee.group.clone()];
        assert_eq!(
            RandomBeacon::new(Rand::new(b"seed"), groups.clone(), 0).err(),
            Some(Error::Threshold { threshold: 0, group: 0, size: 4 })
        );
        assert_eq!(
            RandomBeacon::new(Rand::new(b"seed"), groups.clone(), 5).err(),
            Some(Error::Threshold { threshold: 5, group: 0, size: 4 })
        );
        assert_eq!(RandomBeacon::new(Rand::new(b"seed"), Vec::new(), 3).err(), Some(Error::NoGroups));
        assert!(RandomBeacon::new(Rand::new(b"seed"), groups, 4).is_ok());
    }
}
