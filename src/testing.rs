//! Fixtures shared by the unit tests.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use sha2::{Sha256, Digest};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::account;
use crate::beacon::{RandBeaconSig, RandBeaconSigShare, RandomBeacon};
use crate::block::{Block, BlockProposal};
use crate::chain::{Chain, Event};
use crate::config::Config;
use crate::group::{Group, Member};
use crate::hash::{Hash, Hashable, Rand};
use crate::notary::Notary;
use crate::state::{self, Receipt, State, SysTxn, TxnPool};
use crate::threshold::{self, SecretShare};

/// Transaction byte `Counters` refuses to apply.
pub const BAD_TXN: u8 = 0xff;

/// Toy application state: one counter per transaction byte.
#[derive(Debug, Clone, Default)]
pub struct Counters {
    counts: BTreeMap<u8, u64>,
}

impl Counters {
    pub fn genesis() -> Arc<dyn State> {
        Arc::new(Counters::default())
    }

    fn digest(&self) -> Hash {
        let mut hasher = Sha256::new();
        for (k, v) in &self.counts {
            hasher.update([*k]);
            hasher.update(v.to_be_bytes());
        }
        Hash(hasher.finalize().into())
    }

    fn apply(&self, txns: &[u8]) -> Result<(Counters, Vec<Receipt>), state::Error> {
        let mut next = self.clone();
        let mut receipts = Vec::with_capacity(txns.len());
        for (i, txn) in txns.iter().enumerate() {
            if *txn == BAD_TXN {
                return Err(state::Error::BadTxn(i));
            }
            *next.counts.entry(*txn).or_default() += 1;
            receipts.push(Receipt { txn: Hash::digest(&[*txn]), success: true });
        }
        Ok((next, receipts))
    }
}

impl State for Counters {
    fn hash(&self) -> Hash {
        self.digest()
    }

    fn commit_txns(
        &self,
        txns: &[u8],
        _pool: &dyn TxnPool,
        _round: u64
    ) -> Result<(Arc<dyn State>, Vec<Receipt>), state::Error> {
        let (next, receipts) = self.apply(txns)?;
        Ok((Arc::new(next), receipts))
    }
}

/// `Counters` whose genesis state stops accepting transactions once
/// `broken` is set. Later states are unaffected.
#[derive(Debug, Clone)]
pub struct Brittle {
    counters: Counters,
    broken: Arc<AtomicBool>,
}

impl Brittle {
    pub fn genesis(broken: Arc<AtomicBool>) -> Arc<dyn State> {
        Arc::new(Brittle { counters: Counters::default(), broken })
    }
}

impl State for Brittle {
    fn hash(&self) -> Hash {
        self.counters.digest()
    }

    fn commit_txns(
        &self,
        txns: &[u8],
        _pool: &dyn TxnPool,
        _round: u64
    ) -> Result<(Arc<dyn State>, Vec<Receipt>), state::Error> {
        if self.counters.counts.is_empty() && self.broken.load(Ordering::SeqCst) {
            return Err(state::Error::BadTxn(0));
        }
        let (counters, receipts) = self.counters.apply(txns)?;
        Ok((Arc::new(Brittle { counters, broken: self.broken.clone() }), receipts))
    }
}

pub struct NoPool;

impl TxnPool for NoPool {
    fn get(&self, _hash: &Hash) -> Option<Vec<u8>> {
        None
    }

    fn remove(&self, _hash: &Hash) {}
}

pub struct Committee {
    pub identities: Vec<Arc<account::Keypair>>,
    pub shares: Vec<SecretShare>,
    pub group: Group,
}

/// Deterministic committee of `size` members with a `threshold` of shares.
pub fn committee(size: usize, threshold: usize, seed: u64) -> Committee {
    let mut rng = StdRng::seed_from_u64(seed);
    let (pk, shares) = threshold::deal(&mut rng, size, threshold).unwrap();
    let identities: Vec<Arc<account::Keypair>> = (0..size)
        .map(|_| {
            let mut s = [0u8; 32];
            rng.fill_bytes(&mut s);
            Arc::new(account::Keypair::from_seed(&s).unwrap())
        })
        .collect();
    let members = identities
        .iter()
        .zip(&shares)
        .map(|(kp, share)| Member { pk: kp.public_bytes(), share_pk: share.public_key() })
        .collect();
    Committee { identities, shares, group: Group { pk, members } }
}

impl Committee {
    pub fn beacon_shares(&self, round: u64, last_rand_val: Hash) -> Vec<RandBeaconSigShare> {
        self.identities
            .iter()
            .zip(&self.shares)
            .map(|(kp, share)| RandBeaconSigShare::new(round, last_rand_val, kp, share))
            .collect()
    }

    pub fn notaries(&self, chain: &Arc<Chain>) -> Vec<Notary> {
        self.identities
            .iter()
            .zip(&self.shares)
            .map(|(kp, share)| Notary::new(kp.clone(), share.clone(), chain.clone()))
            .collect()
    }
}

/// Drives the beacon committee of the current round to a round signature.
pub async fn next_beacon_sig(beacon: &RandomBeacon, committees: &[Committee]) -> RandBeaconSig {
    let round = beacon.round().await;
    let last = beacon.last_rand_val().await;
    let rb = beacon.committees(round).await.unwrap().rb;
    for s in committees[rb].beacon_shares(round, last) {
        if let Some(sig) = beacon.recv_share(&s, rb).await.unwrap() {
            return sig;
        }
    }
    panic!("beacon threshold not reached in round {}", round);
}

pub async fn advance_beacon(beacon: &RandomBeacon, committees: &[Committee]) {
    let sig = next_beacon_sig(beacon, committees).await;
    beacon.recv_sig(&sig).await.unwrap();
}

pub fn genesis(committees: &[&Committee]) -> (Block, Arc<dyn State>) {
    genesis_with(committees, Counters::genesis())
}

pub fn genesis_with(committees: &[&Committee], state: Arc<dyn State>) -> (Block, Arc<dyn State>) {
    let sys_txns = committees.iter().map(|c| SysTxn::RegisterGroup(c.group.clone())).collect();
    (Block::genesis(state.hash(), sys_txns), state)
}

/// Chain over a single committee.
pub fn chain(committee: &Committee, cfg: Config) -> (Arc<Chain>, UnboundedReceiver<Event>) {
    chain_with(committee, cfg, Counters::genesis())
}

pub fn chain_with(
    committee: &Committee,
    cfg: Config,
    state: Arc<dyn State>
) -> (Arc<Chain>, UnboundedReceiver<Event>) {
    let (genesis, state) = genesis_with(&[committee], state);
    let (chain, events) = Chain::new(genesis, state, Rand::new(b"seed"), cfg, Arc::new(NoPool)).unwrap();
    (Arc::new(chain), events)
}

pub fn proposal(owner: &account::Keypair, round: u64, prev_block: Hash, txns: Vec<u8>) -> BlockProposal {
    BlockProposal { owner: owner.addr(), round, prev_block, txns, sys_txns: Vec::new() }
}

/// Feeds notarization shares from `committee` into the chain until the
/// proposal is notarized.
pub async fn notarize(chain: &Arc<Chain>, committee: &Committee, bp: &BlockProposal) -> Block {
    let nt = chain.beacon().committees(bp.round).await.unwrap().nt;
    for notary in committee.notaries(chain) {
        let (share, _) = notary.notarize_proposal(bp).await.unwrap();
        if let Some(block) = chain.add_nt_share(share, nt).await.unwrap() {
            return block;
        }
    }
    panic!("notarization threshold not reached for {}", bp.hash());
}

/// Proposes on `prev`, notarizes and adds the block, returning its hash.
/// The beacon is advanced first if it has not reached the block's round.
pub async fn extend(chain: &Arc<Chain>, committee: &Committee, owner: usize, prev: Hash, txns: Vec<u8>) -> Hash {
    let round = chain.block(&prev).await.unwrap().round + 1;
    while chain.beacon().round().await < round {
        advance_beacon(chain.beacon(), std::slice::from_ref(committee)).await;
    }
    let bp = proposal(&committee.identities[owner], round, prev, txns);
    chain.add_block_proposal(bp.clone(), 1.0).await.unwrap();
    let block = notarize(chain, committee, &bp).await;
    let h = block.hash();
    chain.add_block(block, 1.0).await.unwrap();
    h
}
