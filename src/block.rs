use serde::Deserialize;
use serde::Serialize;
use sha2::Sha256;
use digest::Digest;

use crate::hash::{self, Addr, Hash, Hashable, Payload};
use crate::state::SysTxn;

/// Proposal to extend `prev_block` with a transaction batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockProposal {
    pub owner: Addr,
    pub round: u64,
    pub prev_block: Hash,
    pub txns: Vec<u8>,
    pub sys_txns: Vec<SysTxn>,
}

impl Hashable for BlockProposal {
    fn add_hash(&self, hasher: &mut Sha256) {
        hasher.update(self.owner.0);
        hasher.update(self.round.to_be_bytes());
        hasher.update(self.prev_block.0);
        hash::add_bytes(hasher, &self.txns);
        hasher.update((self.sys_txns.len() as u64).to_be_bytes());
        for txn in &self.sys_txns {
            txn.add_hash(hasher);
        }
    }
}

/// A notarized extension of the chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub owner: Addr,
    pub round: u64,
    pub state_root: Hash,
    pub block_proposal: Hash,
    pub prev_block: Hash,
    pub sys_txns: Vec<SysTxn>,
    pub notarization_sig: Vec<u8>,
}

impl Block {
    /// The unsigned block a proposal turns into once its batch is applied.
    /// Notarization shares sign its `payload_hash`.
    pub fn from_proposal(bp: &BlockProposal, bp_hash: Hash, state_root: Hash) -> Self {
        Self {
            owner: bp.owner,
            round: bp.round,
            state_root,
            block_proposal: bp_hash,
            prev_block: bp.prev_block,
            sys_txns: bp.sys_txns.clone(),
            notarization_sig: Vec::new(),
        }
    }

    pub fn genesis(state_root: Hash, sys_txns: Vec<SysTxn>) -> Self {
        Self {
            owner: Addr::default(),
            round: 0,
            state_root,
            block_proposal: Hash::default(),
            prev_block: Hash::default(),
            sys_txns,
            notarization_sig: Vec::new(),
        }
    }
}

impl Payload for Block {
    fn add_payload_hash(&self, hasher: &mut Sha256) {
        hasher.update(self.owner.0);
        hasher.update(self.round.to_be_bytes());
        hasher.update(self.state_root.0);
        hasher.update(self.block_proposal.0);
        hasher.update(self.prev_block.0);
        hasher.update((self.sys_txns.len() as u64).to_be_bytes());
        for txn in &self.sys_txns {
            txn.add_hash(hasher);
        }
    }
}

impl Hashable for Block {
    fn add_hash(&self, hasher: &mut Sha256) {
        self.add_payload_hash(hasher);
        hash::add_bytes(hasher, &self.notarization_sig);
    }
}

/// One committee member's partial notarization of a proposal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NtShare {
    pub round: u64,
    pub bp: Hash,
    pub state_root: Hash,
    pub owner: Addr,
    pub sig_share: Vec<u8>,
    pub sig: Vec<u8>,
}

impl Payload for NtShare {
    fn add_payload_hash(&self, hasher: &mut Sha256) {
        hasher.update(self.round.to_be_bytes());
        hasher.update(self.bp.0);
        hasher.update(self.state_root.0);
        hasher.update(self.owner.0);
        hash::add_bytes(hasher, &self.sig_share);
    }
}

impl Hashable for NtShare {
    fn add_hash(&self, hasher: &mut Sha256) {
        self.add_payload_hash(hasher);
        hash::add_bytes(hasher, &self.sig);
    }
}
