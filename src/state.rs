use sha2::{Sha256, Digest};
use serde::{Serialize, Deserialize};
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;

use crate::group::Group;
use crate::hash::{Hash, Hashable};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid transaction at offset {0}")]
    BadTxn(usize),
    #[error("transaction batch rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub txn: Hash,
    pub success: bool
}

/// Pending transactions a state may consult when replaying a batch.
pub trait TxnPool: Send + Sync {
    fn get(&self, hash: &Hash) -> Option<Vec<u8>>;

    fn remove(&self, hash: &Hash);
}

/// Application state produced by applying transaction batches.
pub trait State: Send + Sync + Debug {
    fn hash(&self) -> Hash;

    /// Applies `txns` on top of this state, returning the new state.
    /// `self` is left untouched so forks can share a parent.
    fn commit_txns(
        &self,
        txns: &[u8],
        pool: &dyn TxnPool,
        round: u64
    ) -> Result<(Arc<dyn State>, Vec<Receipt>), Error>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SysTxnError {
    #[error("group has no members")]
    EmptyGroup,
    #[error("group already registered")]
    DuplicateGroup,
    #[error("member listed twice in group")]
    DuplicateMember,
}

/// System transaction, carried by proposals next to the application batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SysTxn {
    RegisterGroup(Group)
}

impl Hashable for SysTxn {
    fn add_hash(&self, hasher: &mut Sha256) {
        match self {
            SysTxn::RegisterGroup(group) => {
                hasher.update([0u8]);
                group.add_hash(hasher);
            }
        }
    }
}

/// Consensus-level state: the registered committees.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SysState {
    groups: Vec<Group>
}

impl SysState {
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn transition(&self) -> Transition {
        Transition { state: self.clone() }
    }

    /// Applies a batch all-or-nothing.
    pub fn apply_all(&self, txns: &[SysTxn]) -> Result<SysState, SysTxnError> {
        if txns.is_empty() {
            return Ok(self.clone());
        }
        let mut t = self.transition();
        for txn in txns {
            t.record(txn)?;
        }
        Ok(t.apply())
    }
}

#[derive(Debug, Clone)]
pub struct Transition {
    state: SysState
}

impl Transition {
    pub fn record(&mut self, txn: &SysTxn) -> Result<(), SysTxnError> {
        match txn {
            SysTxn::RegisterGroup(group) => {
                if group.members.is_empty() {
                    return Err(SysTxnError::EmptyGroup);
                }
                if self.state.groups.iter().any(|g| g.pk == group.pk) {
                    return Err(SysTxnError::DuplicateGroup);
                }
                let mut addrs = BTreeSet::new();
                if !group.members.iter().all(|m| addrs.insert(m.addr())) {
                    return Err(SysTxnError::DuplicateMember);
                }
                self.state.groups.push(group.clone());
            }
        }
        Ok(())
    }

    pub fn apply(self) -> SysState {
        self.state
    }
}
