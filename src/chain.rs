//! The chain: history, finalized blocks and the fork tree.
//!
//! ```text
//! history (hash only) -> finalized (hash + proposal) -> fork tree
//! ```
//!
//! Notarized blocks form a tree rooted at the last finalized block (or the
//! last history block when nothing is finalized). Each tree node also keeps
//! the proposals extending it that are still waiting for notarization.
//! Nodes own their children; parents are found by searching the tree.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::mem;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

use crate::account;
use crate::beacon::{self, RandomBeacon};
use crate::block::{Block, BlockProposal, NtShare};
use crate::config::{self, Config};
use crate::fault::Fault;
use crate::hash::{Addr, Hash, Hashable, Payload, Rand};
use crate::state::{self, State, SysState, SysTxnError, TxnPool};
use crate::threshold;

/// Notifications for the driving node. Nothing waits for them to be handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    BlockProposal(Arc<BlockProposal>),
    StartRound(u64),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("already exists")]
    AlreadyExists,
    #[error("block proposal {0} not found")]
    ProposalNotFound(Hash),
    #[error("block proposal {0} does not need notarization")]
    NotNeeded(Hash),
    #[error("parent {prev} of round {round} proposal not found")]
    ParentNotFound { prev: Hash, round: u64 },
    #[error("can not connect block to the chain")]
    CannotConnect,
    #[error("round {got} does not follow parent round {parent}")]
    UnexpectedRound { got: u64, parent: u64 },
    #[error("share round {got} differs from proposal round {expected}")]
    ShareRound { got: u64, expected: u64 },
    #[error("group {got} is not the notarization committee {expected}")]
    WrongGroup { got: usize, expected: usize },
    #[error("unknown group {0}")]
    UnknownGroup(usize),
    #[error("{0} is not a member of the group")]
    NotInGroup(Addr),
    #[error("notarization share from {0} already received")]
    DuplicateShare(Addr),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("block does not match its proposal")]
    ProposalMismatch,
    #[error("invalid notarization")]
    InvalidNotarization,
    #[error("state root {block} differs from computed {computed}")]
    StateRoot { block: Hash, computed: Hash },
    #[error("applying transactions: {0}")]
    Txns(#[from] state::Error),
    #[error("applying system transactions: {0}")]
    SysTxns(#[from] SysTxnError),
    #[error("genesis system transactions: {0}")]
    Genesis(SysTxnError),
    #[error("genesis registers no group")]
    NoGroups,
    #[error("config: {0}")]
    Config(#[from] config::Invalid),
    #[error("random beacon: {0}")]
    Beacon(beacon::Error),
    #[error(transparent)]
    Fault(#[from] Fault),
}

impl Error {
    pub fn is_fault(&self) -> bool {
        match self {
            Error::Fault(_) => true,
            Error::Beacon(err) => err.is_fault(),
            _ => false,
        }
    }
}

/// The fork choice tip with the state it produced.
pub struct Leader {
    pub block: Arc<Block>,
    pub state: Arc<dyn State>,
    pub sys_state: Arc<SysState>,
}

#[derive(Debug, Clone)]
struct Snap {
    state: Arc<dyn State>,
    sys_state: Arc<SysState>,
}

#[derive(Debug)]
struct UnNotarized {
    bp: Hash,
    weight: f64,
}

#[derive(Debug)]
struct Notarized {
    block: Hash,
    bp: Hash,
    weight: f64,
    snap: Snap,
    nt_children: Vec<Notarized>,
    non_nt_children: Vec<UnNotarized>,
}

#[derive(Debug)]
struct Finalized {
    block: Hash,
    bp: Hash,
}

struct Tip<'a> {
    node: &'a Notarized,
    root: usize,
    depth: usize,
    weight: f64,
}

fn find<'a>(nodes: &'a [Notarized], h: &Hash) -> Option<&'a Notarized> {
    for n in nodes {
        if n.block == *h {
            return Some(n);
        }
        if let Some(found) = find(&n.nt_children, h) {
            return Some(found);
        }
    }
    None
}

fn find_mut<'a>(nodes: &'a mut [Notarized], h: &Hash) -> Option<&'a mut Notarized> {
    for n in nodes.iter_mut() {
        if n.block == *h {
            return Some(n);
        }
        if let Some(found) = find_mut(&mut n.nt_children, h) {
            return Some(found);
        }
    }
    None
}

fn max_height(nodes: &[Notarized]) -> usize {
    nodes.iter()
        .map(|n| 1 + max_height(&n.nt_children))
        .max()
        .unwrap_or(0)
}

/// Deepest tip, then heaviest path, then smallest block hash.
fn heaviest(roots: &[Notarized]) -> Option<Tip<'_>> {
    let mut best = None;
    for (i, n) in roots.iter().enumerate() {
        descend(n, i, 1, n.weight, &mut best);
    }
    best
}

fn descend<'a>(n: &'a Notarized, root: usize, depth: usize, weight: f64, best: &mut Option<Tip<'a>>) {
    if n.nt_children.is_empty() {
        let better = match best {
            None => true,
            Some(b) => depth.cmp(&b.depth)
                .then(weight.total_cmp(&b.weight))
                .then(b.node.block.cmp(&n.block))
                == Ordering::Greater,
        };
        if better {
            *best = Some(Tip { node: n, root, depth, weight });
        }
        return;
    }
    for c in &n.nt_children {
        descend(c, root, depth + 1, weight + c.weight, best);
    }
}

struct Inner {
    history: Vec<Hash>,
    last_history: Snap,
    finalized: VecDeque<Finalized>,
    last_finalized: Option<Snap>,
    fork: Vec<Notarized>,
    un_notarized_not_on_fork: Vec<UnNotarized>,
    hash_to_block: HashMap<Hash, Arc<Block>>,
    hash_to_bp: HashMap<Hash, Arc<BlockProposal>>,
    hash_to_nt_share: HashMap<Hash, Arc<NtShare>>,
    bp_to_nt_shares: HashMap<Hash, Vec<Arc<NtShare>>>,
    bp_need_notarize: HashSet<Hash>,
}

impl Inner {
    fn round(&self) -> u64 {
        (self.history.len() + self.finalized.len() + max_height(&self.fork)) as u64
    }

    /// The block the fork tree grows from.
    fn tail(&self) -> (Hash, &Snap) {
        match (self.finalized.back(), &self.last_finalized) {
            (Some(f), Some(snap)) => (f.block, snap),
            _ => (self.history.last().copied().unwrap_or_default(), &self.last_history),
        }
    }

    fn snap(&self, block: &Hash) -> Option<Snap> {
        if let Some(n) = find(&self.fork, block) {
            return Some(n.snap.clone());
        }
        let (tail, snap) = self.tail();
        (tail == *block).then(|| snap.clone())
    }

    fn purge_shares(&mut self, bp: &Hash) {
        if let Some(shares) = self.bp_to_nt_shares.remove(bp) {
            for s in shares {
                self.hash_to_nt_share.remove(&s.hash());
            }
        }
    }

    fn discard_proposal(&mut self, bp: &Hash) {
        self.hash_to_bp.remove(bp);
        self.bp_need_notarize.remove(bp);
        self.purge_shares(bp);
    }

    fn discard(&mut self, node: Notarized) {
        self.hash_to_block.remove(&node.block);
        self.hash_to_bp.remove(&node.bp);
        for u in &node.non_nt_children {
            self.discard_proposal(&u.bp);
        }
        for child in node.nt_children {
            self.discard(child);
        }
    }

    /// Moves fork roots into the finalized list while the fork choice tip is
    /// deeper than `depth` below its root.
    fn finalize(&mut self, depth: usize) {
        loop {
            let root = match heaviest(&self.fork) {
                Some(tip) if tip.depth > depth => tip.root,
                _ => return,
            };
            let mut roots = mem::take(&mut self.fork);
            let root = roots.swap_remove(root);
            for other in roots {
                self.discard(other);
            }
            for u in mem::take(&mut self.un_notarized_not_on_fork) {
                self.discard_proposal(&u.bp);
            }
            info!(block = %root.block, "block finalized");
            self.finalized.push_back(Finalized { block: root.block, bp: root.bp });
            self.last_finalized = Some(root.snap);
            self.fork = root.nt_children;
            self.un_notarized_not_on_fork = root.non_nt_children;
        }
    }

    /// Replays the oldest finalized blocks onto history until at most
    /// `keep` remain finalized. A failed replay leaves the block finalized.
    fn bury(&mut self, keep: usize, pool: &dyn TxnPool) -> Result<(), Fault> {
        while self.finalized.len() > keep {
            let (h, bp_hash) = match self.finalized.front() {
                Some(f) => (f.block, f.bp),
                None => break,
            };
            let block = self.hash_to_block
                .get(&h)
                .cloned()
                .ok_or(Fault::MissingBlock { block: h })?;
            let bp = self.hash_to_bp
                .get(&bp_hash)
                .cloned()
                .ok_or(Fault::MissingProposal { block: h, bp: bp_hash })?;
            let (state, _) = self.last_history.state
                .commit_txns(&bp.txns, pool, bp.round)
                .map_err(|err| Fault::Replay { block: h, reason: err.to_string() })?;
            let root = state.hash();
            if root != block.state_root {
                return Err(Fault::Replay {
                    block: h,
                    reason: format!("state root {} differs from block state root {}", root, block.state_root),
                });
            }
            let sys_state = self.last_history.sys_state
                .apply_all(&bp.sys_txns)
                .map_err(|err| Fault::Replay { block: h, reason: err.to_string() })?;
            self.finalized.pop_front();
            self.hash_to_bp.remove(&bp_hash);
            self.history.push(h);
            self.last_history = Snap { state, sys_state: Arc::new(sys_state) };
            info!(block = %h, round = block.round, history = self.history.len(), "block buried");
        }
        if self.finalized.is_empty() {
            self.last_finalized = None;
        }
        Ok(())
    }
}

pub struct Chain {
    cfg: Config,
    beacon: Arc<RandomBeacon>,
    pool: Arc<dyn TxnPool>,
    events: UnboundedSender<Event>,
    inner: RwLock<Inner>,
}

impl Chain {
    /// Starts a chain from `genesis`, whose system transactions register
    /// the committees. Driver notifications arrive on the returned receiver.
    pub fn new(
        genesis: Block,
        genesis_state: Arc<dyn State>,
        seed: Rand,
        cfg: Config,
        pool: Arc<dyn TxnPool>
    ) -> Result<(Self, UnboundedReceiver<Event>), Error> {
        cfg.validate()?;
        let root = genesis_state.hash();
        if root != genesis.state_root {
            return Err(Error::StateRoot { block: genesis.state_root, computed: root });
        }
        let sys_state = SysState::default()
            .apply_all(&genesis.sys_txns)
            .map_err(Error::Genesis)?;
        if sys_state.groups().is_empty() {
            return Err(Error::NoGroups);
        }
        let beacon = RandomBeacon::new(seed, sys_state.groups().to_vec(), cfg.group_threshold)
            .map_err(Error::Beacon)?;
        let beacon = Arc::new(beacon);
        let h = genesis.hash();
        info!(genesis = %h, groups = sys_state.groups().len(), "chain initialized");

        let mut hash_to_block = HashMap::new();
        hash_to_block.insert(h, Arc::new(genesis));
        let (events, rx) = mpsc::unbounded_channel();
        let chain = Self {
            cfg,
            beacon,
            pool,
            events,
            inner: RwLock::new(Inner {
                history: vec![h],
                last_history: Snap { state: genesis_state, sys_state: Arc::new(sys_state) },
                finalized: VecDeque::new(),
                last_finalized: None,
                fork: Vec::new(),
                un_notarized_not_on_fork: Vec::new(),
                hash_to_block,
                hash_to_bp: HashMap::new(),
                hash_to_nt_share: HashMap::new(),
                bp_to_nt_shares: HashMap::new(),
                bp_need_notarize: HashSet::new(),
            }),
        };
        Ok((chain, rx))
    }

    pub fn beacon(&self) -> &Arc<RandomBeacon> {
        &self.beacon
    }

    pub fn txn_pool(&self) -> &dyn TxnPool {
        self.pool.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub async fn block(&self, h: &Hash) -> Option<Arc<Block>> {
        self.inner.read().await.hash_to_block.get(h).cloned()
    }

    pub async fn block_proposal(&self, h: &Hash) -> Option<Arc<BlockProposal>> {
        self.inner.read().await.hash_to_bp.get(h).cloned()
    }

    pub async fn nt_share(&self, h: &Hash) -> Option<Arc<NtShare>> {
        self.inner.read().await.hash_to_nt_share.get(h).cloned()
    }

    pub async fn need_notarize(&self, bp: &Hash) -> bool {
        self.inner.read().await.bp_need_notarize.contains(bp)
    }

    pub async fn round(&self) -> u64 {
        self.inner.read().await.round()
    }

    /// State after `block`, if it is on the fork tree or the tail.
    pub async fn block_state(&self, block: &Hash) -> Option<Arc<dyn State>> {
        self.inner.read().await.snap(block).map(|s| s.state)
    }

    /// `h` together with the state after it, read under one lock. The
    /// state is `None` once the block has been buried or left the tree.
    pub async fn block_with_state(&self, h: &Hash) -> Option<(Arc<Block>, Option<Arc<dyn State>>)> {
        let inner = self.inner.read().await;
        let block = inner.hash_to_block.get(h).cloned()?;
        Some((block, inner.snap(h).map(|s| s.state)))
    }

    /// History followed by the finalized blocks, oldest first.
    pub async fn finalized_chain(&self) -> Vec<Arc<Block>> {
        let inner = self.inner.read().await;
        inner.history.iter()
            .chain(inner.finalized.iter().map(|f| &f.block))
            .filter_map(|h| inner.hash_to_block.get(h).cloned())
            .collect()
    }

    /// Proposals extending `parent` that still wait for notarization,
    /// heaviest first.
    pub async fn pending_proposals(&self, parent: &Hash) -> Vec<(Arc<BlockProposal>, f64)> {
        let inner = self.inner.read().await;
        let pending = match find(&inner.fork, parent) {
            Some(n) => &n.non_nt_children,
            None if inner.tail().0 == *parent => &inner.un_notarized_not_on_fork,
            None => return Vec::new(),
        };
        let mut out: Vec<(Arc<BlockProposal>, f64)> = pending.iter()
            .filter_map(|u| inner.hash_to_bp.get(&u.bp).map(|bp| (bp.clone(), u.weight)))
            .collect();
        out.sort_by(|a, b| b.1.total_cmp(&a.1));
        out
    }

    /// The fork choice tip, or the tail when the fork tree is empty.
    pub async fn leader(&self) -> Result<Leader, Fault> {
        let inner = self.inner.read().await;
        let (block, snap) = match heaviest(&inner.fork) {
            Some(tip) => (tip.node.block, tip.node.snap.clone()),
            None => {
                let (h, snap) = inner.tail();
                (h, snap.clone())
            }
        };
        let block = inner.hash_to_block
            .get(&block)
            .cloned()
            .ok_or(Fault::MissingBlock { block })?;
        Ok(Leader { block, state: snap.state, sys_state: snap.sys_state })
    }

    pub async fn add_block_proposal(&self, bp: BlockProposal, weight: f64) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let h = bp.hash();
        if inner.hash_to_bp.contains_key(&h) {
            return Err(Error::AlreadyExists);
        }
        if find(&inner.fork, &bp.prev_block).is_none() && inner.tail().0 != bp.prev_block {
            return Err(Error::ParentNotFound { prev: bp.prev_block, round: bp.round });
        }
        let parent = inner.hash_to_block
            .get(&bp.prev_block)
            .map(|b| b.round)
            .ok_or(Fault::MissingBlock { block: bp.prev_block })?;
        if bp.round != parent + 1 {
            return Err(Error::UnexpectedRound { got: bp.round, parent });
        }

        let pending = UnNotarized { bp: h, weight };
        match find_mut(&mut inner.fork, &bp.prev_block) {
            Some(n) => n.non_nt_children.push(pending),
            None => inner.un_notarized_not_on_fork.push(pending),
        }
        let bp = Arc::new(bp);
        inner.hash_to_bp.insert(h, bp.clone());
        inner.bp_need_notarize.insert(h);
        debug!(bp = %h, round = bp.round, owner = %bp.owner, "block proposal added");
        let _ = self.events.send(Event::BlockProposal(bp));
        Ok(())
    }

    /// Accumulates one notarization share. Returns the notarized block
    /// once `group_threshold` shares agree on the proposal's state root.
    pub async fn add_nt_share(&self, share: NtShare, group_id: usize) -> Result<Option<Block>, Error> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let share_hash = share.hash();
        if inner.hash_to_nt_share.contains_key(&share_hash) {
            return Err(Error::AlreadyExists);
        }
        let bp = inner.hash_to_bp
            .get(&share.bp)
            .cloned()
            .ok_or(Error::ProposalNotFound(share.bp))?;
        if !inner.bp_need_notarize.contains(&share.bp) {
            return Err(Error::NotNeeded(share.bp));
        }
        if share.round != bp.round {
            return Err(Error::ShareRound { got: share.round, expected: bp.round });
        }
        let nt = self.beacon.committees(share.round).await.map_err(Error::Beacon)?.nt;
        if nt != group_id {
            return Err(Error::WrongGroup { got: group_id, expected: nt });
        }
        let group = self.beacon.group(group_id).ok_or(Error::UnknownGroup(group_id))?;
        let (_, member) = group.member(&share.owner).ok_or(Error::NotInGroup(share.owner))?;
        let seen = inner.bp_to_nt_shares
            .get(&share.bp)
            .map_or(false, |shares| shares.iter().any(|s| s.owner == share.owner));
        if seen {
            return Err(Error::DuplicateShare(share.owner));
        }
        if !account::verify(&member.pk, &share.payload_hash(), &share.sig) {
            return Err(Error::InvalidSignature);
        }
        let unsigned = Block::from_proposal(&bp, share.bp, share.state_root);
        let msg = unsigned.payload_hash();
        if !member.share_pk.verify(&msg, &share.sig_share) {
            return Err(Error::InvalidSignature);
        }

        let share = Arc::new(share);
        inner.hash_to_nt_share.insert(share_hash, share.clone());
        let needed = self.cfg.group_threshold;
        let sig = {
            let shares = inner.bp_to_nt_shares.entry(share.bp).or_default();
            shares.push(share.clone());
            let agreeing: Vec<&NtShare> = shares.iter()
                .filter(|s| s.state_root == share.state_root)
                .map(|s| s.as_ref())
                .collect();
            debug!(bp = %share.bp, owner = %share.owner, shares = agreeing.len(), needed, "notarization share accepted");
            if agreeing.len() < needed {
                return Ok(None);
            }
            let mut parts = Vec::with_capacity(needed);
            for s in agreeing.iter().take(needed) {
                let (id, _) = group.member(&s.owner).ok_or(Error::NotInGroup(s.owner))?;
                parts.push((id, s.sig_share.as_slice()));
            }
            threshold::recover(&parts).map_err(Fault::Recover)?
        };
        if !group.pk.verify(&msg, &sig) {
            return Err(Fault::NotarizationSig { bp: share.bp }.into());
        }

        inner.bp_need_notarize.remove(&share.bp);
        inner.purge_shares(&share.bp);
        let block = Block { notarization_sig: sig, ..unsigned };
        info!(block = %block.hash(), round = block.round, bp = %share.bp, "block notarized");
        Ok(Some(block))
    }

    /// Appends a notarized block to the fork tree, then finalizes and
    /// buries what has become deep enough.
    pub async fn add_block(&self, block: Block, weight: f64) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let prev_round = inner.round();
        let h = block.hash();
        if inner.hash_to_block.contains_key(&h) {
            return Err(Error::AlreadyExists);
        }
        let bp = inner.hash_to_bp
            .get(&block.block_proposal)
            .cloned()
            .ok_or(Error::ProposalNotFound(block.block_proposal))?;
        if block.round != bp.round
            || block.prev_block != bp.prev_block
            || block.owner != bp.owner
            || block.sys_txns != bp.sys_txns
        {
            return Err(Error::ProposalMismatch);
        }
        // Proposals are only accepted under a tree node or the tail, and
        // finalization discards every pending proposal whose parent leaves
        // both, so a known proposal always has a parent snapshot.
        let parent = inner.snap(&block.prev_block).ok_or(Error::CannotConnect)?;
        let nt = self.beacon.committees(block.round).await.map_err(Error::Beacon)?.nt;
        let group = self.beacon.group(nt).ok_or(Error::UnknownGroup(nt))?;
        if !group.pk.verify(&block.payload_hash(), &block.notarization_sig) {
            return Err(Error::InvalidNotarization);
        }
        let (state, _) = parent.state.commit_txns(&bp.txns, self.pool.as_ref(), bp.round)?;
        let root = state.hash();
        if root != block.state_root {
            return Err(Error::StateRoot { block: block.state_root, computed: root });
        }
        let sys_state = parent.sys_state.apply_all(&bp.sys_txns)?;

        let bp_hash = block.block_proposal;
        let node = Notarized {
            block: h,
            bp: bp_hash,
            weight,
            snap: Snap { state, sys_state: Arc::new(sys_state) },
            nt_children: Vec::new(),
            non_nt_children: Vec::new(),
        };
        match find_mut(&mut inner.fork, &block.prev_block) {
            Some(parent) => {
                parent.non_nt_children.retain(|u| u.bp != bp_hash);
                parent.nt_children.push(node);
            }
            None => {
                inner.un_notarized_not_on_fork.retain(|u| u.bp != bp_hash);
                inner.fork.push(node);
            }
        }
        let block_round = block.round;
        inner.hash_to_block.insert(h, Arc::new(block));
        inner.bp_need_notarize.remove(&bp_hash);
        inner.purge_shares(&bp_hash);
        debug!(block = %h, round = block_round, "block added");

        inner.finalize(self.cfg.finalize_depth);
        inner.bury(self.cfg.bury_depth, self.pool.as_ref())?;

        let round = inner.round();
        let rb_round = self.beacon.round().await;
        if round == prev_round + 1 && round == rb_round {
            info!(round, "starting round");
            let _ = self.events.send(Event::StartRound(round));
        }
        Ok(())
    }
}
