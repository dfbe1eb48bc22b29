//! Block notarization.
//!
//! One `Notary` run covers one round. It collects proposals until the
//! soft deadline, signs every proposal tied at the best rank seen, then
//! keeps signing late arrivals whose rank is equal or better until the
//! hard cancel.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::account;
use crate::block::{Block, BlockProposal, NtShare};
use crate::chain::Chain;
use crate::fault::Fault;
use crate::hash::{Addr, Hashable, Payload};
use crate::threshold;

pub struct Notary {
    owner: Addr,
    identity: Arc<account::Keypair>,
    share: threshold::SecretShare,
    chain: Arc<Chain>,
}

impl Notary {
    pub fn new(identity: Arc<account::Keypair>, share: threshold::SecretShare, chain: Arc<Chain>) -> Self {
        Self { owner: identity.addr(), identity, share, chain }
    }

    pub fn owner(&self) -> Addr {
        self.owner
    }

    /// Notarizes the proposals arriving on `proposals`.
    ///
    /// Collects until `collect` fires (or a rank 0 proposal arrives, which
    /// nothing can beat), then signs every proposal tied at the best rank.
    /// After that each newly received proposal whose rank is equal to or
    /// better than the best so far is signed immediately, until `cancel`
    /// fires or the channel closes. Every share is handed to `on_notarize`
    /// with the time spent applying the proposal's transactions.
    pub async fn notarize<F>(
        &self,
        collect: CancellationToken,
        cancel: CancellationToken,
        mut proposals: UnboundedReceiver<Arc<BlockProposal>>,
        mut on_notarize: F
    ) -> Result<(), Fault>
    where
        F: FnMut(NtShare, Duration)
    {
        let mut best_rank_bps: Vec<Arc<BlockProposal>> = Vec::new();
        let mut best_rank = u16::MAX;
        let mut open = true;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = collect.cancelled() => {
                    // Already delivered proposals still count for this window.
                    while let Ok(bp) = proposals.try_recv() {
                        self.collect(bp, &mut best_rank_bps, &mut best_rank).await;
                    }
                    break;
                }
                bp = proposals.recv(), if open => match bp {
                    Some(bp) => {
                        if self.collect(bp, &mut best_rank_bps, &mut best_rank).await == Some(0) {
                            debug!(owner = %self.owner, "rank 0 proposal received, closing collection");
                            break;
                        }
                    }
                    None => open = false,
                },
            }
        }

        for bp in &best_rank_bps {
            let (share, dur) = self.notarize_proposal(bp).await?;
            on_notarize(share, dur);
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                bp = proposals.recv() => {
                    let bp = match bp {
                        Some(bp) => bp,
                        None => return Ok(()),
                    };
                    if let Some(rank) = self.rank(&bp).await {
                        if rank <= best_rank {
                            best_rank = rank;
                            let (share, dur) = self.notarize_proposal(&bp).await?;
                            on_notarize(share, dur);
                        }
                    }
                }
            }
        }
    }

    async fn collect(
        &self,
        bp: Arc<BlockProposal>,
        best_rank_bps: &mut Vec<Arc<BlockProposal>>,
        best_rank: &mut u16
    ) -> Option<u16> {
        let rank = self.rank(&bp).await?;
        if best_rank_bps.is_empty() || rank < *best_rank {
            *best_rank = rank;
            best_rank_bps.clear();
            best_rank_bps.push(bp);
        } else if rank == *best_rank {
            best_rank_bps.push(bp);
        }
        Some(rank)
    }

    async fn rank(&self, bp: &BlockProposal) -> Option<u16> {
        match self.chain.beacon().rank(&bp.owner, bp.round).await {
            Ok(rank) => Some(rank),
            Err(err) => {
                warn!(%err, round = bp.round, owner = %bp.owner, "get rank error");
                None
            }
        }
    }

    /// Applies the proposal on its parent's state and signs the resulting
    /// block with this member's group share.
    pub async fn notarize_proposal(&self, bp: &BlockProposal) -> Result<(NtShare, Duration), Fault> {
        let bp_hash = bp.hash();
        let (_, state) = self.chain
            .block_with_state(&bp.prev_block)
            .await
            .ok_or(Fault::MissingParentBlock { bp: bp_hash, prev: bp.prev_block })?;
        let state = state.ok_or(Fault::MissingParentState { bp: bp_hash, prev: bp.prev_block })?;

        let start = Instant::now();
        let (new_state, _) = state
            .commit_txns(&bp.txns, self.chain.txn_pool(), bp.round)
            .map_err(|err| Fault::CommitTxns { bp: bp_hash, err })?;
        let dur = start.elapsed();
        debug!(round = bp.round, bp = %bp_hash, ?dur, "notarize record txns done");

        let state_root = new_state.hash();
        let blk = Block::from_proposal(bp, bp_hash, state_root);
        let mut nts = NtShare {
            round: bp.round,
            bp: bp_hash,
            state_root,
            owner: self.owner,
            sig_share: self.share.sign(&blk.payload_hash()),
            sig: Vec::new(),
        };
        nts.sig = self.identity.sign(&nts.payload_hash());
        Ok((nts, dur))
    }

    /// Runs `notarize` on its own task with timers for the soft deadline
    /// (`collect_window`) and the hard cancel (`round_timeout`, measured
    /// from now). The returned token cancels the round early.
    pub fn spawn_round<F>(
        self: Arc<Self>,
        proposals: UnboundedReceiver<Arc<BlockProposal>>,
        collect_window: Duration,
        round_timeout: Duration,
        on_notarize: F
    ) -> (JoinHandle<Result<(), Fault>>, CancellationToken)
    where
        F: FnMut(NtShare, Duration) + Send + 'static
    {
        let collect = CancellationToken::new();
        let cancel = CancellationToken::new();
        let start = time::Instant::now();
        {
            let collect = collect.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = time::sleep_until(start + collect_window) => collect.cancel(),
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {}
                    _ = time::sleep_until(start + round_timeout) => cancel.cancel(),
                }
            });
        }
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let res = self.notarize(collect, cancel, proposals, on_notarize).await;
                if let Err(fault) = &res {
                    error!(%fault, owner = %self.owner, "notarization halted");
                }
                res
            })
        };
        (handle, cancel)
    }
}
