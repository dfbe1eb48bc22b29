//! Invariant violations.
//!
//! A `Fault` means either the threshold scheme or the chain's own data is
//! inconsistent. It is never the result of a peer sending bad input: those
//! surface as the ordinary error enums of each module. Whoever receives a
//! fault should stop the unit of work that produced it (the round, the
//! connection) and report it loudly rather than carry on.

use crate::hash::Hash;
use crate::state;
use crate::threshold;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    #[error("random beacon group signature for round {round} failed verification")]
    BeaconSig { round: u64 },
    #[error("notarization group signature for proposal {bp} failed verification")]
    NotarizationSig { bp: Hash },
    #[error("recovering group signature from verified shares: {0}")]
    Recover(threshold::Error),
    #[error("parent block {prev} of proposal {bp} not found")]
    MissingParentBlock { bp: Hash, prev: Hash },
    #[error("state of parent block {prev} of proposal {bp} not found")]
    MissingParentState { bp: Hash, prev: Hash },
    #[error("committing transactions of proposal {bp}: {err}")]
    CommitTxns { bp: Hash, err: state::Error },
    #[error("block {block} is on the chain but not stored")]
    MissingBlock { block: Hash },
    #[error("proposal {bp} of finalized block {block} not found")]
    MissingProposal { block: Hash, bp: Hash },
    #[error("replaying finalized block {block}: {reason}")]
    Replay { block: Hash, reason: String },
}
