//! Error taxonomy of the sync core.
//!
//! Every error surfaced at a crate boundary is one of the domain enums below,
//! unified under [`SyncError`]. Fatal invariant and storage errors stop sync;
//! network and peer errors stay local to the request that hit them.

use cedar_primitives::{BranchId, Height, TipsetError, TipsetHash};

/// Result alias for [`SyncError`].
pub type SyncResult<T> = Result<T, SyncError>;

/// Result alias for a single network request.
pub type RequestResult<T> = Result<T, RequestError>;

/// A referenced entity does not exist.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotFoundError {
    /// No branch covers the requested position.
    #[error("branch not found at height {0}")]
    BranchNotFound(Height),
    /// No branch with the given id exists.
    #[error("branch {0} does not exist")]
    NoSuchBranch(BranchId),
    /// No chain projection has been selected yet.
    #[error("no current chain")]
    NoCurrentChain,
    /// The store holds no head to report as heaviest.
    #[error("no heaviest tipset")]
    NoHeaviestTipset,
    /// The store was opened without a genesis block.
    #[error("no genesis block")]
    NoGenesisBlock,
    /// The tipset is not stored.
    #[error("tipset {0} not found")]
    TipsetNotFound(TipsetHash),
}

/// An internal consistency rule was violated; the holder clears its state and
/// the node should halt or re-bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantError {
    /// The parent relation of persisted branches contains a cycle.
    #[error("cycle detected in branch graph")]
    CycleDetected,
    /// Persisted branch records failed validation on load.
    #[error("cannot load branch graph: {0}")]
    GraphLoad(String),
    /// Stored data contradicts itself.
    #[error("data integrity error: {0}")]
    DataIntegrity(String),
    /// A link connects tipsets at impossible heights.
    #[error("link height mismatch")]
    LinkHeightMismatch,
    /// The store was used before initialization or outside a transaction.
    #[error("store not initialized")]
    StoreNotInitialized,
    /// The stored genesis differs from the expected one.
    #[error("stored genesis does not match the expected cid")]
    GenesisMismatch,
}

/// An operation was invoked on a branch in the wrong role.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreconditionError {
    /// The operation requires a head branch.
    #[error("branch {0} is not a head")]
    BranchIsNotAHead(BranchId),
    /// The operation requires a root branch.
    #[error("branch {0} is not a root")]
    BranchIsNotARoot(BranchId),
}

/// A network request failed; never propagated globally, only per request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// The peer cannot be reached.
    #[error("peer unreachable")]
    PeerUnreachable,
    /// No response within the request deadline.
    #[error("request timed out")]
    RequestTimeout,
    /// The response does not match the request: hash mismatch or a malformed
    /// tipset.
    #[error("bad response: {0}")]
    BadResponse(String),
    /// The channel to the requesting task closed.
    #[error("channel closed")]
    ChannelClosed,
}

/// A tipset or block was refused by validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Cryptographic or structural rejection of blocks.
    #[error("bad blocks: {0}")]
    BadBlocks(String),
    /// The tipset was determined bad earlier; retries short-circuit.
    #[error("tipset marked bad")]
    TipsetMarkedBad,
}

/// An underlying store failed; propagated verbatim as a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Error from the relational index store.
    #[error("index store: {0}")]
    Index(String),
    /// Error from the interpreter result cache.
    #[error("result cache: {0}")]
    Cache(String),
    /// Error from the content-addressed blockstore.
    #[error("blockstore: {0}")]
    Blockstore(String),
}

impl StoreError {
    /// Wraps an index store error, keeping its message.
    pub fn index(err: impl ToString) -> Self {
        Self::Index(err.to_string())
    }

    /// Wraps a result cache error, keeping its message.
    pub fn cache(err: impl ToString) -> Self {
        Self::Cache(err.to_string())
    }

    /// Wraps a blockstore error, keeping its message.
    pub fn blockstore(err: impl ToString) -> Self {
        Self::Blockstore(err.to_string())
    }
}

/// Any error the sync core can surface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// A referenced entity does not exist.
    #[error(transparent)]
    NotFound(#[from] NotFoundError),
    /// An internal consistency rule was violated.
    #[error(transparent)]
    Invariant(#[from] InvariantError),
    /// An operation hit a branch in the wrong role.
    #[error(transparent)]
    Precondition(#[from] PreconditionError),
    /// A network request failed.
    #[error(transparent)]
    Network(#[from] RequestError),
    /// Validation refused blocks or a tipset.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// An underlying store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A tipset could not be constructed from its blocks.
    #[error(transparent)]
    Tipset(#[from] TipsetError),
}

impl SyncError {
    /// Whether the error is fatal for the node (invariant or storage), as
    /// opposed to absorbable network/peer trouble.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Invariant(_) | SyncError::Store(_))
    }
}
