use crate::{Height, TipsetHash};
use std::collections::BTreeSet;

/// Identifier of a branch in the branch forest. Monotonically assigned and
/// never reused.
pub type BranchId = u64;

/// Reserved id meaning "no branch".
pub const NO_BRANCH: BranchId = 0;

/// Fixed id of the branch rooted at genesis.
pub const GENESIS_BRANCH: BranchId = 1;

/// Metadata of one branch: a maximal linear run of tipsets with no internal
/// fork.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchInfo {
    /// Branch id, nonzero.
    pub id: BranchId,
    /// Hash of the highest tipset in the segment.
    pub top: TipsetHash,
    /// Height of the highest tipset.
    pub top_height: Height,
    /// Hash of the lowest tipset in the segment.
    pub bottom: TipsetHash,
    /// Height of the lowest tipset; never above `top_height`.
    pub bottom_height: Height,
    /// Id of the branch containing the tipset that `bottom` extends, or
    /// [`NO_BRANCH`] for a root.
    pub parent: BranchId,
    /// Hash of the parent tipset awaited below `bottom`; `None` once the
    /// branch chains down to genesis.
    pub parent_hash: Option<TipsetHash>,
    /// Whether the path from this branch reaches the genesis branch.
    pub synced_to_genesis: bool,
    /// Child branches whose bottoms chain onto this branch's top.
    pub forks: BTreeSet<BranchId>,
}

impl BranchInfo {
    /// Creates a single-tipset branch.
    pub fn new(id: BranchId, hash: TipsetHash, height: Height) -> Self {
        Self {
            id,
            top: hash,
            top_height: height,
            bottom: hash,
            bottom_height: height,
            parent: NO_BRANCH,
            parent_hash: None,
            synced_to_genesis: false,
            forks: BTreeSet::new(),
        }
    }

    /// Whether this branch is a head (has no forks).
    pub fn is_head(&self) -> bool {
        self.forks.is_empty()
    }

    /// Whether this branch is a root (has no parent branch).
    pub fn is_root(&self) -> bool {
        self.parent == NO_BRANCH
    }
}

/// Description of a branch split: rows above `above_height` move from
/// `old_id` to `new_id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SplitBranch {
    /// Branch being split; keeps the rows at and below the pivot.
    pub old_id: BranchId,
    /// Freshly assigned id for the rows above the pivot.
    pub new_id: BranchId,
    /// Pivot height; the split happens just above it.
    pub above_height: Height,
}
