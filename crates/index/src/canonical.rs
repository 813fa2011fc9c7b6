use cedar_primitives::{BranchId, Height, NO_BRANCH};
use std::collections::BTreeMap;

/// The projected root-to-head path serving as the canonical linear view.
///
/// Branches are keyed by their top height, so the branch covering a height is
/// the first entry at or above it. Keys are strictly increasing along the
/// path by construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CanonicalChain {
    chain: BTreeMap<Height, BranchId>,
    top_branch: BranchId,
    height: Height,
}

impl CanonicalChain {
    /// Whether any projection is set.
    pub(crate) fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// The branch the projection ends in, [`NO_BRANCH`] when unset.
    pub(crate) fn top_branch(&self) -> BranchId {
        self.top_branch
    }

    /// Upper height bound of the projection.
    pub(crate) fn height(&self) -> Height {
        self.height
    }

    /// Returns the branch covering `height`, if the projection reaches it.
    pub(crate) fn branch_at(&self, height: Height) -> Option<BranchId> {
        if self.chain.is_empty() || height > self.height {
            return None;
        }
        self.chain.range(height..).next().map(|(_, &id)| id)
    }

    /// Replaces the projection with the given `(top_height, branch)` entries.
    pub(crate) fn replace(
        &mut self,
        entries: impl IntoIterator<Item = (Height, BranchId)>,
        top_branch: BranchId,
        height: Height,
    ) {
        self.chain = entries.into_iter().collect();
        self.top_branch = top_branch;
        self.height = height;
    }

    /// Caps the projection at `height` without rebuilding it.
    pub(crate) fn set_height(&mut self, height: Height) {
        self.height = height;
    }

    /// Whether the projection currently contains `branch` keyed at
    /// `top_height`.
    pub(crate) fn contains(&self, top_height: Height, branch: BranchId) -> bool {
        self.chain.get(&top_height) == Some(&branch)
    }

    /// Removes the entry for `top_height`, returning the branch it mapped to.
    pub(crate) fn remove(&mut self, top_height: Height) -> Option<BranchId> {
        self.chain.remove(&top_height)
    }

    /// Key of the entry mapping to `branch`, if the projection contains it.
    pub(crate) fn entry_of(&self, branch: BranchId) -> Option<Height> {
        self.chain.iter().find_map(|(&h, &id)| (id == branch).then_some(h))
    }

    /// Redirects the projection top to another branch.
    pub(crate) fn set_top_branch(&mut self, branch: BranchId) {
        self.top_branch = branch;
    }

    /// Inserts a `(top_height, branch)` entry.
    pub(crate) fn insert(&mut self, top_height: Height, branch: BranchId) {
        self.chain.insert(top_height, branch);
    }

    /// Drops the projection entirely.
    pub(crate) fn clear(&mut self) {
        self.chain.clear();
        self.top_branch = NO_BRANCH;
        self.height = 0;
    }
}
