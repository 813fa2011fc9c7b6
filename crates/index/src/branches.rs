//! In-memory forest of chain branches.

use crate::canonical::CanonicalChain;
use cedar_interfaces::{
    InvariantError, NotFoundError, PreconditionError, SyncError, SyncResult,
};
use cedar_primitives::{
    BranchId, BranchInfo, Height, SplitBranch, TipsetHash, GENESIS_BRANCH, NO_BRANCH,
};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error};

/// A change to the head set: `added` replaces `removed` when both are set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeadUpdate {
    /// Head tipset that stopped being a head.
    pub removed: Option<TipsetHash>,
    /// Tipset that became a (synced) head.
    pub added: Option<TipsetHash>,
}

/// Where a new tipset attaches to the forest, planned by
/// [`BranchGraph::find_store_position`] and applied by
/// [`BranchGraph::store_tipset`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StorePosition {
    /// Branch the tipset will belong to.
    pub assigned_branch: BranchId,
    /// Unloaded root branch the tipset becomes the new bottom of.
    pub at_bottom_of_branch: BranchId,
    /// Branch whose top is the tipset's parent.
    pub on_top_of_branch: BranchId,
    /// Split required because the parent sits mid-branch.
    pub split: Option<SplitBranch>,
}

/// In-memory DAG of chain branches with fork/merge/split semantics.
///
/// Pure structure: durable state lives in the
/// [`IndexStore`](crate::IndexStore) and the graph is reconstructed from it
/// at startup via [`BranchGraph::load`]. Every mutation here is paired by
/// [`ChainDb`](crate::ChainDb) with a store transaction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BranchGraph {
    all: BTreeMap<BranchId, BranchInfo>,
    /// Head branches keyed by their top tipset hash.
    heads: HashMap<TipsetHash, BranchId>,
    /// Roots not yet chained to genesis, keyed by the parent hash they await.
    unloaded_roots: HashMap<TipsetHash, BranchId>,
    genesis: BranchId,
    current: CanonicalChain,
    next_id: BranchId,
}

impl BranchGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self { next_id: GENESIS_BRANCH + 1, ..Default::default() }
    }

    /// Whether the graph holds no branches.
    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    /// Drops all state.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Branch metadata by id.
    pub fn branch(&self, id: BranchId) -> SyncResult<&BranchInfo> {
        self.all.get(&id).ok_or_else(|| NotFoundError::NoSuchBranch(id).into())
    }

    /// Id of the genesis-rooted branch, [`NO_BRANCH`] before genesis is
    /// stored.
    pub fn genesis_branch(&self) -> BranchId {
        self.genesis
    }

    /// Snapshot of the head set: `(top tipset hash, branch id)` pairs.
    pub fn heads(&self) -> Vec<(TipsetHash, BranchId)> {
        self.heads.iter().map(|(&hash, &id)| (hash, id)).collect()
    }

    /// Branch whose top is `hash`, if that tipset is a head.
    pub fn head_of(&self, hash: &TipsetHash) -> Option<BranchId> {
        self.heads.get(hash).copied()
    }

    /// Snapshot of the root set: the genesis branch plus every unloaded root.
    pub fn roots(&self) -> Vec<BranchId> {
        let mut roots: Vec<BranchId> = self.unloaded_roots.values().copied().collect();
        if self.genesis != NO_BRANCH {
            roots.push(self.genesis);
        }
        roots.sort_unstable();
        roots
    }

    /// Clones all branch records, suitable for feeding back into
    /// [`BranchGraph::load`].
    pub fn dump(&self) -> BTreeMap<BranchId, BranchInfo> {
        self.all.clone()
    }

    /// Allocates the next branch id; monotonic, never reused.
    pub fn next_branch_id(&mut self) -> BranchId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// On the projected chain, returns the branch covering `height`.
    pub fn find_by_height(&self, height: Height) -> SyncResult<BranchId> {
        if self.current.is_empty() {
            return Err(NotFoundError::NoCurrentChain.into());
        }
        self.current
            .branch_at(height)
            .ok_or_else(|| NotFoundError::BranchNotFound(height).into())
    }

    /// Like [`Self::find_by_height`] but yields [`NO_BRANCH`] instead of an
    /// error for heights above the projection.
    pub fn find_by_height_or_none(&self, height: Height) -> SyncResult<BranchId> {
        if self.current.is_empty() {
            return Err(NotFoundError::NoCurrentChain.into());
        }
        Ok(self.current.branch_at(height).unwrap_or(NO_BRANCH))
    }

    /// Rebuilds the projected chain to end in `head` at `height`.
    ///
    /// The walk over parent links is bounded by the number of branches so a
    /// cycle introduced by corrupt persisted state is detected instead of
    /// looping; never trust loaded data.
    pub fn switch_to_head(&mut self, head: BranchId, height: Height) -> SyncResult<()> {
        let info = self.branch(head)?;
        if !info.is_head() {
            return Err(PreconditionError::BranchIsNotAHead(head).into());
        }
        if !info.synced_to_genesis {
            return Err(InvariantError::DataIntegrity(format!(
                "branch {head} is not synced to genesis"
            ))
            .into());
        }
        if height < info.bottom_height || height > info.top_height {
            return Err(InvariantError::LinkHeightMismatch.into());
        }

        if self.current.top_branch() == head {
            self.current.set_height(height);
            return Ok(());
        }

        let mut entries = vec![(info.top_height, info.id)];
        let mut parent = info.parent;
        let mut cycle_guard = self.all.len() + 1;
        while parent != NO_BRANCH {
            cycle_guard -= 1;
            if cycle_guard == 0 {
                self.current.clear();
                error!(target: "index::branches", head, "cycle in branch parent links");
                return Err(InvariantError::CycleDetected.into());
            }
            let info = self.branch(parent)?;
            entries.push((info.top_height, info.id));
            parent = info.parent;
        }
        self.current.replace(entries, head, height);
        Ok(())
    }

    /// Walks parent links from `id` to its root branch.
    pub fn root_of(&self, id: BranchId) -> SyncResult<&BranchInfo> {
        let mut info = self.branch(id)?;
        let mut cycle_guard = self.all.len() + 1;
        while info.parent != NO_BRANCH {
            cycle_guard -= 1;
            if cycle_guard == 0 {
                return Err(InvariantError::CycleDetected.into());
            }
            info = self.branch(info.parent)?;
        }
        Ok(info)
    }

    /// Plans where a tipset `(hash, height)` attaches. `parent_branch` is
    /// [`NO_BRANCH`] when the parent tipset is not stored. Does not touch the
    /// forest structure; it only allocates fresh branch ids as needed.
    pub fn find_store_position(
        &mut self,
        hash: &TipsetHash,
        height: Height,
        parent_branch: BranchId,
        parent_height: Height,
    ) -> SyncResult<StorePosition> {
        let mut pos = StorePosition::default();

        if height == 0 {
            if !self.is_empty() {
                return Err(
                    InvariantError::DataIntegrity("genesis is already stored".into()).into()
                );
            }
            pos.assigned_branch = GENESIS_BRANCH;
            return Ok(pos);
        }

        if let Some(&waiting) = self.unloaded_roots.get(hash) {
            // the tipset closes the gap below this unloaded subgraph
            pos.at_bottom_of_branch = waiting;
            pos.assigned_branch = waiting;
        }

        if parent_branch != NO_BRANCH {
            let info = self.branch(parent_branch)?;
            let (top_height, bottom_height, parent_is_head) =
                (info.top_height, info.bottom_height, info.is_head());
            if parent_height > top_height
                || parent_height < bottom_height
                || parent_height >= height
            {
                return Err(InvariantError::LinkHeightMismatch.into());
            }
            pos.on_top_of_branch = parent_branch;

            if parent_height != top_height {
                pos.split = Some(SplitBranch {
                    old_id: parent_branch,
                    new_id: self.next_branch_id(),
                    above_height: parent_height,
                });
            } else if parent_is_head && pos.assigned_branch == NO_BRANCH {
                pos.assigned_branch = parent_branch;
            }
        }

        if pos.assigned_branch == NO_BRANCH {
            pos.assigned_branch = self.next_branch_id();
        }
        Ok(pos)
    }

    /// Splits `split.old_id` at `split.above_height`: rows at and below the
    /// pivot keep the old id, the portion above becomes branch
    /// `split.new_id`. `new_top` is the tipset left at the lower portion's
    /// top; `new_bottom` the lowest tipset of the upper portion.
    pub fn split_branch(
        &mut self,
        new_top: &TipsetHash,
        new_bottom: &TipsetHash,
        new_bottom_height: Height,
        split: &SplitBranch,
    ) -> SyncResult<()> {
        if split.old_id == NO_BRANCH || split.new_id == NO_BRANCH || split.new_id == split.old_id {
            return Err(InvariantError::DataIntegrity("invalid split ids".into()).into());
        }
        if self.all.contains_key(&split.new_id) {
            return Err(InvariantError::DataIntegrity(format!(
                "split target branch {} already exists",
                split.new_id
            ))
            .into());
        }
        let lower = self.branch(split.old_id)?.clone();
        if lower.top_height <= split.above_height
            || lower.bottom_height > split.above_height
            || new_bottom_height <= split.above_height
            || new_bottom_height > lower.top_height
        {
            return Err(InvariantError::LinkHeightMismatch.into());
        }

        let was_head = self.heads.remove(&lower.top).is_some();
        let in_current = self.current.entry_of(lower.id);

        // upper portion inherits the old top and forks under the fresh id
        let mut upper = lower.clone();
        upper.id = split.new_id;
        upper.bottom = *new_bottom;
        upper.bottom_height = new_bottom_height;
        upper.parent = lower.id;
        upper.parent_hash = Some(*new_top);
        for fork in upper.forks.clone() {
            if let Some(child) = self.all.get_mut(&fork) {
                child.parent = upper.id;
            }
        }
        if was_head {
            self.heads.insert(upper.top, upper.id);
        }

        let lower_entry = self.all.get_mut(&split.old_id).ok_or_else(|| {
            SyncError::from(InvariantError::DataIntegrity("split source vanished".into()))
        })?;
        lower_entry.top = *new_top;
        lower_entry.top_height = split.above_height;
        lower_entry.forks.clear();
        lower_entry.forks.insert(split.new_id);

        if let Some(key) = in_current {
            self.current.remove(key);
            self.current.insert(split.above_height, split.old_id);
            self.current.insert(upper.top_height, upper.id);
            if self.current.top_branch() == split.old_id {
                self.current.set_top_branch(upper.id);
            }
        }
        self.all.insert(upper.id, upper);

        debug!(
            target: "index::branches",
            old = split.old_id,
            new = split.new_id,
            above = split.above_height,
            "split branch"
        );
        Ok(())
    }

    /// Applies a planned attachment of tipset `(hash, height)` whose parent
    /// is `parent_hash`, returning the head updates it caused.
    pub fn store_tipset(
        &mut self,
        hash: &TipsetHash,
        height: Height,
        parent_hash: Option<&TipsetHash>,
        pos: &StorePosition,
    ) -> SyncResult<Vec<HeadUpdate>> {
        let mut changes = Vec::new();

        let standalone =
            pos.at_bottom_of_branch == NO_BRANCH && pos.on_top_of_branch == NO_BRANCH;
        if standalone {
            self.new_branch(hash, height, parent_hash, pos.assigned_branch)?;
            if height == 0 {
                changes.push(HeadUpdate { removed: None, added: Some(*hash) });
            }
            return Ok(changes);
        }

        let parent_hash = *parent_hash.ok_or_else(|| {
            SyncError::from(InvariantError::DataIntegrity("missing parent hash".into()))
        })?;

        let mut linked_to_bottom = None;
        if pos.at_bottom_of_branch != NO_BRANCH {
            let id = pos.at_bottom_of_branch;
            let info = self.all.get_mut(&id).ok_or(NotFoundError::NoSuchBranch(id))?;
            if info.bottom_height <= height || info.parent != NO_BRANCH {
                return Err(InvariantError::LinkHeightMismatch.into());
            }
            info.bottom = *hash;
            info.bottom_height = height;
            info.parent_hash = Some(parent_hash);
            self.unloaded_roots.remove(hash);

            if pos.on_top_of_branch == NO_BRANCH {
                // still an unloaded root, now waiting one tipset deeper
                self.unloaded_roots.insert(parent_hash, id);
                return Ok(changes);
            }
            linked_to_bottom = Some(id);
        }

        let base = pos.on_top_of_branch;
        let base_is_bare_head = self.heads.get(&parent_hash) == Some(&base);

        if base_is_bare_head && pos.split.is_none() {
            match linked_to_bottom {
                None => {
                    // common case: advance the head by one tipset
                    let info = self.all.get_mut(&base).ok_or(NotFoundError::NoSuchBranch(base))?;
                    let synced = info.synced_to_genesis;
                    info.top = *hash;
                    info.top_height = height;
                    self.heads.remove(&parent_hash);
                    self.heads.insert(*hash, base);
                    if let Some(key) = self.current.entry_of(base) {
                        self.current.remove(key);
                        self.current.insert(height, base);
                    }
                    if synced {
                        changes.push(HeadUpdate {
                            removed: Some(parent_hash),
                            added: Some(*hash),
                        });
                    }
                }
                Some(successor) => {
                    // the stored tipset closed the gap between a head and an
                    // unloaded subgraph
                    changes = self.link_to_head(base, successor)?;
                }
            }
            return Ok(changes);
        }

        // fork off the top of `base` (freshly split or already forked)
        let successor = match linked_to_bottom {
            Some(id) => id,
            None => {
                self.new_branch(hash, height, Some(&parent_hash), pos.assigned_branch)?;
                pos.assigned_branch
            }
        };
        let base_info = self.branch(base)?;
        if base_info.top != parent_hash {
            return Err(InvariantError::DataIntegrity(format!(
                "tipset does not chain onto the top of branch {base}"
            ))
            .into());
        }
        let synced = base_info.synced_to_genesis;
        self.all.get_mut(&base).ok_or(NotFoundError::NoSuchBranch(base))?.forks.insert(successor);
        self.all
            .get_mut(&successor)
            .ok_or(NotFoundError::NoSuchBranch(successor))?
            .parent = base;
        self.unloaded_roots.remove(&parent_hash);
        self.update_heads(successor, synced, &mut changes)?;
        Ok(changes)
    }

    /// Splices root branch `successor` onto head branch `base`: the successor
    /// inherits the base's bottom and parent and the base is absorbed.
    pub fn link_to_head(
        &mut self,
        base: BranchId,
        successor: BranchId,
    ) -> SyncResult<Vec<HeadUpdate>> {
        let base_info = self.branch(base)?.clone();
        if self.heads.get(&base_info.top) != Some(&base) {
            return Err(PreconditionError::BranchIsNotAHead(base).into());
        }
        let succ_info = self.branch(successor)?;
        if succ_info.parent != NO_BRANCH {
            return Err(PreconditionError::BranchIsNotARoot(successor).into());
        }
        if succ_info.bottom_height <= base_info.top_height {
            return Err(InvariantError::LinkHeightMismatch.into());
        }
        if succ_info.parent_hash != Some(base_info.top) {
            return Err(InvariantError::DataIntegrity(format!(
                "branch {successor} does not chain onto the top of branch {base}"
            ))
            .into());
        }

        let mut changes = Vec::new();
        if base_info.synced_to_genesis {
            changes.push(HeadUpdate { removed: Some(base_info.top), added: None });
        }
        self.heads.remove(&base_info.top);
        self.splice_absorb(base, successor)?;
        self.update_heads(successor, base_info.synced_to_genesis, &mut changes)?;

        // a single added head replacing the absorbed one collapses into one
        // update
        if changes.len() == 2 && changes[0].added.is_none() {
            let removed = changes.remove(0).removed;
            changes[0].removed = removed;
        }
        debug!(target: "index::branches", base, successor, "linked branch to head");
        Ok(changes)
    }

    /// Attaches root branch `successor` onto `base` at `pivot_height`,
    /// splitting `base` when the pivot is below its top. The portion at and
    /// below the pivot keeps `base`'s id; the portion above gets a fresh id.
    /// Returns the split applied, if any, so the durable store can mirror it.
    pub fn link_branches(
        &mut self,
        base: BranchId,
        successor: BranchId,
        pivot_hash: &TipsetHash,
        pivot_height: Height,
        upper_bottom: Option<(&TipsetHash, Height)>,
    ) -> SyncResult<(Option<SplitBranch>, Vec<HeadUpdate>)> {
        let base_info = self.branch(base)?.clone();
        let succ_info = self.branch(successor)?;
        if succ_info.parent != NO_BRANCH {
            return Err(PreconditionError::BranchIsNotARoot(successor).into());
        }
        if pivot_height < base_info.bottom_height
            || pivot_height > base_info.top_height
            || succ_info.bottom_height <= pivot_height
        {
            return Err(InvariantError::LinkHeightMismatch.into());
        }

        if pivot_height == base_info.top_height {
            if base_info.is_head() {
                let changes = self.link_to_head(base, successor)?;
                return Ok((None, changes));
            }
            // plain additional fork at the top
            let mut changes = Vec::new();
            let synced = base_info.synced_to_genesis;
            self.all.get_mut(&base).ok_or(NotFoundError::NoSuchBranch(base))?.forks.insert(successor);
            self.all
                .get_mut(&successor)
                .ok_or(NotFoundError::NoSuchBranch(successor))?
                .parent = base;
            if let Some(hash) = self.branch(successor)?.parent_hash {
                self.unloaded_roots.remove(&hash);
            }
            self.update_heads(successor, synced, &mut changes)?;
            return Ok((None, changes));
        }

        let (upper_bottom_hash, upper_bottom_height) = upper_bottom.ok_or_else(|| {
            SyncError::from(InvariantError::DataIntegrity(
                "splitting a branch requires the tipset above the pivot".into(),
            ))
        })?;
        let split = SplitBranch {
            old_id: base,
            new_id: self.next_branch_id(),
            above_height: pivot_height,
        };
        self.split_branch(pivot_hash, upper_bottom_hash, upper_bottom_height, &split)?;

        let mut changes = Vec::new();
        let synced = self.branch(base)?.synced_to_genesis;
        self.all.get_mut(&base).ok_or(NotFoundError::NoSuchBranch(base))?.forks.insert(successor);
        self.all
            .get_mut(&successor)
            .ok_or(NotFoundError::NoSuchBranch(successor))?
            .parent = base;
        if let Some(hash) = self.branch(successor)?.parent_hash {
            self.unloaded_roots.remove(&hash);
        }
        self.update_heads(successor, synced, &mut changes)?;
        Ok((Some(split), changes))
    }

    /// Excises the head branch topped by `head`. If its parent is left with a
    /// single fork, the two are merged immediately; returns the
    /// `(absorbed parent, surviving successor)` pair of that merge, or
    /// `(NO_BRANCH, NO_BRANCH)` when no merge occurred.
    pub fn remove_head(&mut self, head: &TipsetHash) -> SyncResult<(BranchId, BranchId)> {
        let id = *self
            .heads
            .get(head)
            .ok_or(NotFoundError::TipsetNotFound(*head))?;
        if id == self.genesis {
            return Err(
                InvariantError::DataIntegrity("cannot remove the genesis branch".into()).into()
            );
        }
        let info = self.all.remove(&id).ok_or(NotFoundError::NoSuchBranch(id))?;
        self.heads.remove(head);
        if info.parent == NO_BRANCH {
            if let Some(hash) = info.parent_hash {
                self.unloaded_roots.remove(&hash);
            }
        }
        if self.current.top_branch() == id {
            self.current.clear();
        }
        debug!(target: "index::branches", branch = id, %head, "removed head");

        if info.parent == NO_BRANCH {
            return Ok((NO_BRANCH, NO_BRANCH));
        }
        let parent =
            self.all.get_mut(&info.parent).ok_or(NotFoundError::NoSuchBranch(info.parent))?;
        parent.forks.remove(&id);
        match parent.forks.len() {
            0 => {
                // the parent is a head again
                self.heads.insert(parent.top, parent.id);
                Ok((NO_BRANCH, NO_BRANCH))
            }
            1 => {
                // restore the no-single-fork invariant by merging eagerly
                let parent_id = parent.id;
                let successor = *parent.forks.iter().next().ok_or_else(|| {
                    SyncError::from(InvariantError::DataIntegrity("fork set vanished".into()))
                })?;
                self.splice_absorb(parent_id, successor)?;
                debug!(
                    target: "index::branches",
                    absorbed = parent_id,
                    successor,
                    "merged single-fork branch"
                );
                Ok((parent_id, successor))
            }
            _ => Ok((NO_BRANCH, NO_BRANCH)),
        }
    }

    /// Reconstructs the graph from persisted branch records.
    ///
    /// Validates ids, parent links and heights; any violation clears the
    /// graph and fails, surfacing what a healthy store can never contain.
    /// Returns the head updates announcing every synced head.
    pub fn load(
        &mut self,
        branches: BTreeMap<BranchId, BranchInfo>,
    ) -> SyncResult<Vec<HeadUpdate>> {
        self.clear();
        if branches.is_empty() {
            return Ok(Vec::new());
        }

        let fail = |graph: &mut Self, msg: String| -> SyncError {
            error!(target: "index::branches", "cannot load graph: {msg}");
            graph.clear();
            InvariantError::GraphLoad(msg).into()
        };

        for (&id, info) in &branches {
            if id == NO_BRANCH || id != info.id {
                return Err(fail(self, format!("inconsistent branch id {id}")));
            }
            if info.top_height < info.bottom_height {
                return Err(fail(
                    self,
                    format!(
                        "heights inconsistent ({} and {}) for id {id}",
                        info.top_height, info.bottom_height
                    ),
                ));
            }
            if info.parent != NO_BRANCH {
                if info.parent == id {
                    return Err(fail(self, format!("branch {id} is its own parent")));
                }
                let Some(parent) = branches.get(&info.parent) else {
                    return Err(fail(
                        self,
                        format!("parent {} not found for branch {id}", info.parent),
                    ));
                };
                if parent.top_height >= info.bottom_height {
                    return Err(fail(
                        self,
                        format!(
                            "parent height inconsistent ({} and {}) for id {id} and parent {}",
                            info.bottom_height, parent.top_height, info.parent
                        ),
                    ));
                }
            }
        }

        // rebuild derived state from scratch; persisted fork sets and sync
        // flags are not trusted
        self.all = branches;
        for info in self.all.values_mut() {
            info.forks.clear();
            info.synced_to_genesis = false;
        }
        let edges: Vec<(BranchId, BranchId)> =
            self.all.values().map(|info| (info.id, info.parent)).collect();
        for (id, parent) in edges {
            if parent != NO_BRANCH {
                if let Some(parent) = self.all.get_mut(&parent) {
                    parent.forks.insert(id);
                }
            } else {
                let info = &self.all[&id];
                match info.parent_hash {
                    Some(hash) => {
                        self.unloaded_roots.insert(hash, id);
                    }
                    None => {
                        if self.genesis != NO_BRANCH {
                            return Err(fail(self, format!("second genesis branch {id}")));
                        }
                        self.genesis = id;
                    }
                }
            }
        }
        if self.genesis == NO_BRANCH {
            return Err(fail(self, "no genesis branch".into()));
        }
        if let Some(single) = self.all.values().find(|info| info.forks.len() == 1) {
            // only legal transiently within a mutation, never in stored state
            return Err(fail(
                self,
                format!("branch {} has a single fork and must be merged", single.id),
            ));
        }

        let mut changes = Vec::new();
        let genesis = self.genesis;
        self.update_heads(genesis, true, &mut changes)?;
        let unsynced_heads: Vec<(TipsetHash, BranchId)> = self
            .all
            .values()
            .filter(|info| info.is_head() && !info.synced_to_genesis)
            .map(|info| (info.top, info.id))
            .collect();
        for (hash, id) in unsynced_heads {
            self.heads.insert(hash, id);
        }
        self.next_id = self.all.keys().next_back().map_or(GENESIS_BRANCH, |&id| id) + 1;
        Ok(changes)
    }

    fn new_branch(
        &mut self,
        hash: &TipsetHash,
        height: Height,
        parent_hash: Option<&TipsetHash>,
        id: BranchId,
    ) -> SyncResult<()> {
        if id == NO_BRANCH || self.all.contains_key(&id) {
            return Err(
                InvariantError::DataIntegrity(format!("branch id {id} is not fresh")).into()
            );
        }
        let mut info = BranchInfo::new(id, *hash, height);
        info.parent_hash = parent_hash.copied();
        match parent_hash {
            None => {
                if height != 0 || !self.is_empty() || id != GENESIS_BRANCH {
                    return Err(InvariantError::DataIntegrity(
                        "only genesis may start a parentless branch".into(),
                    )
                    .into());
                }
                info.synced_to_genesis = true;
                self.genesis = id;
            }
            Some(parent) => {
                self.unloaded_roots.insert(*parent, id);
            }
        }
        self.heads.insert(*hash, id);
        self.all.insert(id, info);
        Ok(())
    }

    /// Removes `absorbed`, letting `successor` take over its span: bottom,
    /// parent link and position in the forest.
    fn splice_absorb(&mut self, absorbed: BranchId, successor: BranchId) -> SyncResult<()> {
        let absorbed_info =
            self.all.remove(&absorbed).ok_or(NotFoundError::NoSuchBranch(absorbed))?;
        if self.genesis == absorbed {
            self.genesis = successor;
        }
        if absorbed_info.parent == NO_BRANCH {
            if let Some(hash) = absorbed_info.parent_hash {
                self.unloaded_roots.insert(hash, successor);
            }
        } else if let Some(grandparent) = self.all.get_mut(&absorbed_info.parent) {
            grandparent.forks.remove(&absorbed);
            grandparent.forks.insert(successor);
        }
        if let Some(key) = self.current.entry_of(absorbed) {
            self.current.remove(key);
            if self.current.top_branch() == absorbed {
                self.current.set_top_branch(successor);
                if let Some(succ) = self.all.get(&successor) {
                    self.current.insert(succ.top_height, successor);
                }
            }
        }
        let succ =
            self.all.get_mut(&successor).ok_or(NotFoundError::NoSuchBranch(successor))?;
        succ.bottom = absorbed_info.bottom;
        succ.bottom_height = absorbed_info.bottom_height;
        succ.parent = absorbed_info.parent;
        succ.parent_hash = absorbed_info.parent_hash;
        Ok(())
    }

    /// Floods `synced` down the subtree rooted at `id`, registering heads and
    /// collecting head updates for synced ones.
    fn update_heads(
        &mut self,
        id: BranchId,
        synced: bool,
        changes: &mut Vec<HeadUpdate>,
    ) -> SyncResult<()> {
        let info = self.all.get_mut(&id).ok_or(NotFoundError::NoSuchBranch(id))?;
        info.synced_to_genesis = synced;
        let top = info.top;
        let forks: Vec<BranchId> = info.forks.iter().copied().collect();
        if forks.is_empty() {
            self.heads.insert(top, id);
            if synced {
                changes.push(HeadUpdate { removed: None, added: Some(top) });
            }
        } else {
            for fork in forks {
                self.update_heads(fork, synced, changes)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn h(n: u64) -> TipsetHash {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&n.to_be_bytes());
        TipsetHash::new(bytes)
    }

    /// Drives the graph the way `ChainDb` does, tracking each tipset's branch
    /// assignment the way the index store would.
    #[derive(Default)]
    struct Harness {
        graph: BranchGraph,
        tipsets: HashMap<TipsetHash, (Height, Option<TipsetHash>, BranchId)>,
    }

    impl Harness {
        fn new() -> Self {
            let mut harness = Self { graph: BranchGraph::new(), ..Default::default() };
            harness.store(h(0), 0, None);
            harness
        }

        fn tipset_at(&self, branch: BranchId, height: Height) -> TipsetHash {
            *self
                .tipsets
                .iter()
                .find(|(_, &(ht, _, b))| b == branch && ht == height)
                .map(|(hash, _)| hash)
                .expect("tipset exists at position")
        }

        fn store(
            &mut self,
            hash: TipsetHash,
            height: Height,
            parent: Option<TipsetHash>,
        ) -> Vec<HeadUpdate> {
            let (parent_branch, parent_height) = parent
                .and_then(|p| self.tipsets.get(&p).map(|&(ht, _, b)| (b, ht)))
                .unwrap_or((NO_BRANCH, 0));
            let pos = self
                .graph
                .find_store_position(&hash, height, parent_branch, parent_height)
                .unwrap();
            let base_was_bare_head = parent
                .map(|p| self.graph.heads().contains(&(p, pos.on_top_of_branch)))
                .unwrap_or(false);
            if let Some(split) = pos.split {
                let new_bottom = self.tipset_at(split.old_id, split.above_height + 1);
                let (bh, _, _) = self.tipsets[&new_bottom];
                let pivot = parent.unwrap();
                self.graph.split_branch(&pivot, &new_bottom, bh, &split).unwrap();
                // mirror the row reassignment the store performs
                for entry in self.tipsets.values_mut() {
                    if entry.2 == split.old_id && entry.0 > split.above_height {
                        entry.2 = split.new_id;
                    }
                }
            }
            let changes =
                self.graph.store_tipset(&hash, height, parent.as_ref(), &pos).unwrap();
            if pos.at_bottom_of_branch != NO_BRANCH
                && pos.on_top_of_branch != NO_BRANCH
                && pos.split.is_none()
                && base_was_bare_head
            {
                // merge-by-absorption renames the base branch's rows
                for entry in self.tipsets.values_mut() {
                    if entry.2 == pos.on_top_of_branch {
                        entry.2 = pos.at_bottom_of_branch;
                    }
                }
            }
            self.tipsets.insert(hash, (height, parent, pos.assigned_branch));
            changes
        }

        fn store_linear(&mut self, from: u64, to: u64) {
            for n in from..=to {
                let parent = if n == 1 { h(0) } else { h(n - 1) };
                self.store(h(n), n, Some(parent));
            }
        }

        fn remove_head(&mut self, hash: TipsetHash) -> (BranchId, BranchId) {
            let removed_branch = self
                .graph
                .heads()
                .into_iter()
                .find(|&(top, _)| top == hash)
                .map(|(_, id)| id)
                .expect("head exists");
            let (absorbed, successor) = self.graph.remove_head(&hash).unwrap();
            self.tipsets.retain(|_, &mut (_, _, b)| b != removed_branch);
            if absorbed != NO_BRANCH {
                for entry in self.tipsets.values_mut() {
                    if entry.2 == absorbed {
                        entry.2 = successor;
                    }
                }
            }
            (absorbed, successor)
        }
    }

    #[test]
    fn linear_extension_stays_one_branch() {
        let mut hx = Harness::new();
        hx.store_linear(1, 5);

        assert_eq!(hx.graph.heads(), vec![(h(5), GENESIS_BRANCH)]);
        assert_eq!(hx.graph.roots(), vec![GENESIS_BRANCH]);

        hx.graph.switch_to_head(GENESIS_BRANCH, 5).unwrap();
        for height in 0..=5 {
            assert_eq!(hx.graph.find_by_height(height).unwrap(), GENESIS_BRANCH);
        }
        assert!(hx.graph.find_by_height(6).is_err());
    }

    #[test]
    fn fork_at_head_splits_parent_branch() {
        let mut hx = Harness::new();
        hx.store_linear(1, 3);
        // competing tipset at height 3 with the height-2 tipset as parent
        hx.store(h(103), 3, Some(h(2)));

        let lower = hx.graph.branch(GENESIS_BRANCH).unwrap();
        assert_eq!(lower.top_height, 2);
        assert_eq!(lower.forks.len(), 2);

        let mut heads = hx.graph.heads();
        heads.sort_unstable_by_key(|(hash, _)| *hash);
        let head_hashes: Vec<TipsetHash> = heads.iter().map(|(hash, _)| *hash).collect();
        let mut expected = vec![h(3), h(103)];
        expected.sort_unstable();
        assert_eq!(head_hashes, expected);

        for (_, id) in heads {
            let info = hx.graph.branch(id).unwrap();
            assert_eq!(info.parent, GENESIS_BRANCH);
            assert_eq!(info.bottom_height, 3);
            assert!(info.synced_to_genesis);
        }
    }

    #[test]
    fn mid_branch_store_splits_at_pivot() {
        let mut hx = Harness::new();
        hx.store_linear(1, 5);
        // new tipset at height 3 chaining onto the height-2 tipset
        let changes = hx.store(h(203), 3, Some(h(2)));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].added, Some(h(203)));

        let lower = hx.graph.branch(GENESIS_BRANCH).unwrap().clone();
        assert_eq!((lower.bottom_height, lower.top_height), (0, 2));
        assert_eq!(lower.forks.len(), 2);

        let upper_id = *lower.forks.iter().find(|&&id| {
            hx.graph.branch(id).map(|b| b.top == h(5)).unwrap_or(false)
        }).unwrap();
        let upper = hx.graph.branch(upper_id).unwrap();
        assert_eq!((upper.bottom_height, upper.top_height), (3, 5));
        assert_eq!(upper.bottom, h(3));
        assert_eq!(upper.parent, GENESIS_BRANCH);

        // both tips are heads now
        let head_hashes: Vec<TipsetHash> =
            hx.graph.heads().into_iter().map(|(hash, _)| hash).collect();
        assert!(head_hashes.contains(&h(5)));
        assert!(head_hashes.contains(&h(203)));
    }

    #[test]
    fn remove_head_merges_single_fork_parent() {
        let mut hx = Harness::new();
        hx.store_linear(1, 3);
        hx.store(h(103), 3, Some(h(2)));

        let (_, a_prime_branch) =
            hx.graph.heads().into_iter().find(|&(hash, _)| hash == h(103)).unwrap();

        let (absorbed, successor) = hx.remove_head(h(103));
        assert_eq!(absorbed, GENESIS_BRANCH);
        assert_ne!(successor, NO_BRANCH);
        assert_ne!(successor, a_prime_branch);

        // a single linear branch from genesis to the surviving tip remains
        assert_eq!(hx.graph.heads(), vec![(h(3), successor)]);
        let merged = hx.graph.branch(successor).unwrap();
        assert_eq!((merged.bottom_height, merged.top_height), (0, 3));
        assert_eq!(merged.bottom, h(0));
        assert!(merged.is_root());
        assert_eq!(hx.graph.genesis_branch(), successor);
        assert_eq!(hx.graph.roots(), vec![successor]);
    }

    #[test]
    fn remove_head_without_merge_reports_no_branch() {
        let mut hx = Harness::new();
        hx.store_linear(1, 2);
        hx.store(h(102), 2, Some(h(1)));
        hx.store(h(202), 2, Some(h(1)));

        // three forks; removing one leaves two, no merge
        let (absorbed, successor) = hx.remove_head(h(202));
        assert_eq!((absorbed, successor), (NO_BRANCH, NO_BRANCH));
        assert_eq!(hx.graph.heads().len(), 2);
    }

    #[test]
    fn unloaded_root_extends_down_and_links_to_genesis() {
        let mut hx = Harness::new();
        // far tipset arrives first: becomes an unloaded root
        hx.store(h(10), 10, Some(h(9)));
        let roots = hx.graph.roots();
        assert_eq!(roots.len(), 2);
        let far_root = *roots.iter().find(|&&id| id != GENESIS_BRANCH).unwrap();
        assert!(!hx.graph.branch(far_root).unwrap().synced_to_genesis);

        // backward walk fills 9..=2
        for n in (2..=9).rev() {
            let changes = hx.store(h(n), n, Some(h(n - 1)));
            assert!(changes.is_empty());
            assert_eq!(hx.graph.root_of(far_root).unwrap().id, far_root);
        }

        // height 1 chains onto genesis: the whole subgraph becomes synced
        let changes = hx.store(h(1), 1, Some(h(0)));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].removed, Some(h(0)));
        assert_eq!(changes[0].added, Some(h(10)));

        assert_eq!(hx.graph.heads(), vec![(h(10), far_root)]);
        let merged = hx.graph.branch(far_root).unwrap();
        assert_eq!((merged.bottom_height, merged.top_height), (0, 10));
        assert!(merged.synced_to_genesis);
        assert_eq!(hx.graph.genesis_branch(), far_root);
    }

    #[test]
    fn load_dump_round_trips() {
        let mut hx = Harness::new();
        hx.store_linear(1, 5);
        hx.store(h(203), 3, Some(h(2)));
        hx.store(h(30), 30, Some(h(29)));

        let dump = hx.graph.dump();
        let mut reloaded = BranchGraph::new();
        reloaded.load(dump.clone()).unwrap();
        assert_eq!(reloaded.dump(), dump);

        let mut original_heads = hx.graph.heads();
        let mut reloaded_heads = reloaded.heads();
        original_heads.sort_unstable();
        reloaded_heads.sort_unstable();
        assert_eq!(original_heads, reloaded_heads);
        assert_eq!(hx.graph.roots(), reloaded.roots());
        assert_eq!(hx.graph.genesis_branch(), reloaded.genesis_branch());
    }

    #[test]
    fn load_rejects_corrupt_graphs() {
        let genesis = BranchInfo::new(GENESIS_BRANCH, h(0), 0);

        // dangling parent
        let mut dangling = BranchInfo::new(7, h(5), 5);
        dangling.parent = 99;
        dangling.parent_hash = Some(h(4));
        let mut graph = BranchGraph::new();
        let input =
            BTreeMap::from([(GENESIS_BRANCH, genesis.clone()), (7, dangling)]);
        assert!(matches!(
            graph.load(input),
            Err(SyncError::Invariant(InvariantError::GraphLoad(_)))
        ));
        assert!(graph.is_empty());

        // self-parenting
        let mut own = BranchInfo::new(7, h(5), 5);
        own.parent = 7;
        own.parent_hash = Some(h(4));
        let input = BTreeMap::from([(GENESIS_BRANCH, genesis.clone()), (7, own)]);
        assert!(graph.load(input).is_err());

        // inverted heights
        let mut inverted = BranchInfo::new(7, h(5), 5);
        inverted.bottom_height = 9;
        inverted.parent_hash = Some(h(4));
        let input = BTreeMap::from([(GENESIS_BRANCH, genesis.clone()), (7, inverted)]);
        assert!(graph.load(input).is_err());

        // id mismatch between key and record
        let input = BTreeMap::from([(3, genesis.clone())]);
        assert!(graph.load(input).is_err());

        // no genesis branch at all
        let mut lone = BranchInfo::new(7, h(5), 5);
        lone.parent_hash = Some(h(4));
        let input = BTreeMap::from([(7, lone)]);
        assert!(graph.load(input).is_err());

        // a single-fork branch is an intermediate state and must not persist
        let mut child = BranchInfo::new(2, h(3), 3);
        child.parent = GENESIS_BRANCH;
        child.parent_hash = Some(h(0));
        let input = BTreeMap::from([(GENESIS_BRANCH, genesis), (2, child)]);
        assert!(graph.load(input).is_err());
    }

    #[test]
    fn switch_to_head_requires_a_synced_head() {
        let mut hx = Harness::new();
        hx.store_linear(1, 3);
        hx.store(h(30), 30, Some(h(29)));
        let far_root = *hx.graph.roots().iter().find(|&&id| id != GENESIS_BRANCH).unwrap();

        assert!(matches!(
            hx.graph.switch_to_head(far_root, 30),
            Err(SyncError::Invariant(InvariantError::DataIntegrity(_)))
        ));
        assert!(hx.graph.switch_to_head(GENESIS_BRANCH, 9).is_err());
        hx.graph.switch_to_head(GENESIS_BRANCH, 3).unwrap();
        assert_eq!(hx.graph.find_by_height(2).unwrap(), GENESIS_BRANCH);
    }

    #[test]
    fn projection_follows_mid_branch_split() {
        let mut hx = Harness::new();
        hx.store_linear(1, 5);
        hx.graph.switch_to_head(GENESIS_BRANCH, 5).unwrap();

        hx.store(h(203), 3, Some(h(2)));

        // the projected chain survives the split with correct coverage
        let lower = hx.graph.find_by_height(1).unwrap();
        let upper = hx.graph.find_by_height(4).unwrap();
        assert_eq!(lower, GENESIS_BRANCH);
        assert_ne!(upper, GENESIS_BRANCH);
        assert_eq!(hx.graph.find_by_height(5).unwrap(), upper);
    }

    fn check_invariants(graph: &BranchGraph) {
        let dump = graph.dump();
        for (&id, info) in &dump {
            assert!(info.bottom_height <= info.top_height, "branch {id} heights inverted");
            assert_ne!(info.forks.len(), 1, "branch {id} kept a single fork");
            if info.parent != NO_BRANCH {
                let parent = dump.get(&info.parent).expect("parent branch exists");
                assert!(
                    parent.top_height < info.bottom_height,
                    "branch {id} bottom does not clear its parent's top"
                );
                assert!(parent.forks.contains(&id), "parent of {id} lost the fork edge");
            }
            for fork in &info.forks {
                let child = dump.get(fork).expect("fork branch exists");
                assert_eq!(child.parent, id, "fork {fork} does not point back to {id}");
            }
            graph.root_of(id).expect("every branch reaches a root");
        }
        let mut expected_heads: Vec<(TipsetHash, BranchId)> =
            dump.values().filter(|b| b.is_head()).map(|b| (b.top, b.id)).collect();
        let mut heads = graph.heads();
        expected_heads.sort_unstable();
        heads.sort_unstable();
        assert_eq!(heads, expected_heads, "cached head set diverged");
        if !dump.is_empty() {
            assert!(dump.contains_key(&graph.genesis_branch()), "genesis branch missing");
        }
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(64))]
        #[test]
        fn random_store_remove_sequences_preserve_invariants(
            ops in proptest::collection::vec((0u8..3u8, proptest::prelude::any::<u16>()), 1..48)
        ) {
            let mut hx = Harness::new();
            let mut counter: u64 = 0;
            for (kind, seed) in ops {
                let seed = seed as usize;
                match kind {
                    0 => {
                        // extend a random stored tipset by one height
                        let mut stored: Vec<(TipsetHash, Height)> =
                            hx.tipsets.iter().map(|(&hash, &(ht, _, _))| (hash, ht)).collect();
                        stored.sort_unstable();
                        let (parent, height) = stored[seed % stored.len()];
                        counter += 1;
                        hx.store(h(1_000 + counter), height + 1, Some(parent));
                    }
                    1 => {
                        // orphan tipset with an unknown parent
                        counter += 1;
                        let height = (seed % 50) as Height + 2;
                        hx.store(h(1_000 + counter), height, Some(h(500_000 + counter)));
                    }
                    _ => {
                        let genesis = hx.graph.genesis_branch();
                        let mut heads: Vec<(TipsetHash, BranchId)> = hx
                            .graph
                            .heads()
                            .into_iter()
                            .filter(|&(_, id)| id != genesis)
                            .collect();
                        heads.sort_unstable();
                        if !heads.is_empty() {
                            let (hash, _) = heads[seed % heads.len()];
                            hx.remove_head(hash);
                        }
                    }
                }
                check_invariants(&hx.graph);
            }

            // a dump of any reachable state loads back identically
            let dump = hx.graph.dump();
            let mut reloaded = BranchGraph::new();
            reloaded.load(dump.clone()).unwrap();
            proptest::prop_assert_eq!(reloaded.dump(), dump);
        }
    }

    #[test]
    fn ids_are_never_reused() {
        let mut hx = Harness::new();
        hx.store_linear(1, 2);
        hx.store(h(102), 2, Some(h(1)));
        let before: Vec<BranchId> = hx.graph.dump().keys().copied().collect();
        hx.remove_head(h(102));
        hx.store(h(202), 2, Some(h(1)));
        let after: Vec<BranchId> = hx.graph.dump().keys().copied().collect();
        for id in after {
            if !before.contains(&id) {
                assert!(id > *before.iter().max().unwrap());
            }
        }
    }
}
