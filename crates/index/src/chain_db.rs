//! Facade joining the branch graph, the index store and the blockstore.
//!
//! `ChainDb` is the sole writer to both: every graph mutation is paired with
//! one index transaction, and the graph is only touched after the store
//! commits, so a persistence failure leaves the in-memory state untouched.

use crate::{
    branches::{BranchGraph, StorePosition},
    store::{IndexStore, TipsetInfo},
};
use cedar_interfaces::{
    Blockstore, InvariantError, NotFoundError, StoreError, SyncError, SyncResult, ValidationError,
};
use cedar_primitives::{
    BlockHeader, BranchId, BranchInfo, HeadChange, HeadChangeKind, Height, SyncState, Tipset,
    TipsetHash, TipsetKey, NO_BRANCH,
};
use cid::Cid;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::broadcast;
use tracing::{debug, info};

const TIPSET_CACHE_LIMIT: usize = 1000;
const HEAD_CHANGE_CHANNEL_SIZE: usize = 256;

/// Result of [`ChainDb::store_tipset`].
#[derive(Clone, Debug)]
pub struct StoreOutcome {
    /// Branch the tipset belongs to.
    pub branch: BranchId,
    /// Whether the call advanced any state (false for a pure no-op repeat).
    pub progressed: bool,
    /// Deepest stored tipset on the path from the stored one whose parent is
    /// absent; `None` when the chain is linked all the way to genesis.
    pub unsynced_bottom: Option<Arc<Tipset>>,
}

/// The chain database the rest of the node depends on.
pub struct ChainDb<B> {
    ipld: B,
    index: IndexStore,
    graph: BranchGraph,
    genesis: Arc<Tipset>,
    cache: Mutex<HashMap<TipsetHash, Arc<Tipset>>>,
    head_changes: broadcast::Sender<HeadChange>,
    current_head: Option<(TipsetHash, Height)>,
}

impl<B: Blockstore> ChainDb<B> {
    /// Opens the database against a genesis CID.
    ///
    /// An empty index is bootstrapped with the genesis tipset (which must be
    /// present in the blockstore); a non-empty one is validated against the
    /// expected genesis and the branch graph is reconstructed from it.
    pub fn open(ipld: B, mut index: IndexStore, genesis_cid: &Cid) -> SyncResult<Self> {
        let branches = index.load_branches()?;
        let (tx, _) = broadcast::channel(HEAD_CHANGE_CHANNEL_SIZE);
        if branches.is_empty() {
            let header =
                read_header(&ipld, genesis_cid)?.ok_or(NotFoundError::NoGenesisBlock)?;
            if header.height != 0 {
                return Err(InvariantError::DataIntegrity(
                    "genesis block must be at height zero".into(),
                )
                .into());
            }
            let genesis = Arc::new(Tipset::new(vec![header])?);
            let mut graph = BranchGraph::new();
            let hash = genesis.key().hash();
            let pos = graph.find_store_position(&hash, 0, NO_BRANCH, 0)?;

            index.begin_tx()?;
            let persisted = (|| {
                index.put_tipset(
                    &TipsetInfo {
                        key: genesis.key().clone(),
                        branch: pos.assigned_branch,
                        height: 0,
                        weight: genesis.weight(),
                        sync_state: SyncState::Complete,
                        parent_hash: None,
                    },
                    &genesis,
                )?;
                index.put_branch(&BranchInfo::new(pos.assigned_branch, hash, 0))
            })();
            if let Err(err) = persisted {
                index.rollback_tx()?;
                return Err(err);
            }
            index.commit_tx()?;
            graph.store_tipset(&hash, 0, None, &pos)?;
            info!(target: "index::chain_db", genesis = %hash, "bootstrapped new chain database");
            return Ok(Self {
                ipld,
                index,
                graph,
                genesis,
                cache: Default::default(),
                head_changes: tx,
                current_head: None,
            });
        }

        let mut graph = BranchGraph::new();
        graph.load(branches)?;
        let genesis_info = graph.branch(graph.genesis_branch())?;
        let stored = index.get(&genesis_info.bottom)?;
        if stored.key.cids().first() != Some(genesis_cid) {
            return Err(InvariantError::GenesisMismatch.into());
        }
        let header =
            read_header(&ipld, genesis_cid)?.ok_or(NotFoundError::NoGenesisBlock)?;
        let genesis = Arc::new(Tipset::new(vec![header])?);
        debug!(
            target: "index::chain_db",
            branches = graph.dump().len(),
            "loaded chain database"
        );
        Ok(Self {
            ipld,
            index,
            graph,
            genesis,
            cache: Default::default(),
            head_changes: tx,
            current_head: None,
        })
    }

    /// The genesis tipset.
    pub fn genesis(&self) -> &Arc<Tipset> {
        &self.genesis
    }

    /// CID of the genesis block.
    pub fn genesis_cid(&self) -> &Cid {
        &self.genesis.key().cids()[0]
    }

    /// Read access to the branch graph.
    pub fn graph(&self) -> &BranchGraph {
        &self.graph
    }

    /// Whether a tipset with this hash is stored and indexed.
    pub fn tipset_is_stored(&self, hash: &TipsetHash) -> SyncResult<bool> {
        self.index.contains(hash)
    }

    /// Loads a stored tipset by hash.
    pub fn get_tipset_by_hash(&self, hash: &TipsetHash) -> SyncResult<Arc<Tipset>> {
        if *hash == self.genesis.key().hash() {
            return Ok(self.genesis.clone());
        }
        if let Some(tipset) = self.cache.lock().get(hash) {
            return Ok(tipset.clone());
        }
        let info = self.index.get(hash)?;
        let tipset = self.materialize(&info.key)?;
        self.cache_insert(&tipset);
        Ok(tipset)
    }

    /// Loads a stored tipset by key.
    pub fn get_tipset_by_key(&self, key: &TipsetKey) -> SyncResult<Arc<Tipset>> {
        self.get_tipset_by_hash(&key.hash())
    }

    /// Loads a tipset straight from the blockstore, stored or not.
    pub fn load_tipset(&self, key: &TipsetKey) -> SyncResult<Arc<Tipset>> {
        if key.hash() == self.genesis.key().hash() {
            return Ok(self.genesis.clone());
        }
        self.materialize(key)
    }

    /// Tipset at `height` on the projected chain.
    pub fn get_tipset_by_height(&self, height: Height) -> SyncResult<Arc<Tipset>> {
        let branch = self.graph.find_by_height(height)?;
        let info = self.index.get_by_position(branch, height)?;
        self.get_tipset_by_hash(&info.key.hash())
    }

    /// Stores a tipset, attaching it to the branch forest.
    ///
    /// Idempotent: storing a known tipset only advances its sync state. All
    /// persistence happens in one index transaction; the graph is mutated
    /// after the commit succeeds.
    pub fn store_tipset(
        &mut self,
        tipset: &Tipset,
        parent: &TipsetKey,
        state: SyncState,
    ) -> SyncResult<StoreOutcome> {
        if parent != tipset.parents() {
            return Err(ValidationError::BadBlocks(
                "parent key does not match the tipset's blocks".into(),
            )
            .into());
        }
        let hash = tipset.key().hash();
        let height = tipset.height();

        if self.index.contains(&hash)? {
            let info = self.index.get(&hash)?;
            self.index.begin_tx()?;
            let advanced = match self.index.update_tipset_sync_state(&hash, state) {
                Ok(next) => next,
                Err(err) => {
                    self.index.rollback_tx()?;
                    return Err(err);
                }
            };
            self.index.commit_tx()?;
            return Ok(StoreOutcome {
                branch: info.branch,
                progressed: advanced != info.sync_state,
                unsynced_bottom: self.unsynced_bottom_of(info.branch)?,
            });
        }

        if height == 0 {
            return Err(ValidationError::BadBlocks("genesis cannot be re-stored".into()).into());
        }
        if height == 1 && parent.hash() != self.genesis.key().hash() {
            return Err(ValidationError::BadBlocks(
                "height-1 tipset does not extend genesis".into(),
            )
            .into());
        }

        let parent_hash = parent.hash();
        let (parent_branch, parent_height) = if self.index.contains(&parent_hash)? {
            let info = self.index.get(&parent_hash)?;
            (info.branch, info.height)
        } else {
            (NO_BRANCH, 0)
        };

        let pos =
            self.graph.find_store_position(&hash, height, parent_branch, parent_height)?;

        // everything the persistence step needs, read before any mutation
        let split_rows = match &pos.split {
            Some(split) => {
                let old = self.graph.branch(split.old_id)?.clone();
                let new_bottom =
                    self.index.get_first_above(split.old_id, split.above_height)?;
                Some((old, new_bottom))
            }
            None => None,
        };
        let base_is_bare_head = parent_branch != NO_BRANCH
            && self.graph.head_of(&parent_hash) == Some(pos.on_top_of_branch);
        let merges = pos.at_bottom_of_branch != NO_BRANCH
            && pos.on_top_of_branch != NO_BRANCH
            && pos.split.is_none()
            && base_is_bare_head;

        // headers go to the content-addressed store first; writes there are
        // idempotent and orphans are harmless
        for (cid, block) in tipset.key().cids().iter().zip(tipset.blocks()) {
            let bytes = fvm_ipld_encoding::to_vec(block)
                .map_err(|e| InvariantError::DataIntegrity(format!("unencodable header: {e}")))?;
            self.ipld.put_keyed(cid, &bytes).map_err(StoreError::blockstore)?;
        }

        self.index.begin_tx()?;
        let persisted = self.persist_attachment(
            tipset,
            &hash,
            &parent_hash,
            state,
            &pos,
            split_rows.as_ref(),
            merges,
        );
        if let Err(err) = persisted {
            self.index.rollback_tx()?;
            return Err(err);
        }
        self.index.commit_tx()?;

        // the plan was validated against this exact state, so the graph
        // mutation cannot fail short of a bug; surface it if it does
        if let Some((_, new_bottom)) = &split_rows {
            let split = pos.split.as_ref().ok_or_else(|| {
                SyncError::from(InvariantError::DataIntegrity("split plan vanished".into()))
            })?;
            self.graph.split_branch(
                &parent_hash,
                &new_bottom.key.hash(),
                new_bottom.height,
                split,
            )?;
        }
        self.graph.store_tipset(&hash, height, Some(&parent_hash), &pos)?;
        self.cache_insert(&Arc::new(tipset.clone()));

        debug!(target: "index::chain_db", %hash, height, branch = pos.assigned_branch, "stored tipset");
        Ok(StoreOutcome {
            branch: pos.assigned_branch,
            progressed: true,
            unsynced_bottom: self.unsynced_bottom_of(pos.assigned_branch)?,
        })
    }

    /// Mirrors one attachment into the index store; runs inside the write
    /// transaction.
    #[allow(clippy::too_many_arguments)]
    fn persist_attachment(
        &mut self,
        tipset: &Tipset,
        hash: &TipsetHash,
        parent_hash: &TipsetHash,
        state: SyncState,
        pos: &StorePosition,
        split_rows: Option<&(BranchInfo, TipsetInfo)>,
        merges: bool,
    ) -> SyncResult<()> {
        let height = tipset.height();
        if let (Some(split), Some((old, new_bottom))) = (&pos.split, split_rows) {
            self.index.split_branch(split.old_id, split.above_height, split.new_id)?;
            let mut lower = old.clone();
            lower.top = *parent_hash;
            lower.top_height = split.above_height;
            self.index.put_branch(&lower)?;
            let mut upper = old.clone();
            upper.id = split.new_id;
            upper.bottom = new_bottom.key.hash();
            upper.bottom_height = new_bottom.height;
            upper.parent = split.old_id;
            self.index.put_branch(&upper)?;
        }

        self.index.put_tipset(
            &TipsetInfo {
                key: tipset.key().clone(),
                branch: pos.assigned_branch,
                height,
                weight: tipset.weight(),
                sync_state: state,
                parent_hash: Some(*parent_hash),
            },
            tipset,
        )?;

        let standalone =
            pos.at_bottom_of_branch == NO_BRANCH && pos.on_top_of_branch == NO_BRANCH;
        if standalone {
            self.index.put_branch(&BranchInfo::new(pos.assigned_branch, *hash, height))?;
        } else if merges {
            // the stored tipset closes the gap: the base head branch is
            // absorbed by the successor root
            let base = self.graph.branch(pos.on_top_of_branch)?;
            let succ = self.graph.branch(pos.at_bottom_of_branch)?;
            self.index.merge_branch_to_head(base.id, succ.id)?;
            let mut merged = succ.clone();
            merged.bottom = base.bottom;
            merged.bottom_height = base.bottom_height;
            merged.parent = base.parent;
            self.index.put_branch(&merged)?;
        } else if pos.at_bottom_of_branch != NO_BRANCH && pos.on_top_of_branch == NO_BRANCH {
            // unloaded root grows one tipset deeper
            let mut root = self.graph.branch(pos.at_bottom_of_branch)?.clone();
            root.bottom = *hash;
            root.bottom_height = height;
            self.index.put_branch(&root)?;
        } else if pos.at_bottom_of_branch == NO_BRANCH
            && pos.assigned_branch == pos.on_top_of_branch
            && pos.split.is_none()
        {
            // plain append to a head branch
            let mut base = self.graph.branch(pos.on_top_of_branch)?.clone();
            base.top = *hash;
            base.top_height = height;
            self.index.put_branch(&base)?;
        } else if pos.at_bottom_of_branch != NO_BRANCH {
            // existing root forks off the (possibly just split) base top
            let mut succ = self.graph.branch(pos.at_bottom_of_branch)?.clone();
            succ.bottom = *hash;
            succ.bottom_height = height;
            succ.parent = pos.on_top_of_branch;
            self.index.put_branch(&succ)?;
        } else {
            // fresh single-tipset fork
            let mut fork = BranchInfo::new(pos.assigned_branch, *hash, height);
            fork.parent = pos.on_top_of_branch;
            self.index.put_branch(&fork)?;
        }
        Ok(())
    }

    /// Selects the projected chain used by forward walks. No notification is
    /// emitted; announce the head with [`Self::publish_head`] once it is
    /// confirmed.
    pub fn set_current_head(&mut self, hash: &TipsetHash) -> SyncResult<()> {
        let info = self.index.get(hash)?;
        self.graph.switch_to_head(info.branch, info.height)?;
        Ok(())
    }

    /// Announces a confirmed head to subscribers: a `Revert` for the
    /// previously published head when it is no longer canonical, then an
    /// `Apply` for the new one.
    pub fn publish_head(&mut self, hash: &TipsetHash) -> SyncResult<()> {
        let info = self.index.get(hash)?;
        let previous = self.current_head.replace((*hash, info.height));
        let tipset = self.get_tipset_by_hash(hash)?;

        if let Some((old_hash, old_height)) = previous {
            if old_hash != *hash {
                let still_canonical = self
                    .index
                    .get(&old_hash)
                    .ok()
                    .and_then(|old| {
                        self.graph.find_by_height(old_height).ok().map(|b| b == old.branch)
                    })
                    .unwrap_or(false);
                if !still_canonical {
                    if let Ok(reverted) = self.get_tipset_by_hash(&old_hash) {
                        let _ = self.head_changes.send(HeadChange {
                            kind: HeadChangeKind::Revert,
                            tipset: reverted,
                        });
                    }
                }
            }
        }
        let _ = self
            .head_changes
            .send(HeadChange { kind: HeadChangeKind::Apply, tipset });
        Ok(())
    }

    /// Borrow of the underlying content-addressed blockstore.
    pub fn blockstore(&self) -> &B {
        &self.ipld
    }

    /// Subscribes to head changes; the returned snapshot carries the current
    /// head.
    pub fn subscribe_head_changes(
        &self,
    ) -> SyncResult<(HeadChange, broadcast::Receiver<HeadChange>)> {
        let tipset = match &self.current_head {
            Some((hash, _)) => self.get_tipset_by_hash(hash)?,
            None => self.heaviest_tipset().unwrap_or_else(|_| self.genesis.clone()),
        };
        let receiver = self.head_changes.subscribe();
        Ok((HeadChange { kind: HeadChangeKind::Current, tipset }, receiver))
    }

    /// Heaviest tipset among the synced heads.
    pub fn heaviest_tipset(&self) -> SyncResult<Arc<Tipset>> {
        let mut best: Option<Arc<Tipset>> = None;
        for (hash, id) in self.graph.heads() {
            if !self.graph.branch(id)?.synced_to_genesis {
                continue;
            }
            let tipset = self.get_tipset_by_hash(&hash)?;
            let heavier =
                best.as_ref().map(|b| tipset.weight() > b.weight()).unwrap_or(true);
            if heavier {
                best = Some(tipset);
            }
        }
        best.ok_or_else(|| NotFoundError::NoHeaviestTipset.into())
    }

    /// Yields tipsets of heights `[from, to]` along the projected chain;
    /// `cb` returning `false` stops the walk.
    pub fn walk_forward(
        &self,
        from: Height,
        to: Height,
        mut cb: impl FnMut(Arc<Tipset>) -> bool,
    ) -> SyncResult<()> {
        let mut from = from;
        while from <= to {
            let branch = self.graph.find_by_height_or_none(from)?;
            if branch == NO_BRANCH {
                break;
            }
            let mut last = None;
            let mut stopped = false;
            self.index.walk_forward(branch, from, to, |info| {
                last = Some(info.height);
                let tipset = self.get_tipset_by_hash(&info.key.hash())?;
                stopped = !cb(tipset);
                Ok(!stopped)
            })?;
            match last {
                Some(height) if !stopped => from = height + 1,
                _ => break,
            }
        }
        Ok(())
    }

    /// Follows parent links from `from` down to `until`; `cb` returning
    /// `false` stops the walk.
    pub fn walk_backward(
        &self,
        from: &TipsetHash,
        until: Height,
        mut cb: impl FnMut(Arc<Tipset>) -> bool,
    ) -> SyncResult<()> {
        let mut hash = *from;
        loop {
            let tipset = self.get_tipset_by_hash(&hash)?;
            let height = tipset.height();
            let parent = tipset.parents().hash();
            if !cb(tipset) || height <= until {
                break;
            }
            hash = parent;
        }
        Ok(())
    }

    /// Abandons the head branch topped by `hash`: its index rows are removed
    /// and, when the parent branch is left with a single fork, the two are
    /// merged so no single-fork branch persists. Blockstore content stays.
    pub fn remove_head(&mut self, hash: &TipsetHash) -> SyncResult<()> {
        let id = self
            .graph
            .head_of(hash)
            .ok_or(NotFoundError::TipsetNotFound(*hash))?;
        let info = self.graph.branch(id)?.clone();

        // plan the merge the graph will perform so the rows can follow
        let merge_plan = if info.parent != NO_BRANCH {
            let parent = self.graph.branch(info.parent)?;
            if parent.forks.len() == 2 {
                let successor =
                    parent.forks.iter().copied().find(|&fork| fork != id).ok_or_else(|| {
                        SyncError::from(InvariantError::DataIntegrity(
                            "fork set lost its other child".into(),
                        ))
                    })?;
                let mut merged = self.graph.branch(successor)?.clone();
                merged.bottom = parent.bottom;
                merged.bottom_height = parent.bottom_height;
                merged.parent = parent.parent;
                Some((parent.id, merged))
            } else {
                None
            }
        } else {
            None
        };

        self.index.begin_tx()?;
        let persisted = (|index: &mut IndexStore| {
            index.delete_branch(id, true)?;
            if let Some((absorbed, merged)) = &merge_plan {
                index.merge_branch_to_head(*absorbed, merged.id)?;
                index.put_branch(merged)?;
            }
            Ok::<(), SyncError>(())
        })(&mut self.index);
        if let Err(err) = persisted {
            self.index.rollback_tx()?;
            return Err(err);
        }
        self.index.commit_tx()?;

        let (absorbed, successor) = self.graph.remove_head(hash)?;
        if let Some((planned_absorbed, planned)) = merge_plan {
            if (absorbed, successor) != (planned_absorbed, planned.id) {
                return Err(InvariantError::DataIntegrity(
                    "merge after head removal diverged from its plan".into(),
                )
                .into());
            }
        }
        // drop cached tipsets of the abandoned branch wholesale
        self.cache.lock().clear();
        debug!(target: "index::chain_db", branch = id, %hash, "removed head");
        Ok(())
    }

    /// Deepest stored tipset on the path from `head` whose parent is not yet
    /// stored; `None` means the chain below `head` reaches genesis.
    pub fn get_unsynced_bottom(&self, head: &TipsetHash) -> SyncResult<Option<Arc<Tipset>>> {
        let info = self.index.get(head)?;
        self.unsynced_bottom_of(info.branch)
    }

    fn unsynced_bottom_of(&self, branch: BranchId) -> SyncResult<Option<Arc<Tipset>>> {
        let root = self.graph.root_of(branch)?;
        if root.parent_hash.is_none() {
            return Ok(None);
        }
        let bottom = root.bottom;
        self.get_tipset_by_hash(&bottom).map(Some)
    }

    fn materialize(&self, key: &TipsetKey) -> SyncResult<Arc<Tipset>> {
        let mut headers = Vec::with_capacity(key.len());
        for cid in key.cids() {
            let header = read_header(&self.ipld, cid)?.ok_or_else(|| {
                SyncError::from(InvariantError::DataIntegrity(format!(
                    "block {cid} missing from the blockstore"
                )))
            })?;
            headers.push(header);
        }
        let tipset = Tipset::new(headers)?;
        if tipset.key() != key {
            return Err(InvariantError::DataIntegrity(format!(
                "blocks do not hash to tipset {}",
                key.hash()
            ))
            .into());
        }
        Ok(Arc::new(tipset))
    }

    fn cache_insert(&self, tipset: &Arc<Tipset>) {
        let mut cache = self.cache.lock();
        if cache.len() >= TIPSET_CACHE_LIMIT {
            // drop an arbitrary entry to bound the map
            if let Some(evict) = cache.keys().next().copied() {
                cache.remove(&evict);
            }
        }
        cache.insert(tipset.key().hash(), tipset.clone());
    }
}

impl<B> std::fmt::Debug for ChainDb<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainDb")
            .field("genesis", &self.genesis.key().hash())
            .field("current_head", &self.current_head)
            .finish_non_exhaustive()
    }
}

fn read_header<B: Blockstore>(ipld: &B, cid: &Cid) -> SyncResult<Option<BlockHeader>> {
    let Some(bytes) = ipld.get(cid).map_err(StoreError::blockstore)? else {
        return Ok(None);
    };
    let header = fvm_ipld_encoding::from_slice(&bytes)
        .map_err(|e| InvariantError::DataIntegrity(format!("malformed block header: {e}")))?;
    Ok(Some(header))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cedar_interfaces::test_utils::{genesis_tipset, random_linear_chain, random_tipset, rng};
    use cedar_interfaces::MemoryBlockstore;
    use cedar_primitives::HeadChangeKind;

    fn put_genesis(ipld: &MemoryBlockstore, genesis: &Tipset) -> Cid {
        let cid = genesis.key().cids()[0];
        let bytes = fvm_ipld_encoding::to_vec(&genesis.blocks()[0]).unwrap();
        ipld.put_keyed(&cid, &bytes).unwrap();
        cid
    }

    fn open_db(ipld: &MemoryBlockstore) -> ChainDb<&MemoryBlockstore> {
        let genesis = genesis_tipset();
        let cid = put_genesis(ipld, &genesis);
        ChainDb::open(ipld, IndexStore::open_in_memory().unwrap(), &cid).unwrap()
    }

    fn store(
        db: &mut ChainDb<&MemoryBlockstore>,
        tipset: &Tipset,
    ) -> StoreOutcome {
        db.store_tipset(tipset, tipset.parents(), SyncState::Complete).unwrap()
    }

    #[test]
    fn bootstrap_stores_genesis() {
        let ipld = MemoryBlockstore::default();
        let db = open_db(&ipld);
        let genesis = genesis_tipset();
        assert!(db.tipset_is_stored(&genesis.key().hash()).unwrap());
        assert_eq!(db.heaviest_tipset().unwrap().key(), genesis.key());
        assert_eq!(db.genesis_cid(), &genesis.key().cids()[0]);
    }

    #[test]
    fn linear_extension_walks_both_ways() {
        let ipld = MemoryBlockstore::default();
        let mut db = open_db(&ipld);
        let chain = random_linear_chain(&mut rng(), &genesis_tipset(), 5);
        for tipset in &chain {
            let outcome = store(&mut db, tipset);
            assert!(outcome.progressed);
            assert!(outcome.unsynced_bottom.is_none());
        }

        let head = chain.last().unwrap();
        db.set_current_head(&head.key().hash()).unwrap();

        let mut forward = Vec::new();
        db.walk_forward(1, 5, |ts| {
            forward.push(ts.height());
            true
        })
        .unwrap();
        assert_eq!(forward, vec![1, 2, 3, 4, 5]);

        let mut backward = Vec::new();
        db.walk_backward(&head.key().hash(), 0, |ts| {
            backward.push(ts.height());
            true
        })
        .unwrap();
        assert_eq!(backward, vec![5, 4, 3, 2, 1, 0]);

        for (offset, tipset) in chain.iter().enumerate() {
            let loaded = db.get_tipset_by_height(offset as Height + 1).unwrap();
            assert_eq!(loaded.key(), tipset.key());
        }
    }

    #[test]
    fn storing_is_idempotent() {
        let ipld = MemoryBlockstore::default();
        let mut db = open_db(&ipld);
        let chain = random_linear_chain(&mut rng(), &genesis_tipset(), 2);
        for tipset in &chain {
            store(&mut db, tipset);
        }
        let dump_before = db.graph().dump();

        let repeat = store(&mut db, &chain[1]);
        assert!(!repeat.progressed);
        assert_eq!(db.graph().dump(), dump_before);
        assert_eq!(db.graph().heads().len(), 1);
    }

    #[test]
    fn backward_arrival_reports_unsynced_bottom() {
        let ipld = MemoryBlockstore::default();
        let mut db = open_db(&ipld);
        let chain = random_linear_chain(&mut rng(), &genesis_tipset(), 5);

        // tipsets arrive tip-first, as a backward sync walk delivers them
        for tipset in chain.iter().rev() {
            let outcome = store(&mut db, tipset);
            if tipset.height() > 1 {
                let bottom = outcome.unsynced_bottom.expect("not yet linked to genesis");
                assert_eq!(bottom.key(), tipset.key());
            } else {
                assert!(outcome.unsynced_bottom.is_none());
            }
        }
        let head = chain.last().unwrap();
        assert_eq!(db.heaviest_tipset().unwrap().key(), head.key());
        assert_eq!(
            db.get_unsynced_bottom(&head.key().hash()).unwrap(),
            None
        );
    }

    #[test]
    fn fork_mid_chain_splits_and_keeps_both_heads() {
        let ipld = MemoryBlockstore::default();
        let mut db = open_db(&ipld);
        let mut generator = rng();
        let chain = random_linear_chain(&mut generator, &genesis_tipset(), 5);
        for tipset in &chain {
            store(&mut db, tipset);
        }
        let fork = random_tipset(&mut generator, 3, &chain[1], 2);
        let outcome = store(&mut db, &fork);
        assert!(outcome.unsynced_bottom.is_none());

        let heads = db.graph().heads();
        assert_eq!(heads.len(), 2);

        // projection over the original head still resolves all heights
        db.set_current_head(&chain[4].key().hash()).unwrap();
        for height in 1..=5 {
            let loaded = db.get_tipset_by_height(height).unwrap();
            assert_eq!(loaded.key(), chain[height as usize - 1].key());
        }

        // and the fork side projects its own height 3
        db.set_current_head(&fork.key().hash()).unwrap();
        assert_eq!(db.get_tipset_by_height(3).unwrap().key(), fork.key());
    }

    #[test]
    fn heaviest_tipset_prefers_weight() {
        let ipld = MemoryBlockstore::default();
        let mut db = open_db(&ipld);
        let mut generator = rng();
        let chain = random_linear_chain(&mut generator, &genesis_tipset(), 3);
        for tipset in &chain {
            store(&mut db, tipset);
        }
        // competing fork at height 3; whichever side weighs more wins
        let fork = random_tipset(&mut generator, 3, &chain[1], 3);
        store(&mut db, &fork);

        let expected =
            if fork.weight() > chain[2].weight() { fork.key() } else { chain[2].key() };
        assert_eq!(db.heaviest_tipset().unwrap().key(), expected);
    }

    #[test]
    fn remove_head_merges_rows_and_graph() {
        let ipld = MemoryBlockstore::default();
        let mut db = open_db(&ipld);
        let mut generator = rng();
        let chain = random_linear_chain(&mut generator, &genesis_tipset(), 3);
        for tipset in &chain {
            store(&mut db, tipset);
        }
        let fork = random_tipset(&mut generator, 3, &chain[1], 1);
        store(&mut db, &fork);
        assert_eq!(db.graph().heads().len(), 2);

        db.remove_head(&fork.key().hash()).unwrap();

        // a single linear branch remains and the abandoned rows are gone
        assert_eq!(db.graph().heads().len(), 1);
        assert!(!db.tipset_is_stored(&fork.key().hash()).unwrap());
        assert!(db.tipset_is_stored(&chain[2].key().hash()).unwrap());

        // the merged shape is what a fresh load reconstructs
        let dump = db.graph().dump();
        assert_eq!(dump.len(), 1);
        let merged = dump.values().next().unwrap();
        assert_eq!((merged.bottom_height, merged.top_height), (0, 3));
    }

    #[test]
    fn head_changes_reach_subscribers() {
        let ipld = MemoryBlockstore::default();
        let mut db = open_db(&ipld);
        let chain = random_linear_chain(&mut rng(), &genesis_tipset(), 2);
        for tipset in &chain {
            store(&mut db, tipset);
        }

        let (current, mut receiver) = db.subscribe_head_changes().unwrap();
        assert_eq!(current.kind, HeadChangeKind::Current);

        db.set_current_head(&chain[1].key().hash()).unwrap();
        // projection alone is silent
        assert!(receiver.try_recv().is_err());

        db.publish_head(&chain[1].key().hash()).unwrap();
        let event = receiver.try_recv().unwrap();
        assert_eq!(event.kind, HeadChangeKind::Apply);
        assert_eq!(event.tipset.key(), chain[1].key());
    }

    #[test]
    fn reopen_validates_genesis_and_restores_graph() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        let ipld = MemoryBlockstore::default();
        let genesis = genesis_tipset();
        let cid = put_genesis(&ipld, &genesis);
        let chain = random_linear_chain(&mut rng(), &genesis, 3);

        let dump = {
            let mut db =
                ChainDb::open(&ipld, IndexStore::open(&path).unwrap(), &cid).unwrap();
            for tipset in &chain {
                db.store_tipset(tipset, tipset.parents(), SyncState::Complete).unwrap();
            }
            db.graph().dump()
        };

        let db = ChainDb::open(&ipld, IndexStore::open(&path).unwrap(), &cid).unwrap();
        assert_eq!(db.graph().dump(), dump);
        assert_eq!(db.heaviest_tipset().unwrap().key(), chain[2].key());

        // a different genesis is refused
        let other = random_tipset(&mut rng(), 7, &genesis, 1);
        let other_cid = other.key().cids()[0];
        let bytes = fvm_ipld_encoding::to_vec(&other.blocks()[0]).unwrap();
        ipld.put_keyed(&other_cid, &bytes).unwrap();
        let err =
            ChainDb::open(&ipld, IndexStore::open(&path).unwrap(), &other_cid).unwrap_err();
        assert!(matches!(err, SyncError::Invariant(InvariantError::GenesisMismatch)));
    }
}
