//! Durable projection of the branch graph plus per-tipset sync state.
//!
//! Backed by SQLite with a single writer: every mutating call must happen
//! inside an explicit transaction, so a crash mid-update leaves the prior
//! committed state intact and the graph can be reconstructed from it.

use cedar_interfaces::{InvariantError, NotFoundError, StoreError, SyncError, SyncResult};
use cedar_primitives::{
    BranchId, BranchInfo, Height, SplitBranch, SyncState, Tipset, TipsetHash, TipsetKey, Weight,
    NO_BRANCH,
};
use cid::Cid;
use rusqlite::{params, Connection, OptionalExtension};
use std::{collections::BTreeMap, path::Path, str::FromStr};
use tracing::debug;

/// Kinds of content-addressed objects tracked in the `blocks` table.
const OBJECT_TYPE_BLOCK: i64 = 0;

/// Indexed metadata of one stored tipset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TipsetInfo {
    /// Key of the tipset.
    pub key: TipsetKey,
    /// Branch the tipset belongs to.
    pub branch: BranchId,
    /// Height of the tipset.
    pub height: Height,
    /// Aggregated weight of the tipset.
    pub weight: Weight,
    /// Synchronization progress of the tipset.
    pub sync_state: SyncState,
    /// Hash of the parent tipset; `None` only for genesis.
    pub parent_hash: Option<TipsetHash>,
}

/// SQLite-backed index store.
pub struct IndexStore {
    conn: Connection,
    in_tx: bool,
}

impl std::fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStore").field("in_tx", &self.in_tx).finish()
    }
}

impl IndexStore {
    /// Opens (or creates) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let conn = Connection::open(path).map_err(StoreError::index)?;
        Self::from_connection(conn)
    }

    /// Opens an in-memory store, used in tests.
    pub fn open_in_memory() -> SyncResult<Self> {
        let conn = Connection::open_in_memory().map_err(StoreError::index)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> SyncResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tipsets (
                 hash       BLOB PRIMARY KEY,
                 branch_id  INTEGER NOT NULL,
                 height     INTEGER NOT NULL,
                 weight     TEXT NOT NULL,
                 sync_state INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS tipsets_branch_height
                 ON tipsets (branch_id, height);
             CREATE TABLE IF NOT EXISTS tipset_blocks (
                 tipset_hash BLOB NOT NULL,
                 cid         BLOB NOT NULL,
                 seq         INTEGER NOT NULL,
                 PRIMARY KEY (tipset_hash, seq)
             );
             CREATE TABLE IF NOT EXISTS blocks (
                 cid        BLOB PRIMARY KEY,
                 msg_cid    BLOB,
                 type       INTEGER NOT NULL,
                 sync_state INTEGER NOT NULL,
                 ref_count  INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS links (
                 left_hash  BLOB NOT NULL,
                 right_hash BLOB NOT NULL,
                 PRIMARY KEY (left_hash, right_hash)
             );
             CREATE INDEX IF NOT EXISTS links_right ON links (right_hash);
             CREATE TABLE IF NOT EXISTS branches (
                 id            INTEGER PRIMARY KEY,
                 bottom_hash   BLOB NOT NULL,
                 top_hash      BLOB NOT NULL,
                 bottom_height INTEGER NOT NULL,
                 top_height    INTEGER NOT NULL,
                 parent_id     INTEGER NOT NULL
             );",
        )
        .map_err(StoreError::index)?;
        Ok(Self { conn, in_tx: false })
    }

    /// Begins the single write transaction.
    pub fn begin_tx(&mut self) -> SyncResult<()> {
        if self.in_tx {
            return Err(InvariantError::StoreNotInitialized.into());
        }
        self.conn.execute_batch("BEGIN IMMEDIATE").map_err(StoreError::index)?;
        self.in_tx = true;
        Ok(())
    }

    /// Commits the current transaction.
    pub fn commit_tx(&mut self) -> SyncResult<()> {
        self.require_tx()?;
        self.conn.execute_batch("COMMIT").map_err(StoreError::index)?;
        self.in_tx = false;
        Ok(())
    }

    /// Rolls the current transaction back, restoring the last committed
    /// state.
    pub fn rollback_tx(&mut self) -> SyncResult<()> {
        self.require_tx()?;
        self.conn.execute_batch("ROLLBACK").map_err(StoreError::index)?;
        self.in_tx = false;
        Ok(())
    }

    fn require_tx(&self) -> SyncResult<()> {
        if self.in_tx {
            Ok(())
        } else {
            Err(InvariantError::StoreNotInitialized.into())
        }
    }

    /// Whether a tipset with the given hash is stored.
    pub fn contains(&self, hash: &TipsetHash) -> SyncResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM tipsets WHERE hash = ?1",
                params![hash.as_bytes()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::index)?;
        Ok(found.is_some())
    }

    /// Inserts a tipset row with its block membership and parent link.
    pub fn put_tipset(&mut self, info: &TipsetInfo, tipset: &Tipset) -> SyncResult<()> {
        self.require_tx()?;
        let hash = info.key.hash();
        self.conn
            .execute(
                "INSERT INTO tipsets (hash, branch_id, height, weight, sync_state)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    hash.as_bytes(),
                    info.branch as i64,
                    info.height as i64,
                    info.weight.to_string(),
                    info.sync_state as i64,
                ],
            )
            .map_err(StoreError::index)?;

        for (seq, block) in tipset.blocks().iter().enumerate() {
            let cid = info.key.cids()[seq];
            self.conn
                .execute(
                    "INSERT INTO tipset_blocks (tipset_hash, cid, seq) VALUES (?1, ?2, ?3)",
                    params![hash.as_bytes(), cid.to_bytes(), seq as i64],
                )
                .map_err(StoreError::index)?;
            self.conn
                .execute(
                    "INSERT INTO blocks (cid, msg_cid, type, sync_state, ref_count)
                     VALUES (?1, ?2, ?3, ?4, 1)
                     ON CONFLICT (cid) DO UPDATE SET ref_count = ref_count + 1",
                    params![
                        cid.to_bytes(),
                        block.messages_root.to_bytes(),
                        OBJECT_TYPE_BLOCK,
                        info.sync_state as i64,
                    ],
                )
                .map_err(StoreError::index)?;
        }

        if let Some(parent) = &info.parent_hash {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO links (left_hash, right_hash) VALUES (?1, ?2)",
                    params![parent.as_bytes(), hash.as_bytes()],
                )
                .map_err(StoreError::index)?;
        }
        Ok(())
    }

    /// Looks a tipset up by hash.
    pub fn get(&self, hash: &TipsetHash) -> SyncResult<TipsetInfo> {
        let row = self
            .conn
            .query_row(
                "SELECT branch_id, height, weight, sync_state FROM tipsets WHERE hash = ?1",
                params![hash.as_bytes()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(StoreError::index)?
            .ok_or(NotFoundError::TipsetNotFound(*hash))?;
        self.assemble(*hash, row)
    }

    /// Lowest tipset of `branch` strictly above `height`; heights may skip
    /// rounds, so this is not necessarily `height + 1`.
    pub fn get_first_above(&self, branch: BranchId, height: Height) -> SyncResult<TipsetInfo> {
        let row: Option<i64> = self
            .conn
            .query_row(
                "SELECT MIN(height) FROM tipsets WHERE branch_id = ?1 AND height > ?2",
                params![branch as i64, height as i64],
                |row| row.get(0),
            )
            .map_err(StoreError::index)?;
        let above = row.ok_or(NotFoundError::BranchNotFound(height))?;
        self.get_by_position(branch, above as Height)
    }

    /// Looks a tipset up by `(branch, height)` position.
    pub fn get_by_position(&self, branch: BranchId, height: Height) -> SyncResult<TipsetInfo> {
        let result = self
            .conn
            .query_row(
                "SELECT hash, branch_id, height, weight, sync_state FROM tipsets
                 WHERE branch_id = ?1 AND height = ?2",
                params![branch as i64, height as i64],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        (
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)?,
                        ),
                    ))
                },
            )
            .optional()
            .map_err(StoreError::index)?;
        let (hash_bytes, row) =
            result.ok_or(NotFoundError::BranchNotFound(height))?;
        let hash = TipsetHash::from_slice(&hash_bytes).ok_or_else(|| {
            SyncError::from(InvariantError::DataIntegrity("malformed tipset hash".into()))
        })?;
        self.assemble(hash, row)
    }

    fn assemble(
        &self,
        hash: TipsetHash,
        (branch, height, weight, sync_state): (i64, i64, String, i64),
    ) -> SyncResult<TipsetInfo> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT cid FROM tipset_blocks WHERE tipset_hash = ?1 ORDER BY seq",
            )
            .map_err(StoreError::index)?;
        let cids: Vec<Cid> = stmt
            .query_map(params![hash.as_bytes()], |row| row.get::<_, Vec<u8>>(0))
            .map_err(StoreError::index)?
            .collect::<Result<Vec<Vec<u8>>, _>>()
            .map_err(StoreError::index)?
            .into_iter()
            .map(|bytes| Cid::try_from(bytes.as_slice()))
            .collect::<Result<_, _>>()
            .map_err(|e| InvariantError::DataIntegrity(format!("malformed cid: {e}")))?;
        if cids.is_empty() {
            return Err(
                InvariantError::DataIntegrity(format!("tipset {hash} has no blocks")).into()
            );
        }

        let parent_hash = self.parent_of(&hash)?;
        let weight = Weight::from_str(&weight)
            .map_err(|e| InvariantError::DataIntegrity(format!("malformed weight: {e}")))?;
        let sync_state = SyncState::from_u8(sync_state as u8).ok_or_else(|| {
            SyncError::from(InvariantError::DataIntegrity("malformed sync state".into()))
        })?;
        Ok(TipsetInfo {
            key: TipsetKey::new(cids),
            branch: branch as BranchId,
            height: height as Height,
            weight,
            sync_state,
            parent_hash,
        })
    }

    /// Hash of the stored parent link of `hash`, if any.
    pub fn parent_of(&self, hash: &TipsetHash) -> SyncResult<Option<TipsetHash>> {
        let bytes: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT left_hash FROM links WHERE right_hash = ?1",
                params![hash.as_bytes()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::index)?;
        match bytes {
            None => Ok(None),
            Some(bytes) => TipsetHash::from_slice(&bytes).map(Some).ok_or_else(|| {
                InvariantError::DataIntegrity("malformed parent hash".into()).into()
            }),
        }
    }

    /// Advances a tipset's sync state, enforcing monotonicity. Returns the
    /// resulting state.
    pub fn update_tipset_sync_state(
        &mut self,
        hash: &TipsetHash,
        to: SyncState,
    ) -> SyncResult<SyncState> {
        self.require_tx()?;
        let current: i64 = self
            .conn
            .query_row(
                "SELECT sync_state FROM tipsets WHERE hash = ?1",
                params![hash.as_bytes()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::index)?
            .ok_or(NotFoundError::TipsetNotFound(*hash))?;
        let current = SyncState::from_u8(current as u8).ok_or_else(|| {
            SyncError::from(InvariantError::DataIntegrity("malformed sync state".into()))
        })?;
        let next = current.advance(to);
        if next != current {
            self.conn
                .execute(
                    "UPDATE tipsets SET sync_state = ?1 WHERE hash = ?2",
                    params![next as i64, hash.as_bytes()],
                )
                .map_err(StoreError::index)?;
        }
        Ok(next)
    }

    /// Ids of all root branches (no parent branch).
    pub fn roots(&self) -> SyncResult<Vec<BranchId>> {
        self.branch_ids("SELECT id FROM branches WHERE parent_id = 0 ORDER BY id")
    }

    /// Ids of all head branches (no branch chains onto them).
    pub fn heads(&self) -> SyncResult<Vec<BranchId>> {
        self.branch_ids(
            "SELECT id FROM branches
             WHERE id NOT IN (SELECT parent_id FROM branches) ORDER BY id",
        )
    }

    fn branch_ids(&self, sql: &str) -> SyncResult<Vec<BranchId>> {
        let mut stmt = self.conn.prepare(sql).map_err(StoreError::index)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .map_err(StoreError::index)?
            .collect::<Result<Vec<i64>, _>>()
            .map_err(StoreError::index)?;
        Ok(ids.into_iter().map(|id| id as BranchId).collect())
    }

    /// Returns the root branch of `id`'s parent chain and the weakest sync
    /// state found along the subtree from the root up to `id`.
    pub fn get_branch_sync_state(&self, id: BranchId) -> SyncResult<(BranchId, SyncState)> {
        let total: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM branches", [], |row| row.get(0))
            .map_err(StoreError::index)?;
        let mut min_state = SyncState::Complete;
        let mut current = id;
        let mut cycle_guard = total + 1;
        loop {
            cycle_guard -= 1;
            if cycle_guard < 0 {
                return Err(InvariantError::CycleDetected.into());
            }
            let parent: Option<i64> = self
                .conn
                .query_row(
                    "SELECT parent_id FROM branches WHERE id = ?1",
                    params![current as i64],
                    |row| row.get(0),
                )
                .optional()
                .map_err(StoreError::index)?;
            let parent = parent.ok_or(NotFoundError::NoSuchBranch(current))?;

            let weakest: Option<i64> = self
                .conn
                .query_row(
                    "SELECT MIN(sync_state) FROM tipsets WHERE branch_id = ?1",
                    params![current as i64],
                    |row| row.get(0),
                )
                .map_err(StoreError::index)?;
            if let Some(state) = weakest.and_then(|s| SyncState::from_u8(s as u8)) {
                min_state = min_state.min(state);
            }

            if parent == NO_BRANCH as i64 {
                return Ok((current, min_state));
            }
            current = parent as BranchId;
        }
    }

    /// Upserts a branch record.
    pub fn put_branch(&mut self, info: &BranchInfo) -> SyncResult<()> {
        self.require_tx()?;
        self.conn
            .execute(
                "INSERT INTO branches
                     (id, bottom_hash, top_hash, bottom_height, top_height, parent_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (id) DO UPDATE SET
                     bottom_hash = excluded.bottom_hash,
                     top_hash = excluded.top_hash,
                     bottom_height = excluded.bottom_height,
                     top_height = excluded.top_height,
                     parent_id = excluded.parent_id",
                params![
                    info.id as i64,
                    info.bottom.as_bytes(),
                    info.top.as_bytes(),
                    info.bottom_height as i64,
                    info.top_height as i64,
                    info.parent as i64,
                ],
            )
            .map_err(StoreError::index)?;
        Ok(())
    }

    /// Deletes a branch record, optionally with the tipset rows assigned to
    /// it.
    pub fn delete_branch(&mut self, id: BranchId, delete_tipsets: bool) -> SyncResult<()> {
        self.require_tx()?;
        if delete_tipsets {
            self.conn
                .execute(
                    "DELETE FROM tipset_blocks WHERE tipset_hash IN
                         (SELECT hash FROM tipsets WHERE branch_id = ?1)",
                    params![id as i64],
                )
                .map_err(StoreError::index)?;
            self.conn
                .execute(
                    "DELETE FROM links WHERE right_hash IN
                         (SELECT hash FROM tipsets WHERE branch_id = ?1)",
                    params![id as i64],
                )
                .map_err(StoreError::index)?;
            self.conn
                .execute("DELETE FROM tipsets WHERE branch_id = ?1", params![id as i64])
                .map_err(StoreError::index)?;
        }
        self.conn
            .execute("DELETE FROM branches WHERE id = ?1", params![id as i64])
            .map_err(StoreError::index)?;
        Ok(())
    }

    /// Renames every row of `absorbed` to `into` and drops the absorbed
    /// branch record, mirroring a graph merge.
    pub fn merge_branch_to_head(&mut self, absorbed: BranchId, into: BranchId) -> SyncResult<()> {
        self.require_tx()?;
        self.conn
            .execute(
                "UPDATE tipsets SET branch_id = ?1 WHERE branch_id = ?2",
                params![into as i64, absorbed as i64],
            )
            .map_err(StoreError::index)?;
        self.conn
            .execute(
                "UPDATE branches SET parent_id = ?1 WHERE parent_id = ?2",
                params![into as i64, absorbed as i64],
            )
            .map_err(StoreError::index)?;
        self.conn
            .execute("DELETE FROM branches WHERE id = ?1", params![absorbed as i64])
            .map_err(StoreError::index)?;
        debug!(target: "index::store", absorbed, into, "merged branch rows");
        Ok(())
    }

    /// Moves rows of `branch` above `above_height` to `new_child_id`,
    /// mirroring a graph split. Child branch records are reparented onto the
    /// new id.
    pub fn split_branch(
        &mut self,
        branch: BranchId,
        above_height: Height,
        new_child_id: BranchId,
    ) -> SyncResult<()> {
        self.require_tx()?;
        self.conn
            .execute(
                "UPDATE tipsets SET branch_id = ?1 WHERE branch_id = ?2 AND height > ?3",
                params![new_child_id as i64, branch as i64, above_height as i64],
            )
            .map_err(StoreError::index)?;
        self.conn
            .execute(
                "UPDATE branches SET parent_id = ?1 WHERE parent_id = ?2",
                params![new_child_id as i64, branch as i64],
            )
            .map_err(StoreError::index)?;
        debug!(target: "index::store", branch, new_child_id, above_height, "split branch rows");
        Ok(())
    }

    /// Reconstructs branch records for [`BranchGraph::load`].
    ///
    /// [`BranchGraph::load`]: crate::BranchGraph::load
    pub fn load_branches(&self) -> SyncResult<BTreeMap<BranchId, BranchInfo>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, bottom_hash, top_hash, bottom_height, top_height, parent_id
                 FROM branches",
            )
            .map_err(StoreError::index)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .map_err(StoreError::index)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::index)?;

        let mut branches = BTreeMap::new();
        for (id, bottom, top, bottom_height, top_height, parent_id) in rows {
            let bottom = TipsetHash::from_slice(&bottom).ok_or_else(|| {
                SyncError::from(InvariantError::DataIntegrity("malformed bottom hash".into()))
            })?;
            let top = TipsetHash::from_slice(&top).ok_or_else(|| {
                SyncError::from(InvariantError::DataIntegrity("malformed top hash".into()))
            })?;
            let info = BranchInfo {
                id: id as BranchId,
                top,
                top_height: top_height as Height,
                bottom,
                bottom_height: bottom_height as Height,
                parent: parent_id as BranchId,
                parent_hash: self.parent_of(&bottom)?,
                synced_to_genesis: false,
                forks: Default::default(),
            };
            branches.insert(info.id, info);
        }
        Ok(branches)
    }

    /// Walks tipsets of `branch` with heights in `[from, to]` in ascending
    /// order, stopping early when `cb` returns `false`.
    pub fn walk_forward(
        &self,
        branch: BranchId,
        from: Height,
        to: Height,
        mut cb: impl FnMut(TipsetInfo) -> SyncResult<bool>,
    ) -> SyncResult<()> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT hash, branch_id, height, weight, sync_state FROM tipsets
                 WHERE branch_id = ?1 AND height >= ?2 AND height <= ?3
                 ORDER BY height",
            )
            .map_err(StoreError::index)?;
        let rows = stmt
            .query_map(params![branch as i64, from as i64, to as i64], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    (
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ),
                ))
            })
            .map_err(StoreError::index)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::index)?;
        for (hash_bytes, row) in rows {
            let hash = TipsetHash::from_slice(&hash_bytes).ok_or_else(|| {
                SyncError::from(InvariantError::DataIntegrity("malformed tipset hash".into()))
            })?;
            let info = self.assemble(hash, row)?;
            if !cb(info)? {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cedar_interfaces::test_utils::{genesis_tipset, random_linear_chain, rng};

    fn info_for(tipset: &Tipset, branch: BranchId, state: SyncState) -> TipsetInfo {
        TipsetInfo {
            key: tipset.key().clone(),
            branch,
            height: tipset.height(),
            weight: tipset.weight(),
            sync_state: state,
            parent_hash: (tipset.height() > 0).then(|| tipset.parents().hash()),
        }
    }

    fn populated_store() -> (IndexStore, Vec<Tipset>) {
        let mut store = IndexStore::open_in_memory().unwrap();
        let genesis = genesis_tipset();
        let mut chain = vec![genesis.clone()];
        chain.extend(random_linear_chain(&mut rng(), &genesis, 4));

        store.begin_tx().unwrap();
        for tipset in &chain {
            store.put_tipset(&info_for(tipset, 1, SyncState::Complete), tipset).unwrap();
        }
        let mut branch = BranchInfo::new(1, chain[0].key().hash(), 0);
        branch.top = chain.last().unwrap().key().hash();
        branch.top_height = 4;
        store.put_branch(&branch).unwrap();
        store.commit_tx().unwrap();
        (store, chain)
    }

    #[test]
    fn tipsets_round_trip() {
        let (store, chain) = populated_store();
        for tipset in &chain {
            let info = store.get(&tipset.key().hash()).unwrap();
            assert_eq!(&info.key, tipset.key());
            assert_eq!(info.height, tipset.height());
            assert_eq!(info.weight, tipset.weight());
            assert_eq!(info.sync_state, SyncState::Complete);
        }
        assert!(store.contains(&chain[2].key().hash()).unwrap());
        assert!(!store.contains(&TipsetHash::new([9u8; 32])).unwrap());
    }

    #[test]
    fn parent_links_follow_the_chain() {
        let (store, chain) = populated_store();
        assert_eq!(store.parent_of(&chain[0].key().hash()).unwrap(), None);
        for pair in chain.windows(2) {
            assert_eq!(
                store.parent_of(&pair[1].key().hash()).unwrap(),
                Some(pair[0].key().hash())
            );
        }
    }

    #[test]
    fn mutations_require_a_transaction() {
        let (mut store, chain) = populated_store();
        let err = store
            .update_tipset_sync_state(&chain[0].key().hash(), SyncState::Complete)
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Invariant(InvariantError::StoreNotInitialized)
        ));
    }

    #[test]
    fn rollback_discards_writes() {
        let (mut store, _) = populated_store();
        let genesis = genesis_tipset();
        let extra = random_linear_chain(&mut rng(), &genesis, 6).pop().unwrap();

        store.begin_tx().unwrap();
        store.put_tipset(&info_for(&extra, 1, SyncState::HeaderOnly), &extra).unwrap();
        assert!(store.contains(&extra.key().hash()).unwrap());
        store.rollback_tx().unwrap();
        assert!(!store.contains(&extra.key().hash()).unwrap());
    }

    #[test]
    fn sync_state_advances_monotonically() {
        let (mut store, chain) = populated_store();
        let genesis = genesis_tipset();
        let extra = random_linear_chain(&mut rng(), &genesis, 6).pop().unwrap();

        store.begin_tx().unwrap();
        store.put_tipset(&info_for(&extra, 1, SyncState::HeaderOnly), &extra).unwrap();
        let hash = extra.key().hash();
        assert_eq!(
            store.update_tipset_sync_state(&hash, SyncState::Complete).unwrap(),
            SyncState::Complete
        );
        // regression attempt is a no-op
        assert_eq!(
            store.update_tipset_sync_state(&hash, SyncState::HeaderOnly).unwrap(),
            SyncState::Complete
        );
        // bad is terminal
        assert_eq!(
            store.update_tipset_sync_state(&hash, SyncState::Bad).unwrap(),
            SyncState::Bad
        );
        assert_eq!(
            store.update_tipset_sync_state(&hash, SyncState::Complete).unwrap(),
            SyncState::Bad
        );
        store.commit_tx().unwrap();
        let _ = chain;
    }

    #[test]
    fn split_and_merge_rename_rows() {
        let (mut store, chain) = populated_store();

        store.begin_tx().unwrap();
        store.split_branch(1, 2, 7).unwrap();
        store.commit_tx().unwrap();
        assert_eq!(store.get(&chain[1].key().hash()).unwrap().branch, 1);
        assert_eq!(store.get(&chain[3].key().hash()).unwrap().branch, 7);
        assert_eq!(store.get_by_position(7, 4).unwrap().key, *chain[4].key());

        store.begin_tx().unwrap();
        store.merge_branch_to_head(1, 7).unwrap();
        store.commit_tx().unwrap();
        assert_eq!(store.get(&chain[1].key().hash()).unwrap().branch, 7);
    }

    #[test]
    fn branch_records_round_trip() {
        let (mut store, chain) = populated_store();
        let mut fork = BranchInfo::new(3, chain[3].key().hash(), 3);
        fork.parent = 1;
        fork.parent_hash = Some(chain[2].key().hash());

        store.begin_tx().unwrap();
        store.put_branch(&fork).unwrap();
        store.commit_tx().unwrap();

        let loaded = store.load_branches().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[&3].parent, 1);
        assert_eq!(loaded[&1].parent_hash, None);
        // fork's bottom is a stored tipset, so its awaited parent is known
        assert_eq!(loaded[&3].parent_hash, Some(chain[2].key().hash()));
    }

    #[test]
    fn walk_forward_respects_range_and_stop() {
        let (store, chain) = populated_store();
        let mut seen = Vec::new();
        store
            .walk_forward(1, 1, 3, |info| {
                seen.push(info.height);
                Ok(true)
            })
            .unwrap();
        assert_eq!(seen, vec![1, 2, 3]);

        let mut seen = Vec::new();
        store
            .walk_forward(1, 0, 10, |info| {
                seen.push(info.height);
                Ok(info.height < 2)
            })
            .unwrap();
        assert_eq!(seen, vec![0, 1, 2]);
        let _ = chain;
    }

    #[test]
    fn roots_and_heads_follow_parent_links() {
        let (mut store, chain) = populated_store();
        let mut fork = BranchInfo::new(3, chain[3].key().hash(), 3);
        fork.parent = 1;
        let mut orphan = BranchInfo::new(9, chain[4].key().hash(), 20);
        orphan.bottom_height = 20;
        orphan.top_height = 22;

        store.begin_tx().unwrap();
        store.put_branch(&fork).unwrap();
        store.put_branch(&orphan).unwrap();
        store.commit_tx().unwrap();

        assert_eq!(store.roots().unwrap(), vec![1, 9]);
        assert_eq!(store.heads().unwrap(), vec![3, 9]);
    }

    #[test]
    fn branch_sync_state_walks_to_the_root() {
        let (mut store, chain) = populated_store();
        let mut fork = BranchInfo::new(3, chain[3].key().hash(), 3);
        fork.parent = 1;
        store.begin_tx().unwrap();
        store.put_branch(&fork).unwrap();
        store.split_branch(1, 2, 3).unwrap();
        store.commit_tx().unwrap();

        let (root, state) = store.get_branch_sync_state(3).unwrap();
        assert_eq!(root, 1);
        assert_eq!(state, SyncState::Complete);
    }
}
