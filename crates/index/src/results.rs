//! Write-once cache of interpreter results, keyed by tipset hash.

use cedar_interfaces::{InvariantError, StoreError, SyncResult};
use cedar_primitives::{InterpreterResult, TipsetHash};
use std::path::Path;
use tracing::trace;

/// What the cache remembers about a tipset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CachedOutcome {
    /// The tipset was interpreted successfully.
    Interpreted(InterpreterResult),
    /// Interpretation failed; retries short-circuit.
    Bad,
}

const TAG_INTERPRETED: u8 = 0;
const TAG_BAD: u8 = 1;

/// Persistent `tipset hash -> InterpreterResult` map.
///
/// Entries are write-once: once a hash is recorded it is never overwritten
/// (an identical rewrite is a no-op). Since results are keyed per tipset,
/// forks share cached results for their common prefix automatically. The
/// underlying tree is append-only from the readers' perspective, so
/// concurrent readers are safe.
#[derive(Clone, Debug)]
pub struct ResultCache {
    tree: sled::Tree,
}

impl ResultCache {
    /// Opens (or creates) the cache at `path`.
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let db = sled::open(path).map_err(StoreError::cache)?;
        Self::from_db(&db)
    }

    /// Opens a cache backed by a temporary database, used in tests.
    pub fn temporary() -> SyncResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(StoreError::cache)?;
        Self::from_db(&db)
    }

    fn from_db(db: &sled::Db) -> SyncResult<Self> {
        let tree = db.open_tree("interpreter_results").map_err(StoreError::cache)?;
        Ok(Self { tree })
    }

    /// Looks up the recorded outcome for a tipset. `None` means not yet
    /// interpreted.
    pub fn get(&self, hash: &TipsetHash) -> SyncResult<Option<CachedOutcome>> {
        let Some(bytes) = self.tree.get(hash.as_bytes()).map_err(StoreError::cache)? else {
            return Ok(None);
        };
        match bytes.first() {
            Some(&TAG_BAD) => Ok(Some(CachedOutcome::Bad)),
            Some(&TAG_INTERPRETED) => {
                let result: InterpreterResult = fvm_ipld_encoding::from_slice(&bytes[1..])
                    .map_err(|e| {
                        InvariantError::DataIntegrity(format!("malformed cached result: {e}"))
                    })?;
                Ok(Some(CachedOutcome::Interpreted(result)))
            }
            _ => Err(InvariantError::DataIntegrity("malformed cache entry".into()).into()),
        }
    }

    /// Records a successful interpretation. Writing a different result for an
    /// already-recorded hash is a data integrity error.
    pub fn put(&self, hash: &TipsetHash, result: &InterpreterResult) -> SyncResult<()> {
        let mut value = vec![TAG_INTERPRETED];
        let encoded = fvm_ipld_encoding::to_vec(result)
            .map_err(|e| InvariantError::DataIntegrity(format!("unencodable result: {e}")))?;
        value.extend_from_slice(&encoded);
        self.put_once(hash, value)
    }

    /// Records that interpreting the tipset failed.
    pub fn mark_bad(&self, hash: &TipsetHash) -> SyncResult<()> {
        self.put_once(hash, vec![TAG_BAD])
    }

    fn put_once(&self, hash: &TipsetHash, value: Vec<u8>) -> SyncResult<()> {
        let outcome = self
            .tree
            .compare_and_swap(hash.as_bytes(), None as Option<&[u8]>, Some(value.clone()))
            .map_err(StoreError::cache)?;
        match outcome {
            Ok(()) => {
                trace!(target: "index::results", %hash, "cached interpreter outcome");
                Ok(())
            }
            Err(cas) => {
                if cas.current.as_deref() == Some(value.as_slice()) {
                    // identical rewrite, keep the original
                    Ok(())
                } else {
                    Err(InvariantError::DataIntegrity(format!(
                        "conflicting interpreter result for tipset {hash}"
                    ))
                    .into())
                }
            }
        }
    }
}
