use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Length in bytes of a [`TipsetHash`].
pub const TIPSET_HASH_LENGTH: usize = 32;

/// Canonical identifier of a tipset.
///
/// Blake2b-256 over the concatenation of the sorted block CID bytes. Equality
/// and ordering are by bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TipsetHash([u8; TIPSET_HASH_LENGTH]);

impl TipsetHash {
    /// Wraps raw hash bytes.
    pub const fn new(bytes: [u8; TIPSET_HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Reads a hash back from its byte representation, e.g. a database key.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; TIPSET_HASH_LENGTH] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Raw bytes of the hash.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for TipsetHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for TipsetHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TipsetHash({self})")
    }
}

impl fmt::Display for TipsetHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // first eight bytes are enough to tell tipsets apart in logs
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Returns the blake2b-256 digest of the given CIDs' bytes, concatenated in
/// the order given.
///
/// Callers are expected to pass CIDs already in canonical (sorted) order; use
/// [`TipsetKey::new`] for that.
pub fn tipset_hash(cids: &[Cid]) -> TipsetHash {
    let mut bytes = Vec::with_capacity(cids.len() * 64);
    for cid in cids {
        bytes.extend_from_slice(&cid.to_bytes());
    }
    let digest = Code::Blake2b256.digest(&bytes);
    let mut hash = [0u8; TIPSET_HASH_LENGTH];
    hash.copy_from_slice(digest.digest());
    TipsetHash(hash)
}

/// An ordered set of block CIDs at the same height with identical parents,
/// together with the derived [`TipsetHash`].
///
/// On the wire a key is just the CID list; the hash is recomputed on decode.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TipsetKey {
    cids: Vec<Cid>,
    hash: TipsetHash,
}

impl TipsetKey {
    /// Creates a key from block CIDs, sorting and deduplicating them first.
    pub fn new(mut cids: Vec<Cid>) -> Self {
        cids.sort_unstable_by(|a, b| a.to_bytes().cmp(&b.to_bytes()));
        cids.dedup();
        let hash = tipset_hash(&cids);
        Self { cids, hash }
    }

    /// The block CIDs in canonical order.
    pub fn cids(&self) -> &[Cid] {
        &self.cids
    }

    /// The derived hash identifying this key.
    pub fn hash(&self) -> TipsetHash {
        self.hash
    }

    /// Number of blocks in the key.
    pub fn len(&self) -> usize {
        self.cids.len()
    }

    /// Whether the key holds no CIDs.
    pub fn is_empty(&self) -> bool {
        self.cids.is_empty()
    }

    /// Whether the key contains the given block CID.
    pub fn contains(&self, cid: &Cid) -> bool {
        self.cids.contains(cid)
    }
}

impl fmt::Debug for TipsetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TipsetKey").field("cids", &self.cids).field("hash", &self.hash).finish()
    }
}

impl fmt::Display for TipsetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hash)
    }
}

impl From<Vec<Cid>> for TipsetKey {
    fn from(cids: Vec<Cid>) -> Self {
        Self::new(cids)
    }
}

impl Serialize for TipsetKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.cids.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TipsetKey {
    // an empty cid list is legal: the genesis block has no parents
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let cids = Vec::<Cid>::deserialize(deserializer)?;
        Ok(Self::new(cids))
    }
}
