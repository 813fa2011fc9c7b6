use crate::{BlockHeader, Height, TipsetKey, Weight};
use cid::Cid;
use std::{fmt, sync::Arc};

/// Errors constructing a [`Tipset`] from block headers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TipsetError {
    /// A tipset needs at least one block.
    #[error("cannot create a tipset without blocks")]
    NoBlocks,
    /// All blocks of a tipset share one height.
    #[error("mismatching block heights in tipset")]
    MismatchingHeights,
    /// All blocks of a tipset share one parent key.
    #[error("mismatching block parents in tipset")]
    MismatchingParents,
    /// Duplicate block in the input.
    #[error("duplicate block cid in tipset")]
    DuplicateBlock,
    /// Per-block payloads must cover every block of the tipset.
    #[error("per-block message lists do not match block count")]
    MessageArityMismatch,
    /// Header CBOR encoding failed while computing a block CID.
    #[error("cannot encode block header: {0}")]
    Encoding(String),
}

/// A materialized tipset: resolved block headers plus the derived key.
///
/// Immutable once constructed; construction validates the structural rules
/// (same height, same parents) and orders blocks canonically by CID.
#[derive(Clone, PartialEq, Eq)]
pub struct Tipset {
    key: TipsetKey,
    blocks: Vec<BlockHeader>,
}

impl Tipset {
    /// Builds a tipset from headers, sorting them into canonical order and
    /// validating structure.
    pub fn new(blocks: Vec<BlockHeader>) -> Result<Self, TipsetError> {
        if blocks.is_empty() {
            return Err(TipsetError::NoBlocks);
        }

        let mut keyed = Vec::with_capacity(blocks.len());
        for block in blocks {
            let cid = block.cid().map_err(|e| TipsetError::Encoding(e.to_string()))?;
            keyed.push((cid, block));
        }
        keyed.sort_unstable_by(|(a, _), (b, _)| a.to_bytes().cmp(&b.to_bytes()));
        if keyed.windows(2).any(|w| w[0].0 == w[1].0) {
            return Err(TipsetError::DuplicateBlock);
        }

        let first = &keyed[0].1;
        if keyed.iter().any(|(_, b)| b.height != first.height) {
            return Err(TipsetError::MismatchingHeights);
        }
        if keyed.iter().any(|(_, b)| b.parents != first.parents) {
            return Err(TipsetError::MismatchingParents);
        }

        let (cids, blocks): (Vec<Cid>, Vec<BlockHeader>) = keyed.into_iter().unzip();
        Ok(Self { key: TipsetKey::new(cids), blocks })
    }

    /// The key identifying this tipset.
    pub fn key(&self) -> &TipsetKey {
        &self.key
    }

    /// Height shared by all blocks.
    pub fn height(&self) -> Height {
        self.blocks[0].height
    }

    /// Parent tipset key shared by all blocks.
    pub fn parents(&self) -> &TipsetKey {
        &self.blocks[0].parents
    }

    /// Aggregated weight: the parents' weight plus every block's delta.
    pub fn weight(&self) -> Weight {
        let mut weight = self.blocks[0].parent_weight.clone();
        for block in &self.blocks {
            weight += &block.weight_delta;
        }
        weight
    }

    /// The block headers in canonical order.
    pub fn blocks(&self) -> &[BlockHeader] {
        &self.blocks
    }

    /// Smallest timestamp among the blocks.
    pub fn min_timestamp(&self) -> u64 {
        self.blocks.iter().map(|b| b.timestamp).min().unwrap_or_default()
    }

    /// Whether the tipset contains the given block CID.
    pub fn contains(&self, cid: &Cid) -> bool {
        self.key.contains(cid)
    }
}

impl fmt::Debug for Tipset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tipset")
            .field("height", &self.height())
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Message CIDs of a single block, split by signature scheme.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockMessages {
    /// BLS-aggregated message CIDs.
    pub bls: Vec<Cid>,
    /// Secp-signed message CIDs.
    pub secp: Vec<Cid>,
}

/// A tipset as delivered by chainsync: headers plus, optionally, per-block
/// message CIDs in block order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FullTipset {
    tipset: Arc<Tipset>,
    messages: Option<Vec<BlockMessages>>,
}

impl FullTipset {
    /// Combines a tipset with per-block messages; `messages`, when present,
    /// must cover every block.
    pub fn new(tipset: Tipset, messages: Option<Vec<BlockMessages>>) -> Result<Self, TipsetError> {
        if let Some(msgs) = &messages {
            if msgs.len() != tipset.blocks().len() {
                return Err(TipsetError::MessageArityMismatch);
            }
        }
        Ok(Self { tipset: Arc::new(tipset), messages })
    }

    /// The carried tipset.
    pub fn tipset(&self) -> &Arc<Tipset> {
        &self.tipset
    }

    /// Per-block messages, if the response carried them.
    pub fn messages(&self) -> Option<&[BlockMessages]> {
        self.messages.as_deref()
    }

    /// Whether messages were delivered alongside the headers.
    pub fn has_messages(&self) -> bool {
        self.messages.is_some()
    }

    /// Drops the message payload, keeping the tipset.
    pub fn into_tipset(self) -> Arc<Tipset> {
        self.tipset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Address;
    use multihash_codetable::{Code, MultihashDigest};
    use fvm_ipld_encoding::DAG_CBOR;
    use num_bigint::BigInt;

    fn cid_of(data: &[u8]) -> Cid {
        Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(data))
    }

    fn header(height: Height, miner: u8, parents: &TipsetKey) -> BlockHeader {
        BlockHeader {
            miner: Address::new(vec![miner]),
            parents: parents.clone(),
            parent_weight: BigInt::from(1000),
            weight_delta: BigInt::from(10),
            height,
            state_root: cid_of(b"state"),
            messages_root: cid_of(&[miner]),
            timestamp: 100 + miner as u64,
            signature: vec![miner; 8],
        }
    }

    #[test]
    fn builds_and_aggregates_weight() {
        let parents = TipsetKey::new(vec![cid_of(b"p")]);
        let ts = Tipset::new(vec![header(3, 1, &parents), header(3, 2, &parents)]).unwrap();
        assert_eq!(ts.height(), 3);
        assert_eq!(ts.parents(), &parents);
        assert_eq!(ts.weight(), BigInt::from(1020));
        assert_eq!(ts.min_timestamp(), 101);
    }

    #[test]
    fn block_order_is_canonical() {
        let parents = TipsetKey::new(vec![cid_of(b"p")]);
        let a = header(3, 1, &parents);
        let b = header(3, 2, &parents);
        let ts1 = Tipset::new(vec![a.clone(), b.clone()]).unwrap();
        let ts2 = Tipset::new(vec![b, a]).unwrap();
        assert_eq!(ts1, ts2);
        assert_eq!(ts1.key().hash(), ts2.key().hash());
    }

    #[test]
    fn rejects_structural_violations() {
        let parents = TipsetKey::new(vec![cid_of(b"p")]);
        let other_parents = TipsetKey::new(vec![cid_of(b"q")]);

        assert_eq!(Tipset::new(vec![]), Err(TipsetError::NoBlocks));

        let h = header(3, 1, &parents);
        assert_eq!(
            Tipset::new(vec![h.clone(), header(4, 2, &parents)]),
            Err(TipsetError::MismatchingHeights)
        );
        assert_eq!(
            Tipset::new(vec![h.clone(), header(3, 2, &other_parents)]),
            Err(TipsetError::MismatchingParents)
        );
        assert_eq!(Tipset::new(vec![h.clone(), h]), Err(TipsetError::DuplicateBlock));
    }

    #[test]
    fn full_tipset_checks_message_arity() {
        let parents = TipsetKey::new(vec![cid_of(b"p")]);
        let ts = Tipset::new(vec![header(1, 1, &parents)]).unwrap();
        assert!(FullTipset::new(ts.clone(), Some(vec![])).is_err());
        let full = FullTipset::new(ts, Some(vec![BlockMessages::default()])).unwrap();
        assert!(full.has_messages());
    }
}
