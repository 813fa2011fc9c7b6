use crate::{bigint_ser, Address, Height, TipsetKey, Weight};
use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use fvm_ipld_encoding::DAG_CBOR;
use serde_tuple::{Deserialize_tuple, Serialize_tuple};

/// A signed block record.
///
/// Headers are CBOR tuple encoded; the encoding is bit-exact with the
/// reference network, and a header is identified by the CID of its encoding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct BlockHeader {
    /// Address of the miner that produced the block.
    pub miner: Address,
    /// Key of the parent tipset this block extends.
    pub parents: TipsetKey,
    /// Aggregated weight of the parent tipset.
    #[serde(with = "bigint_ser")]
    pub parent_weight: Weight,
    /// Weight this single block contributes on top of its parents.
    #[serde(with = "bigint_ser")]
    pub weight_delta: Weight,
    /// Height of the block.
    pub height: Height,
    /// CID of the state tree after applying the parent tipset.
    pub state_root: Cid,
    /// CID of the message list included in this block.
    pub messages_root: Cid,
    /// Block timestamp, seconds since the unix epoch.
    pub timestamp: u64,
    /// Miner signature over the header.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl BlockHeader {
    /// Returns the CID identifying this header (DAG-CBOR, blake2b-256).
    pub fn cid(&self) -> Result<Cid, fvm_ipld_encoding::Error> {
        let bytes = fvm_ipld_encoding::to_vec(self)?;
        Ok(Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(&bytes)))
    }
}
