//! Wire layouts of the hello handshake and the chainsync request/response
//! protocol. All messages are CBOR tuple encoded, field order fixed.

use cedar_primitives::{bigint_ser, BlockMessages, FullTipset, Tipset, TipsetError, Weight};
use cid::Cid;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_tuple::{Deserialize_tuple, Serialize_tuple};

/// Protocol id of the hello handshake.
pub const HELLO_PROTOCOL_ID: &str = "/fil/hello/1.0.0";

/// Protocol id of the chainsync request/response protocol.
pub const CHAINSYNC_PROTOCOL_ID: &str = "/fil/sync/blk/0.0.1";

/// Greeting a peer sends on connect, claiming its heaviest head.
///
/// The genesis CID is exchanged at stream level alongside this message;
/// agreement on it decides network membership.
#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct HelloMessage {
    /// Block CIDs of the claimed heaviest tipset.
    pub heaviest_tipset: Vec<Cid>,
    /// Height of that tipset.
    pub heaviest_tipset_height: u64,
    /// Claimed aggregated weight.
    #[serde(with = "bigint_ser")]
    pub heaviest_tipset_weight: Weight,
}

/// What a chainsync request asks the peer to include.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestOptions {
    /// Block headers only.
    BlocksOnly = 1,
    /// Messages only.
    MessagesOnly = 2,
    /// Headers and messages.
    BlocksAndMessages = 3,
}

impl Serialize for RequestOptions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (*self as u64).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RequestOptions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u64::deserialize(deserializer)? {
            1 => Ok(RequestOptions::BlocksOnly),
            2 => Ok(RequestOptions::MessagesOnly),
            3 => Ok(RequestOptions::BlocksAndMessages),
            other => Err(de::Error::custom(format!("invalid request options {other}"))),
        }
    }
}

/// Chainsync request: a tipset key plus how deep into its ancestry the
/// response may reach.
#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct ChainSyncRequest {
    /// Block CIDs of the requested tipset.
    pub block_cids: Vec<Cid>,
    /// Number of tipsets the response may include, requested one first.
    pub depth: u64,
    /// Payload selection.
    pub options: RequestOptions,
}

/// One tipset of a chainsync response.
///
/// Message bodies travel in the codec layer; the bundle carries their CIDs
/// with per-block include lists, in block order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct TipsetBundle {
    /// Block headers of the tipset.
    pub blocks: Vec<cedar_primitives::BlockHeader>,
    /// CIDs of BLS-aggregated messages.
    pub bls_msgs: Vec<Cid>,
    /// For each block, indices into `bls_msgs`.
    pub bls_msg_includes: Vec<Vec<u64>>,
    /// CIDs of secp-signed messages.
    pub secp_msgs: Vec<Cid>,
    /// For each block, indices into `secp_msgs`.
    pub secp_msg_includes: Vec<Vec<u64>>,
}

impl TipsetBundle {
    /// Builds a [`FullTipset`] out of the bundle, resolving include lists to
    /// per-block message CIDs. Bundles without include lists yield a
    /// header-only tipset.
    pub fn into_full_tipset(self) -> Result<FullTipset, TipsetError> {
        let tipset = Tipset::new(self.blocks)?;
        if self.bls_msg_includes.is_empty() && self.secp_msg_includes.is_empty() {
            return FullTipset::new(tipset, None);
        }
        let block_count = tipset.blocks().len();
        let mut messages = vec![BlockMessages::default(); block_count];
        for (block, includes) in self.bls_msg_includes.iter().enumerate().take(block_count) {
            for &idx in includes {
                if let Some(cid) = self.bls_msgs.get(idx as usize) {
                    messages[block].bls.push(*cid);
                }
            }
        }
        for (block, includes) in self.secp_msg_includes.iter().enumerate().take(block_count) {
            for &idx in includes {
                if let Some(cid) = self.secp_msgs.get(idx as usize) {
                    messages[block].secp.push(*cid);
                }
            }
        }
        FullTipset::new(tipset, Some(messages))
    }
}

/// Status of a chainsync response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseStatus {
    /// Everything requested is included.
    Complete = 0,
    /// Only a prefix of the requested chain is included.
    Partial = 101,
    /// The peer does not know the requested tipset.
    BlockNotFound = 201,
    /// The peer refuses to serve the request.
    GoAway = 202,
    /// The peer failed internally.
    InternalError = 203,
    /// The request was malformed.
    BadRequest = 204,
}

impl Serialize for ResponseStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (*self as u64).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ResponseStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u64::deserialize(deserializer)? {
            0 => Ok(ResponseStatus::Complete),
            101 => Ok(ResponseStatus::Partial),
            201 => Ok(ResponseStatus::BlockNotFound),
            202 => Ok(ResponseStatus::GoAway),
            203 => Ok(ResponseStatus::InternalError),
            204 => Ok(ResponseStatus::BadRequest),
            other => Err(de::Error::custom(format!("invalid response status {other}"))),
        }
    }
}

/// Chainsync response: the requested tipset chain, requested tipset first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct ChainSyncResponse {
    /// Response status.
    pub status: ResponseStatus,
    /// Optional human-readable detail.
    pub message: String,
    /// The served chain, ordered from the requested tipset downward.
    pub chain: Vec<TipsetBundle>,
}
