#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
//! Commonly used types for the cedar tipset chain node.
//!
//! The unit of chain progress is the [`Tipset`]: a sorted set of blocks at the
//! same height sharing the same parent set, identified by its [`TipsetKey`]
//! (the sorted block CIDs) and addressed everywhere by the 32-byte
//! [`TipsetHash`] derived from that key.
//!
//! Chain history is indexed as a forest of [`BranchInfo`] records: maximal
//! linear segments with no internal fork, linked by parent branch ids.

mod address;
pub use address::Address;

mod block_header;
pub use block_header::BlockHeader;

mod branch;
pub use branch::{BranchId, BranchInfo, SplitBranch, GENESIS_BRANCH, NO_BRANCH};

mod head_change;
pub use head_change::{HeadChange, HeadChangeKind};

mod interpreted;
pub use interpreted::InterpreterResult;

mod peer;
pub use peer::PeerId;

mod sync_state;
pub use sync_state::SyncState;

mod tipset;
pub use tipset::{BlockMessages, FullTipset, Tipset, TipsetError};

mod tipset_key;
pub use tipset_key::{tipset_hash, TipsetHash, TipsetKey, TIPSET_HASH_LENGTH};

mod weight;
pub use weight::{bigint_ser, Weight};

pub use cid::Cid;

/// Block height within the chain, starting at zero for genesis.
pub type Height = u64;
