#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
//! Branch-aware chain index.
//!
//! Chain history is a forest of branches: maximal linear runs of tipsets with
//! no internal fork. [`BranchGraph`] keeps the forest in memory with
//! fork/merge/split semantics and a projected root-to-head chain;
//! [`IndexStore`] is its durable, transactional projection plus per-tipset
//! sync state; [`ChainDb`] is the facade the rest of the node talks to,
//! pairing every graph mutation with a store transaction. [`ResultCache`]
//! holds write-once interpreter results keyed by tipset hash.
//!
//! Representing history as a branch forest (rather than a per-tipset parent
//! graph) makes the common "advance head by one tipset" operation an O(1)
//! metadata update and turns height lookups on the projected chain into a
//! range query.

pub mod branches;
pub use branches::{BranchGraph, HeadUpdate, StorePosition};

mod canonical;

pub mod store;
pub use store::{IndexStore, TipsetInfo};

pub mod chain_db;
pub use chain_db::{ChainDb, StoreOutcome};

pub mod results;
pub use results::{CachedOutcome, ResultCache};
